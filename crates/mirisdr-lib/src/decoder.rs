//! Sample decoder for the MSi2500 packed 10-bit stream.
//!
//! The bridge delivers 1024-byte blocks:
//!
//! ```text
//! [ header 16 ][ group 164 ] x 6 [ reserved 24 ]
//! group = [ 10-byte subgroup ] x 16 [ shift flags: u32 LE ]
//! ```
//!
//! Each subgroup packs eight 10-bit samples. Samples are placed in the top
//! bits of an `i16`; the flag word then carries one 2-bit code per subgroup
//! selecting an arithmetic right shift (0 → 2, 1 → 1, 2/3 → none) that
//! undoes the bridge's gain staging.
//!
//! The header carries a 24-bit rolling sample address and a parity bit.
//! Both feed integrity diagnostics; neither ever stops decoding.

use std::fmt;

pub const BLOCK_SIZE: usize = 1024;
pub const HEADER_SIZE: usize = 16;
pub const GROUPS_PER_BLOCK: usize = 6;
pub const SUBGROUPS_PER_GROUP: usize = 16;
pub const SUBGROUP_SIZE: usize = 10;
pub const SAMPLES_PER_SUBGROUP: usize = 8;
pub const FLAG_SIZE: usize = 4;
pub const GROUP_SIZE: usize = SUBGROUPS_PER_GROUP * SUBGROUP_SIZE + FLAG_SIZE;
pub const TRAILER_SIZE: usize = 24;

/// Samples produced by one full block.
pub const SAMPLES_PER_BLOCK: usize = GROUPS_PER_BLOCK * SUBGROUPS_PER_GROUP * SAMPLES_PER_SUBGROUP;

const ADDRESS_MASK: u32 = 0x00FF_FFFF;
const PARITY_BIT: u8 = 0x40;

/// Upper bound on samples decoded from `len` raw bytes.
pub const fn max_samples(len: usize) -> usize {
    (len / BLOCK_SIZE) * SAMPLES_PER_BLOCK
}

/// Integrity diagnostic raised while decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeEvent {
    /// The block address did not continue the previous block.
    LostSamples { expected: u32, found: u32 },
    /// The header parity bit changed from the previous block.
    HeaderParity { header: [u8; HEADER_SIZE] },
}

impl fmt::Display for DecodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeEvent::LostSamples { expected, found } => {
                write!(f, "lost samples: expected address 0x{expected:06x}, got 0x{found:06x}")
            }
            DecodeEvent::HeaderParity { header } => {
                write!(f, "header parity anomaly:")?;
                for b in header {
                    write!(f, " {b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// What one `decode` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    pub blocks: usize,
    pub samples: usize,
    pub events: Vec<DecodeEvent>,
}

impl DecodeOutcome {
    pub fn lost_sample_events(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, DecodeEvent::LostSamples { .. }))
            .count()
    }

    pub fn parity_events(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, DecodeEvent::HeaderParity { .. }))
            .count()
    }
}

/// Stateful decoder. The only state is sequence tracking, so one decoder
/// belongs to one device session.
#[derive(Debug, Default)]
pub struct SampleDecoder {
    /// Address the next block should carry. `None` until the first block.
    expected_address: Option<u32>,
    /// Inverse of the last parity bit seen; starts as if the bit was set.
    header_flag: bool,
}

impl SampleDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget sequence tracking, e.g. between streaming sessions.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn expected_address(&self) -> Option<u32> {
        self.expected_address
    }

    /// Decode every complete block in `raw`, appending samples to `out`.
    ///
    /// A trailing partial block is ignored.
    pub fn decode(&mut self, raw: &[u8], out: &mut Vec<i16>) -> DecodeOutcome {
        let mut outcome = DecodeOutcome::default();
        let start = out.len();

        for block in raw.chunks_exact(BLOCK_SIZE) {
            let Some((header, body)) = block.split_first_chunk::<HEADER_SIZE>() else {
                continue;
            };
            self.track_header(header, &mut outcome.events);

            for group in body[..GROUPS_PER_BLOCK * GROUP_SIZE].chunks_exact(GROUP_SIZE) {
                decode_group(group, out);
            }
            outcome.blocks += 1;
        }

        outcome.samples = out.len() - start;
        outcome
    }

    fn track_header(&mut self, header: &[u8; HEADER_SIZE], events: &mut Vec<DecodeEvent>) {
        let address = u32::from(header[1]) | u32::from(header[2]) << 8 | u32::from(header[3]) << 16;

        if let Some(expected) = self.expected_address
            && expected != address
        {
            let event = DecodeEvent::LostSamples {
                expected,
                found: address,
            };
            log::warn!("{event}");
            events.push(event);
        }
        let advance = u32::from(header[0] >> 7) + 1;
        self.expected_address = Some(address.wrapping_add(advance) & ADDRESS_MASK);

        let parity = header[5] & PARITY_BIT != 0;
        if parity == self.header_flag {
            let event = DecodeEvent::HeaderParity { header: *header };
            log::warn!("{event}");
            events.push(event);
        }
        self.header_flag = !parity;
    }
}

/// Unpack 16 subgroups and apply the group's shift flags.
fn decode_group(group: &[u8], out: &mut Vec<i16>) {
    let (packed, flags) = group.split_at(SUBGROUPS_PER_GROUP * SUBGROUP_SIZE);
    let mut flags = u32::from_le_bytes([flags[0], flags[1], flags[2], flags[3]]);

    for subgroup in packed.chunks_exact(SUBGROUP_SIZE) {
        let shift = match flags & 0x3 {
            0 => 2,
            1 => 1,
            _ => 0,
        };
        for half in subgroup.chunks_exact(5) {
            for sample in unpack_four(half) {
                out.push(sample >> shift);
            }
        }
        flags >>= 2;
    }
}

/// Four 10-bit samples from five bytes, left-justified in 16 bits.
fn unpack_four(b: &[u8]) -> [i16; 4] {
    let b: [u16; 5] = [b[0].into(), b[1].into(), b[2].into(), b[3].into(), b[4].into()];
    [
        (b[0] << 6 | (b[1] & 0x03) << 14) as i16,
        ((b[1] & 0xfc) << 4 | (b[2] & 0x0f) << 12) as i16,
        ((b[2] & 0xf0) << 2 | (b[3] & 0x3f) << 10) as i16,
        ((b[3] & 0xc0) | b[4] << 8) as i16,
    ]
}
