//! Protocol constants for the MSi2500 USB bridge and MSi001 tuner.
//!
//! Register values were lifted from USB captures of the vendor driver.
//! Most of the baseband init sequence is undocumented; the values are
//! replayed verbatim.

// ── Control transfers ──

/// bmRequestType for every vendor write: vendor, host-to-device, endpoint recipient.
pub const CTRL_OUT_REQUEST_TYPE: u8 = 0x42;

/// bRequest used to write one 24-bit MSi2500 register.
pub const REQUEST_WRITE_REGISTER: u8 = 0x41;

/// bRequest sent once before the baseband init sequence.
pub const REQUEST_BASEBAND_RESET: u8 = 0x43;

/// Timeout for a single control transfer.
pub const CTRL_TIMEOUT_MS: u64 = 300;

/// Register values are 24 bits wide on the wire.
pub const REGISTER_VALUE_MASK: u32 = 0x00FF_FFFF;

/// Pack a register write into `(wValue, wIndex)`.
///
/// The low byte of the value rides in the high byte of `wValue` next to
/// the register index; the remaining 16 bits go into `wIndex`.
pub const fn pack_register_write(reg: u8, value: u32) -> (u16, u16) {
    let w_value = ((value & 0xff) << 8) as u16 | reg as u16;
    let w_index = ((value >> 8) & 0xffff) as u16;
    (w_value, w_index)
}

// ── Interfaces and endpoints ──

/// The only interface the bridge exposes.
pub const STREAM_INTERFACE: u8 = 0;

/// Alternate setting that enables the isochronous endpoint.
pub const STREAM_ALT_SETTING: u8 = 1;

/// Isochronous IN endpoint carrying ADC samples.
pub const ISO_ENDPOINT: u8 = 0x81;

/// Isochronous transfers never time out; cancellation ends them.
pub const ISO_TIMEOUT_MS: u32 = 0;

// ── Streaming defaults ──

pub const DEFAULT_BUFFER_COUNT: u32 = 32;
pub const DEFAULT_ISO_PACKETS: u32 = 8;
pub const DEFAULT_PACKET_LENGTH: u32 = 3072;
pub const DEFAULT_BUFFER_LENGTH: u32 = DEFAULT_PACKET_LENGTH * DEFAULT_ISO_PACKETS;

/// Buffer lengths must be a whole number of 512-byte units.
pub const BUFFER_LENGTH_ALIGN: u32 = 512;

/// Poll primitive timeout. Only bounds how long cancellation takes to be seen.
pub const POLL_TIMEOUT_MS: u64 = 1000;

/// Nominal ADC clock until sample-rate programming is understood.
pub const DEFAULT_ADC_CLOCK_HZ: u32 = 4_000_000;

// ── MSi2500 registers ──

/// Register that forwards its value to the MSi001 tuner over the 3-wire bus.
pub const REG_TUNER_BUS: u8 = 0x09;

/// LED / EEPROM chip-select register.
pub const REG_LED_CONTROL: u8 = 0x08;

/// Lock LED on, EEPROM deselected.
pub const LED_CONTROL_LOCK_ON: u32 = 0x00_6680;

/// Lock LED off.
pub const LED_CONTROL_LOCK_OFF: u32 = 0x00_6600;

/// Baseband bring-up, written in order after [`REQUEST_BASEBAND_RESET`].
///
/// Registers 0x04/0x03 select a 9.14 MS/s ADC rate; 0x07 configures the IF
/// filter and the 10-bit packing scheme the decoder expects.
pub const BASEBAND_INIT: &[(u8, u32)] = &[
    (0x05, 0x00_000c),
    (0x00, 0x00_0200),
    (0x02, 0x00_4801),
    (0x07, 0x00_00a5),
    (0x04, 0x04_923d),
    (0x03, 0x01_c907),
    (0x13, 0x00_6b46),
    (0x14, 0x00_00f5),
    (0x12, 0x80_2800),
    (0x29, 0x03_2201),
    (REG_LED_CONTROL, LED_CONTROL_LOCK_ON),
];

// ── MSi001 tuner ──

/// Tuner bring-up words, each sent through [`REG_TUNER_BUS`].
/// The tuner register number lives in the low nibble.
pub const TUNER_INIT: &[u32] = &[0x00_94b3, 0x00_800e, 0x20_0256, 0x01_4281];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_register_write_splits_value() {
        let (w_value, w_index) = pack_register_write(0x09, 0x12_3456);
        assert_eq!(w_value, 0x5609);
        assert_eq!(w_index, 0x1234);
    }

    #[test]
    fn pack_register_write_ignores_bits_above_24() {
        let (w_value, w_index) = pack_register_write(0x00, 0xFF12_3456);
        assert_eq!(w_value, 0x5600);
        // wIndex keeps value bits 8..24 only
        assert_eq!(w_index, 0x1234);
    }

    #[test]
    fn default_buffer_length_is_aligned() {
        assert_eq!(DEFAULT_BUFFER_LENGTH, 24576);
        assert_eq!(DEFAULT_BUFFER_LENGTH % BUFFER_LENGTH_ALIGN, 0);
    }

    #[test]
    fn baseband_init_ends_with_lock_led() {
        let last = BASEBAND_INIT.last().unwrap();
        assert_eq!(*last, (REG_LED_CONTROL, LED_CONTROL_LOCK_ON));
    }

    #[test]
    fn init_values_fit_24_bits() {
        for &(_, value) in BASEBAND_INIT {
            assert_eq!(value & !REGISTER_VALUE_MASK, 0);
        }
        for &value in TUNER_INIT {
            assert_eq!(value & !REGISTER_VALUE_MASK, 0);
        }
    }
}
