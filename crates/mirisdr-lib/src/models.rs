//! Known MSi2500-based receivers.
//!
//! Matching is by exact vendor/product pair. Anything else on the bus is
//! ignored, even if it carries a Mirics chip.

use serde::Serialize;

/// A supported USB receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KnownDevice {
    pub vid: u16,
    pub pid: u16,
    pub name: &'static str,
}

pub static KNOWN_DEVICES: &[KnownDevice] = &[
    KnownDevice {
        vid: 0x1df7,
        pid: 0x2500,
        name: "Mirics MSi2500 default (e.g. VTX3D card)",
    },
    KnownDevice {
        vid: 0x04bb,
        pid: 0x0537,
        name: "IO-DATA GV-TV100 stick",
    },
];

/// Look up a vendor/product pair in [`KNOWN_DEVICES`].
pub fn find_known_device(vid: u16, pid: u16) -> Option<&'static KnownDevice> {
    KNOWN_DEVICES.iter().find(|d| d.vid == vid && d.pid == pid)
}
