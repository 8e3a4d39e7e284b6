//! Tuner abstraction.
//!
//! The bridge forwards tuner words over its 3-wire register, so a tuner only
//! needs a [`RegisterBus`]. Today the only chip is the MSi001.

pub mod msi001;

use std::fmt;

use crate::device::{DeviceError, RegisterBus};

pub use msi001::{BandMode, Crystal, GainSettings, Msi001, TunerState, plan_frequency};

/// Supported gain steps, in tenths of a dB.
pub const MSI001_GAINS: &[i32] = &[
    -10, 15, 40, 65, 90, 115, 140, 165, 190, 215, 240, 290, 340, 420, 430, 450, 470, 490,
];

#[derive(Debug)]
pub enum TunerError {
    /// The band needs an IF offset nobody has worked out yet.
    IfPathUnresolved { mode: &'static str },
    /// The PLL integer for this frequency does not fit its register field.
    OutOfRange { hz: u32 },
    Bus(DeviceError),
}

impl fmt::Display for TunerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunerError::IfPathUnresolved { mode } => {
                write!(f, "{mode}: IF offset synthesis is not implemented")
            }
            TunerError::OutOfRange { hz } => {
                write!(f, "{hz} Hz is outside the synthesizer range")
            }
            TunerError::Bus(e) => write!(f, "Tuner write failed: {e}"),
        }
    }
}

impl std::error::Error for TunerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TunerError::Bus(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for TunerError {
    fn from(e: DeviceError) -> Self {
        TunerError::Bus(e)
    }
}

pub type Result<T> = std::result::Result<T, TunerError>;

/// A tuner chip behind the bridge.
///
/// Every register-touching call takes the bus explicitly; the tuner itself
/// only keeps the state it last programmed.
pub trait Tuner: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self, bus: &dyn RegisterBus) -> Result<()>;

    fn exit(&mut self, bus: &dyn RegisterBus) -> Result<()>;

    /// Tune to `hz`. Returns the frequency the synthesizer actually produces.
    ///
    /// On error nothing has been written for this call, unless the bus
    /// itself failed part way.
    fn set_frequency(&mut self, bus: &dyn RegisterBus, hz: u32) -> Result<u32>;

    fn set_bandwidth(&mut self, bus: &dyn RegisterBus, hz: u32) -> Result<()>;

    /// Gain in tenths of a dB.
    fn set_gain(&mut self, bus: &dyn RegisterBus, gain: i32) -> Result<()>;

    fn set_gain_mode(&mut self, bus: &dyn RegisterBus, manual: bool) -> Result<()>;

    fn gains(&self) -> &'static [i32];

    /// Last successfully programmed state, if any.
    fn state(&self) -> Option<&TunerState>;
}
