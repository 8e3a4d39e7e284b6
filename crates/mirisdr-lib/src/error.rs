//! Unified error type for the mirisdr-lib crate.
//!
//! [`MirisdrError`] wraps the module errors (`DeviceError`, `TunerError`,
//! `StreamError`) plus I/O, configuration and known-gap errors. `From` impls
//! let `?` cross module boundaries.

use std::fmt;

use crate::device::DeviceError;
use crate::stream::StreamError;
use crate::tuner::TunerError;

/// Unified error type for mirisdr-lib operations.
#[derive(Debug)]
pub enum MirisdrError {
    /// USB enumeration, open, claim or control-transfer failure.
    Device(DeviceError),
    /// Synthesizer could not produce a register set.
    Tuner(TunerError),
    /// Streaming session failed to start or ended on a fatal fault.
    Stream(StreamError),
    /// Standard I/O error (config persistence, sample output).
    Io(std::io::Error),
    /// Configuration validation error.
    Config(String),
    /// Operation the hardware path does not implement yet.
    Unsupported(&'static str),
}

impl fmt::Display for MirisdrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirisdrError::Device(e) => write!(f, "{e}"),
            MirisdrError::Tuner(e) => write!(f, "{e}"),
            MirisdrError::Stream(e) => write!(f, "{e}"),
            MirisdrError::Io(e) => write!(f, "I/O error: {e}"),
            MirisdrError::Config(e) => write!(f, "Config error: {e}"),
            MirisdrError::Unsupported(what) => write!(f, "Not supported: {what}"),
        }
    }
}

impl std::error::Error for MirisdrError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MirisdrError::Device(e) => Some(e),
            MirisdrError::Tuner(e) => Some(e),
            MirisdrError::Stream(e) => Some(e),
            MirisdrError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DeviceError> for MirisdrError {
    fn from(e: DeviceError) -> Self {
        MirisdrError::Device(e)
    }
}

impl From<TunerError> for MirisdrError {
    fn from(e: TunerError) -> Self {
        MirisdrError::Tuner(e)
    }
}

impl From<StreamError> for MirisdrError {
    fn from(e: StreamError) -> Self {
        MirisdrError::Stream(e)
    }
}

impl From<std::io::Error> for MirisdrError {
    fn from(e: std::io::Error) -> Self {
        MirisdrError::Io(e)
    }
}

/// Crate-level Result alias using [`MirisdrError`].
pub type Result<T> = std::result::Result<T, MirisdrError>;
