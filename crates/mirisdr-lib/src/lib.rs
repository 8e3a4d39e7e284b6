//! mirisdr: user-space driver for Mirics MSi2500/MSi001 USB SDR receivers.

pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod models;
pub mod protocol;
pub mod session;
pub mod stream;
pub mod tuner;

pub use error::MirisdrError;
pub use session::{SampleStream, Session};
