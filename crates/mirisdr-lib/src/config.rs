//! Receiver defaults, persisted as TOML in the platform config directory.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::protocol::{
    BUFFER_LENGTH_ALIGN, DEFAULT_ADC_CLOCK_HZ, DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_LENGTH,
};
use crate::stream::StreamOptions;
use crate::tuner::{Crystal, GainSettings, plan_frequency};

/// Header comment prepended to saved config files.
const CONFIG_HEADER: &str = "# mirisdr configuration. Command-line flags override these values.\n\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Receiver to open, in enumeration order.
    #[serde(default)]
    pub device_index: usize,

    /// Center frequency in Hz. Default: 100 MHz.
    #[serde(default = "default_center_frequency")]
    pub center_frequency: u32,

    /// Sample rate in Hz. Recorded only; the ADC clock is fixed.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Tuner gain in tenths of a dB.
    #[serde(default)]
    pub gain: i32,

    #[serde(default)]
    pub manual_gain: bool,

    /// Isochronous transfers kept in flight.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,

    /// Bytes per transfer; must be a multiple of 512.
    #[serde(default = "default_buffer_length")]
    pub buffer_length: u32,
}

fn default_center_frequency() -> u32 {
    100_000_000
}
fn default_sample_rate() -> u32 {
    DEFAULT_ADC_CLOCK_HZ
}
fn default_buffer_count() -> u32 {
    DEFAULT_BUFFER_COUNT
}
fn default_buffer_length() -> u32 {
    DEFAULT_BUFFER_LENGTH
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_index: 0,
            center_frequency: default_center_frequency(),
            sample_rate: default_sample_rate(),
            gain: 0,
            manual_gain: false,
            buffer_count: default_buffer_count(),
            buffer_length: default_buffer_length(),
        }
    }
}

/// Problems [`Config::validate`] can report.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    ZeroBufferCount,
    MisalignedBufferLength(u32),
    ZeroSampleRate,
    /// The synthesizer cannot tune `hz`.
    UnsupportedFrequency { hz: u32, reason: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::ZeroBufferCount => write!(f, "buffer_count must be at least 1"),
            ValidationError::MisalignedBufferLength(len) => {
                write!(f, "buffer_length {len} is not a multiple of {BUFFER_LENGTH_ALIGN}")
            }
            ValidationError::ZeroSampleRate => write!(f, "sample_rate cannot be zero"),
            ValidationError::UnsupportedFrequency { hz, reason } => {
                write!(f, "center_frequency {hz}: {reason}")
            }
        }
    }
}

impl Config {
    /// Platform-specific config directory.
    pub fn dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("mirisdr"))
    }

    /// Full path to config file.
    pub fn path() -> Option<PathBuf> {
        Self::dir().map(|d| d.join("config.toml"))
    }

    /// Load config from disk, or return defaults if not found.
    pub fn load() -> Self {
        let (config, warnings) = Self::load_with_warnings();
        for w in &warnings {
            log::warn!("{w}");
        }
        config
    }

    /// Load config from an arbitrary path, returning the config and any parse warnings.
    ///
    /// A missing file yields defaults with no warning; an unparseable one
    /// yields defaults and one warning.
    pub fn load_from(path: &Path) -> (Self, Vec<String>) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, vec![]),
                Err(e) => {
                    let warning = format!(
                        "config parse error ({}), using defaults: {e}",
                        path.display()
                    );
                    (Self::default(), vec![warning])
                }
            },
            Err(_) => (Self::default(), vec![]),
        }
    }

    pub fn load_with_warnings() -> (Self, Vec<String>) {
        let Some(path) = Self::path() else {
            return (Self::default(), vec![]);
        };
        Self::load_from(&path)
    }

    /// Save atomically: temp file, then rename.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let serialized = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        let contents = format!("{CONFIG_HEADER}{serialized}");
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, &contents)?;
        if std::fs::rename(&tmp, path).is_err() {
            // Cross-filesystem rename; write in place instead.
            let result = std::fs::write(path, &contents);
            let _ = std::fs::remove_file(&tmp);
            return result;
        }
        Ok(())
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = Self::path() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "No config directory",
            ));
        };
        self.save_to(&path)
    }

    /// Transfer pool overrides for a streaming session.
    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            buffer_count: Some(self.buffer_count),
            buffer_length: Some(self.buffer_length),
        }
    }

    /// Validate the entire config, collecting all errors.
    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.buffer_count == 0 {
            errors.push(ValidationError::ZeroBufferCount);
        }
        if self.buffer_length == 0 || self.buffer_length % BUFFER_LENGTH_ALIGN != 0 {
            errors.push(ValidationError::MisalignedBufferLength(self.buffer_length));
        }
        if self.sample_rate == 0 {
            errors.push(ValidationError::ZeroSampleRate);
        }
        if let Err(e) = plan_frequency(
            self.center_frequency,
            Crystal::Xtal24M,
            GainSettings::default(),
        ) {
            errors.push(ValidationError::UnsupportedFrequency {
                hz: self.center_frequency,
                reason: e.to_string(),
            });
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
