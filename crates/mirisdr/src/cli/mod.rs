//! CLI subcommands: enumeration, device info, synthesizer planning, capture.

mod config_cmd;
mod devices;
mod info;
mod plan;
mod rx;

use std::path::Path;

use clap::Subcommand;
use serde::Serialize;

pub(super) use crate::{ACTIVE_STREAM, RUNNING};
pub(super) use mirisdr_lib::config::Config;
pub(super) use mirisdr_lib::device::{self, DiscoveredDevice, UsbStrings};
pub(super) use mirisdr_lib::error::{MirisdrError, Result};
pub(super) use mirisdr_lib::session::{SampleRateUpdate, Session};
pub(super) use mirisdr_lib::stream::{CancelHandle, StreamOptions, StreamReport};
pub(super) use mirisdr_lib::tuner::{self, Crystal, GainSettings, TunerState};

const PADDING: usize = 2;

/// Compute alignment width for a command's key-value output.
/// Ensures at least PADDING spaces after the longest key in either level,
/// with top-level and indent values aligned to the same column.
pub(super) fn kv_width(top: &[&str], indent: &[&str]) -> usize {
    let top_max = top.iter().map(|k| k.len()).max().unwrap_or(0);
    let indent_max = indent.iter().map(|k| k.len()).max().unwrap_or(0);
    let top_need = if top.is_empty() { 0 } else { top_max + PADDING };
    // Indent keys lose 2 chars of inner width to the "  " prefix
    let indent_need = if indent.is_empty() {
        0
    } else {
        indent_max + PADDING + 2
    };
    top_need.max(indent_need)
}

pub(super) fn format_kv(key: &str, value: impl std::fmt::Display, w: usize) -> String {
    format!("{key:<width$}{value}", width = w)
}

pub(super) fn kv(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("{}", format_kv(key, value, w));
}

pub(super) fn kv_indent(key: &str, value: impl std::fmt::Display, w: usize) {
    println!("  {key:<width$}{value}", width = w - 2);
}

/// Hz as a short human string ("100.000 MHz").
pub(super) fn format_hz(hz: f64) -> String {
    if hz >= 1e9 {
        format!("{:.6} GHz", hz / 1e9)
    } else if hz >= 1e6 {
        format!("{:.3} MHz", hz / 1e6)
    } else if hz >= 1e3 {
        format!("{:.3} kHz", hz / 1e3)
    } else {
        format!("{hz:.3} Hz")
    }
}

/// Gain in tenths of a dB as "29.0 dB".
pub(super) fn format_gain(tenths: i32) -> String {
    format!("{:.1} dB", f64::from(tenths) / 10.0)
}

pub(super) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| MirisdrError::Config(format!("JSON encoding failed: {e}")))
}

/// Load config from `custom_path` if given, else from the platform default.
pub(super) fn load_config(custom_path: Option<&Path>) -> Config {
    match custom_path {
        Some(path) => {
            let (config, warnings) = Config::load_from(path);
            for w in &warnings {
                log::warn!("{w}");
            }
            config
        }
        None => Config::load(),
    }
}

// ── JSON output structs ──

#[derive(Serialize)]
pub(super) struct DevicesOutput {
    pub count: usize,
    pub devices: Vec<DiscoveredDevice>,
}

#[derive(Serialize)]
pub(super) struct InfoOutput {
    pub index: usize,
    pub name: String,
    pub usb: UsbStrings,
    pub tuner: String,
    pub adc_clock: u32,
    pub gains: Vec<i32>,
}

#[derive(Serialize)]
pub(super) struct PlanOutput {
    pub requested: u32,
    pub mode: String,
    /// Register words in write order (0, 5, 2, 1), as hex strings.
    pub registers: Vec<RegisterJson>,
    pub integer: u32,
    pub fraction: u32,
    pub threshold: u32,
    pub synthesized: f64,
    pub step: f64,
}

#[derive(Serialize)]
pub(super) struct RegisterJson {
    pub reg: u8,
    pub value: String,
}

#[derive(Serialize)]
pub(super) struct RxOutput {
    pub output: String,
    pub center_frequency: u32,
    pub sample_rate: SampleRateUpdate,
    pub samples_written: u64,
    pub interrupted: bool,
    pub report: StreamReport,
}

#[derive(Serialize)]
pub(super) struct ConfigOutput {
    pub config_file: Option<String>,
    pub config_file_exists: bool,
    pub settings: Config,
    pub problems: Vec<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// List attached Mirics receivers
    Devices,

    /// Open a receiver and show its USB strings, tuner and gains
    Info {
        /// Receiver to open, in enumeration order (default: from config)
        #[arg(long)]
        index: Option<usize>,
    },

    /// Compute tuner registers for a frequency (no hardware required)
    Plan {
        /// Center frequency in Hz
        #[arg(long)]
        freq: u32,
    },

    /// Stream raw 16-bit samples to a file, or to stdout with "-"
    Rx {
        /// Output path, or "-" for stdout
        output: String,
        /// Center frequency in Hz (default: from config)
        #[arg(long)]
        freq: Option<u32>,
        /// Sample rate in Hz (default: from config)
        #[arg(long)]
        rate: Option<u32>,
        /// Manual tuner gain in tenths of a dB
        #[arg(long, allow_hyphen_values = true)]
        gain: Option<i32>,
        /// Stop after this many samples
        #[arg(long)]
        samples: Option<u64>,
        /// Isochronous transfers kept in flight (default: from config)
        #[arg(long)]
        buffers: Option<u32>,
        /// Receiver to open, in enumeration order (default: from config)
        #[arg(long)]
        index: Option<usize>,
    },

    /// Show current configuration and file paths
    Config,
}

pub fn run(cmd: Command, json: bool, config_path: Option<&Path>) -> Result<()> {
    match cmd {
        Command::Devices => devices::cmd_devices(json),
        Command::Info { index } => info::cmd_info(index, json, config_path),
        Command::Plan { freq } => plan::cmd_plan(freq, json),
        Command::Rx {
            output,
            freq,
            rate,
            gain,
            samples,
            buffers,
            index,
        } => rx::cmd_rx(
            rx::RxArgs {
                output,
                freq,
                rate,
                gain,
                samples,
                buffers,
                index,
            },
            json,
            config_path,
        ),
        Command::Config => config_cmd::cmd_config(json, config_path),
    }
}
