//! `config` subcommand: show the effective configuration and where it came from.

use std::path::Path;

use super::{Config, ConfigOutput, Result, format_gain, format_hz, kv, kv_indent, kv_width, to_json};

pub(super) fn cmd_config(json: bool, custom_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(custom_path);
    let config_path = custom_path.map(|p| p.to_path_buf()).or_else(Config::path);
    let config_exists = config_path.as_ref().is_some_and(|p| p.exists());
    let problems: Vec<String> = match config.validate() {
        Ok(()) => Vec::new(),
        Err(errors) => errors.iter().map(ToString::to_string).collect(),
    };

    if json {
        let output = ConfigOutput {
            config_file: config_path.as_ref().map(|p| p.display().to_string()),
            config_file_exists: config_exists,
            settings: config,
            problems,
        };
        println!("{}", to_json(&output)?);
        return Ok(());
    }

    let w = kv_width(
        &["Config file:"],
        &[
            "device_index:",
            "center_frequency:",
            "sample_rate:",
            "gain:",
            "manual_gain:",
            "buffer_count:",
            "buffer_length:",
        ],
    );

    match &config_path {
        Some(p) => {
            if config_exists {
                kv("Config file:", format_args!("{} (loaded)", p.display()), w);
            } else {
                kv(
                    "Config file:",
                    format_args!("{} (not found, using defaults)", p.display()),
                    w,
                );
            }
        }
        None => kv("Config file:", "(no config directory)", w),
    }
    println!();

    println!("Settings:");
    kv_indent("device_index:", config.device_index, w);
    kv_indent(
        "center_frequency:",
        format_args!(
            "{} ({})",
            config.center_frequency,
            format_hz(f64::from(config.center_frequency))
        ),
        w,
    );
    kv_indent("sample_rate:", config.sample_rate, w);
    kv_indent("gain:", format_gain(config.gain), w);
    kv_indent("manual_gain:", config.manual_gain, w);
    kv_indent("buffer_count:", config.buffer_count, w);
    kv_indent("buffer_length:", config.buffer_length, w);

    if !problems.is_empty() {
        println!();
        println!("Problems:");
        for p in &problems {
            println!("  {p}");
        }
    }
    Ok(())
}
