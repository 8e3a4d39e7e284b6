//! `info` subcommand: open a receiver and describe it.

use std::path::Path;

use super::{InfoOutput, Result, Session, format_gain, format_hz, kv, kv_indent, kv_width, to_json};

pub(super) fn cmd_info(index: Option<usize>, json: bool, config_path: Option<&Path>) -> Result<()> {
    let index = index.unwrap_or_else(|| super::load_config(config_path).device_index);
    let session = Session::open(index)?;
    let usb = session.usb_strings()?;

    let output = InfoOutput {
        index,
        name: session.name().to_string(),
        usb,
        tuner: session.tuner_name().to_string(),
        adc_clock: session.adc_clock(),
        gains: session.tuner_gains().to_vec(),
    };
    session.close()?;

    if json {
        println!("{}", to_json(&output)?);
        return Ok(());
    }

    let w = kv_width(
        &["Device:", "Tuner:", "ADC clock:", "Gains:"],
        &["Manufacturer:", "Product:", "Serial:"],
    );
    kv("Device:", format_args!("[{}] {}", output.index, output.name), w);
    let unknown = |s: &Option<String>| s.clone().unwrap_or_else(|| "(none)".into());
    kv_indent("Manufacturer:", unknown(&output.usb.manufacturer), w);
    kv_indent("Product:", unknown(&output.usb.product), w);
    kv_indent("Serial:", unknown(&output.usb.serial), w);
    kv("Tuner:", &output.tuner, w);
    kv("ADC clock:", format_hz(f64::from(output.adc_clock)), w);
    let gains: Vec<String> = output.gains.iter().map(|&g| format_gain(g)).collect();
    kv("Gains:", gains.join(", "), w);

    Ok(())
}
