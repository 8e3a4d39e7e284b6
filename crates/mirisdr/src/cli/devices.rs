//! `devices` subcommand: list attached receivers.

use super::{DevicesOutput, Result, device, to_json};

pub(super) fn cmd_devices(json: bool) -> Result<()> {
    let devices = device::enumerate_devices();

    if json {
        let output = DevicesOutput {
            count: devices.len(),
            devices,
        };
        println!("{}", to_json(&output)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No Mirics devices found.");
        return Ok(());
    }

    println!(
        "Found {} Mirics device{}:",
        devices.len(),
        if devices.len() == 1 { "" } else { "s" }
    );
    println!();

    for dev in &devices {
        println!("  [{}] {}", dev.index, dev.name);
        println!("      Path:   {}", dev.path());
        if let Some(ref serial) = dev.serial {
            println!("      Serial: {serial}");
        }
    }

    Ok(())
}
