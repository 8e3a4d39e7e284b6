//! `plan` subcommand: dry-run the synthesizer for one frequency.

use super::{
    Crystal, GainSettings, PlanOutput, RegisterJson, Result, TunerState, format_hz, kv, kv_indent,
    kv_width, to_json, tuner,
};

fn build_plan(freq: u32) -> Result<PlanOutput> {
    let state = tuner::plan_frequency(freq, Crystal::Xtal24M, GainSettings::default())?;
    Ok(plan_output(freq, &state))
}

fn plan_output(freq: u32, state: &TunerState) -> PlanOutput {
    let pll = state.pll();
    PlanOutput {
        requested: freq,
        mode: state.mode.name().to_string(),
        registers: state
            .write_sequence()
            .iter()
            .map(|&(reg, value)| RegisterJson {
                reg,
                value: format!("0x{value:06x}"),
            })
            .collect(),
        integer: pll.integer,
        fraction: pll.fraction,
        threshold: pll.threshold,
        synthesized: state.synthesized_frequency(),
        step: state.frequency_step(),
    }
}

pub(super) fn cmd_plan(freq: u32, json: bool) -> Result<()> {
    let plan = build_plan(freq)?;

    if json {
        println!("{}", to_json(&plan)?);
        return Ok(());
    }

    let w = kv_width(
        &["Requested:", "Band mode:", "Registers:", "PLL:", "Synthesized:", "Step:"],
        &["reg0:", "int:", "frac:", "thresh:"],
    );
    kv("Requested:", format_hz(f64::from(plan.requested)), w);
    kv("Band mode:", &plan.mode, w);
    println!("Registers:");
    for r in &plan.registers {
        kv_indent(&format!("reg{}:", r.reg), &r.value, w);
    }
    println!("PLL:");
    kv_indent("int:", plan.integer, w);
    kv_indent("frac:", plan.fraction, w);
    kv_indent("thresh:", plan.threshold, w);
    kv("Synthesized:", format_hz(plan.synthesized), w);
    kv("Step:", format_hz(plan.step), w);

    Ok(())
}
