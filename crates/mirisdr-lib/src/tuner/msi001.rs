//! MSi001 tuner: band selection and fractional-N synthesizer registers.
//!
//! A frequency set writes four tuner words through the bridge:
//!
//! | reg | contents                                          |
//! |-----|---------------------------------------------------|
//! | 0   | band mode, IF filter mode/bandwidth, crystal      |
//! | 5   | PLL fractional threshold                          |
//! | 2   | PLL integer and fractional word                   |
//! | 1   | baseband/mixer/LNA gain reduction, DC calibration |
//!
//! All values are computed before anything is written.

use serde::Serialize;

use super::{MSI001_GAINS, Result, Tuner, TunerError};
use crate::device::RegisterBus;
use crate::protocol::{REG_TUNER_BUS, TUNER_INIT};

// ── Register layout ──

const R0_FIL_MODE_SHIFT: u32 = 12;
const R0_FIL_BW_SHIFT: u32 = 14;
const R0_XTAL_SEL_SHIFT: u32 = 17;

const FIL_MODE_450K_IF: u32 = 0x2;
const FIL_MODE_ZERO_IF: u32 = 0x3;
const FIL_BW_AM: u32 = 0x1;
const FIL_BW_ZERO_IF: u32 = 0x7;

const R5_BASE: u32 = 0x28 << 16;
const R5_THRESH_SHIFT: u32 = 4;

const R2_FRAC_SHIFT: u32 = 4;
const R2_INT_SHIFT: u32 = 16;
const R2_INT_MASK: u32 = 0x3f;
const FIELD_12_MASK: u32 = 0xfff;

const R1_BBGAIN_SHIFT: u32 = 4;
const R1_BBGAIN_MASK: u8 = 0x3f;
const R1_MIXBU_SHIFT: u32 = 10;
const R1_MIXL_SHIFT: u32 = 12;
const R1_LNAGR_SHIFT: u32 = 13;
const R1_DCCAL_SHIFT: u32 = 14;
/// Continuous DC calibration, no speed-up.
const R1_DCCAL: u32 = 0x05;

/// Target size of one fractional PLL step, at RF.
const FRACTIONAL_STEP_HZ: u64 = 1_000_000;

// ── Band modes ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BandMode {
    Am1,
    /// Present in the chip's mode table; no frequency selects it.
    Am2,
    Vhf,
    Band3,
    Band45,
    LBand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandModeInfo {
    pub mode: BandMode,
    /// Register-0 mode bits, MSB first.
    pub bits: &'static str,
    pub value: u8,
    pub name: &'static str,
    pub lo_divider: u32,
}

pub static BAND_MODES: [BandModeInfo; 6] = [
    BandModeInfo { mode: BandMode::Am1, bits: "01100001", value: 0x61, name: "AM_MODE1", lo_divider: 16 },
    BandModeInfo { mode: BandMode::Am2, bits: "11100001", value: 0xe1, name: "AM_MODE2", lo_divider: 16 },
    BandModeInfo { mode: BandMode::Vhf, bits: "01000010", value: 0x42, name: "VHF_MODE", lo_divider: 32 },
    BandModeInfo { mode: BandMode::Band3, bits: "01000100", value: 0x44, name: "B3_MODE", lo_divider: 16 },
    BandModeInfo { mode: BandMode::Band45, bits: "01001000", value: 0x48, name: "B45_MODE", lo_divider: 4 },
    BandModeInfo { mode: BandMode::LBand, bits: "01010000", value: 0x50, name: "BL_MODE", lo_divider: 2 },
];

/// Upper band edges (exclusive). Anything above the last edge is L-band.
const BAND_EDGES: [(u32, BandMode); 4] = [
    (30_000_000, BandMode::Am1),
    (140_000_000, BandMode::Vhf),
    (300_000_000, BandMode::Band3),
    (970_000_000, BandMode::Band45),
];

impl BandMode {
    /// Band for an RF frequency. Edges belong to the higher band.
    pub fn select(hz: u32) -> Self {
        BAND_EDGES
            .iter()
            .find(|(edge, _)| hz < *edge)
            .map_or(BandMode::LBand, |&(_, mode)| mode)
    }

    pub fn info(self) -> &'static BandModeInfo {
        &BAND_MODES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn is_am(self) -> bool {
        matches!(self, BandMode::Am1 | BandMode::Am2)
    }
}

// ── Crystal references ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Crystal {
    Xtal19_2M,
    Xtal22M,
    /// Selector 2. Boards fitted so far run it at 24.000 MHz.
    Xtal24M,
    Xtal26M,
    Xtal38_4M,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceFrequency {
    pub xtal_hz: u32,
    /// First PLL reference.
    pub fref1_hz: u32,
    /// First IF, used by the AM up-conversion path.
    pub fif1_hz: u32,
}

pub static REFERENCE_FREQUENCIES: [ReferenceFrequency; 5] = [
    ReferenceFrequency { xtal_hz: 19_200_000, fref1_hz: 19_200_000, fif1_hz: 134_400_000 },
    ReferenceFrequency { xtal_hz: 22_000_000, fref1_hz: 22_000_000, fif1_hz: 132_000_000 },
    ReferenceFrequency { xtal_hz: 24_000_000, fref1_hz: 24_000_000, fif1_hz: 120_000_000 },
    ReferenceFrequency { xtal_hz: 26_000_000, fref1_hz: 26_000_000, fif1_hz: 130_000_000 },
    ReferenceFrequency { xtal_hz: 38_400_000, fref1_hz: 19_200_000, fif1_hz: 134_400_000 },
];

impl Crystal {
    pub fn reference(self) -> &'static ReferenceFrequency {
        &REFERENCE_FREQUENCIES[self as usize]
    }

    /// Register-0 crystal selector.
    pub fn selector(self) -> u32 {
        self as u32
    }

    fn pll_reference(self) -> u64 {
        u64::from(self.reference().fref1_hz) * 4
    }
}

// ── Gains ──

/// AM mixer gain reduction (register 1, MIXBU field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AmMixerGain {
    Reduction0Db = 0,
    Reduction6Db = 1,
    Reduction12Db = 2,
    Reduction18Db = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GainSettings {
    /// Baseband gain reduction, 0–59 dB.
    pub baseband_reduction: u8,
    /// Only meaningful in AM modes; forced to zero elsewhere.
    pub am_mixer: AmMixerGain,
    pub mixer_low: bool,
    pub lna_reduction: bool,
}

impl Default for GainSettings {
    fn default() -> Self {
        GainSettings {
            baseband_reduction: 20,
            am_mixer: AmMixerGain::Reduction12Db,
            mixer_low: false,
            lna_reduction: false,
        }
    }
}

// ── Register computation ──

/// Register 0: band mode, IF filter and crystal selector.
pub fn mode_register(mode: BandMode, crystal: Crystal) -> u32 {
    let mut reg = u32::from(mode.info().value) << 4;
    if mode.is_am() {
        reg |= FIL_MODE_450K_IF << R0_FIL_MODE_SHIFT;
        reg |= FIL_BW_AM << R0_FIL_BW_SHIFT;
    } else {
        reg |= FIL_MODE_ZERO_IF << R0_FIL_MODE_SHIFT;
        reg |= FIL_BW_ZERO_IF << R0_FIL_BW_SHIFT;
    }
    reg | crystal.selector() << R0_XTAL_SEL_SHIFT
}

/// Register 1 for `mode`. Outside AM modes the AM mixer code is reset.
pub fn gain_register(mode: BandMode, gains: &mut GainSettings) -> u32 {
    let mut reg = 1 | u32::from(gains.baseband_reduction & R1_BBGAIN_MASK) << R1_BBGAIN_SHIFT;
    if mode.is_am() {
        reg |= (gains.am_mixer as u32) << R1_MIXBU_SHIFT;
    } else {
        gains.am_mixer = AmMixerGain::Reduction0Db;
        reg |= u32::from(gains.lna_reduction) << R1_LNAGR_SHIFT;
    }
    reg |= u32::from(gains.mixer_low) << R1_MIXL_SHIFT;
    reg | R1_DCCAL << R1_DCCAL_SHIFT
}

/// Fractional-N split of one synthesizer target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PllWord {
    pub integer: u32,
    pub fraction: u32,
    pub threshold: u32,
}

impl PllWord {
    pub fn registers(&self) -> (u32, u32) {
        let reg5 = 5 | R5_BASE | self.threshold << R5_THRESH_SHIFT;
        let reg2 = 2 | self.fraction << R2_FRAC_SHIFT | self.integer << R2_INT_SHIFT;
        (reg5, reg2)
    }

    /// Read back from registers 5 and 2.
    pub fn from_registers(reg5: u32, reg2: u32) -> Self {
        PllWord {
            integer: (reg2 >> R2_INT_SHIFT) & R2_INT_MASK,
            fraction: (reg2 >> R2_FRAC_SHIFT) & FIELD_12_MASK,
            threshold: (reg5 >> R5_THRESH_SHIFT) & FIELD_12_MASK,
        }
    }
}

/// PLL word for `hz` in `mode`. Integer arithmetic, truncating.
pub fn pll_word(hz: u32, mode: BandMode, crystal: Crystal) -> Result<PllWord> {
    if mode.is_am() {
        return Err(TunerError::IfPathUnresolved { mode: mode.name() });
    }
    let lo_div = u64::from(mode.info().lo_divider);
    let reference = crystal.pll_reference();
    let fsynth = u64::from(hz) * lo_div;

    let threshold = reference / (FRACTIONAL_STEP_HZ * lo_div);
    let integer = fsynth / reference;
    let fraction = (fsynth % reference) * threshold / reference;

    if integer > u64::from(R2_INT_MASK) {
        return Err(TunerError::OutOfRange { hz });
    }
    Ok(PllWord {
        integer: integer as u32,
        fraction: fraction as u32,
        threshold: threshold as u32,
    })
}

/// Snapshot of one frequency set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunerState {
    pub mode: BandMode,
    pub crystal: Crystal,
    pub freq_hz: u32,
    pub gains: GainSettings,
    /// Raw tuner words indexed by register number; 3 and 4 are unused.
    pub regs: [u32; 6],
}

impl TunerState {
    pub fn pll(&self) -> PllWord {
        PllWord::from_registers(self.regs[5], self.regs[2])
    }

    /// Comparison frequency after the LO divider.
    fn step_base(&self) -> f64 {
        self.crystal.pll_reference() as f64 / f64::from(self.mode.info().lo_divider)
    }

    /// RF frequency the programmed registers actually produce.
    pub fn synthesized_frequency(&self) -> f64 {
        let pll = self.pll();
        if pll.threshold == 0 {
            return self.step_base() * f64::from(pll.integer);
        }
        self.step_base() * (f64::from(pll.integer) + f64::from(pll.fraction) / f64::from(pll.threshold))
    }

    /// RF size of one fractional step.
    pub fn frequency_step(&self) -> f64 {
        match self.pll().threshold {
            0 => self.step_base(),
            t => self.step_base() / f64::from(t),
        }
    }

    /// Registers in write order.
    pub fn write_sequence(&self) -> [(u8, u32); 4] {
        [0, 5, 2, 1].map(|r| (r as u8, self.regs[r]))
    }
}

/// Compute the full register set for `hz` without touching hardware.
pub fn plan_frequency(hz: u32, crystal: Crystal, gains: GainSettings) -> Result<TunerState> {
    let mode = BandMode::select(hz);
    let pll = pll_word(hz, mode, crystal)?;
    let (reg5, reg2) = pll.registers();

    let mut gains = gains;
    let mut regs = [0u32; 6];
    regs[0] = mode_register(mode, crystal);
    regs[5] = reg5;
    regs[2] = reg2;
    regs[1] = gain_register(mode, &mut gains);

    Ok(TunerState {
        mode,
        crystal,
        freq_hz: hz,
        gains,
        regs,
    })
}

// ── Driver ──

pub struct Msi001 {
    crystal: Crystal,
    gains: GainSettings,
    state: Option<TunerState>,
    bandwidth_hz: u32,
    gain: i32,
    manual_gain: bool,
}

impl Default for Msi001 {
    fn default() -> Self {
        Self::new(Crystal::Xtal24M)
    }
}

impl Msi001 {
    pub fn new(crystal: Crystal) -> Self {
        Msi001 {
            crystal,
            gains: GainSettings::default(),
            state: None,
            bandwidth_hz: 0,
            gain: 0,
            manual_gain: false,
        }
    }

    pub fn bandwidth(&self) -> u32 {
        self.bandwidth_hz
    }

    pub fn gain(&self) -> i32 {
        self.gain
    }

    pub fn manual_gain(&self) -> bool {
        self.manual_gain
    }
}

impl Tuner for Msi001 {
    fn name(&self) -> &'static str {
        "MSi001"
    }

    fn init(&mut self, bus: &dyn RegisterBus) -> Result<()> {
        for &word in TUNER_INIT {
            bus.write_register(REG_TUNER_BUS, word)?;
        }
        self.state = None;
        Ok(())
    }

    fn exit(&mut self, _bus: &dyn RegisterBus) -> Result<()> {
        self.state = None;
        Ok(())
    }

    fn set_frequency(&mut self, bus: &dyn RegisterBus, hz: u32) -> Result<u32> {
        let state = plan_frequency(hz, self.crystal, self.gains)?;
        for (reg, value) in state.write_sequence() {
            log::debug!("msi001 reg {reg} = 0x{value:06x}");
            bus.write_register(REG_TUNER_BUS, value)?;
        }

        let synthesized = state.synthesized_frequency();
        let pll = state.pll();
        log::debug!(
            "msi001 {}: int {} frac {}/{} -> {:.6} MHz (step {:.3} kHz)",
            state.mode.name(),
            pll.integer,
            pll.fraction,
            pll.threshold,
            synthesized / 1e6,
            state.frequency_step() / 1e3
        );
        self.state = Some(state);
        Ok(synthesized.round() as u32)
    }

    fn set_bandwidth(&mut self, _bus: &dyn RegisterBus, hz: u32) -> Result<()> {
        self.bandwidth_hz = hz;
        Ok(())
    }

    fn set_gain(&mut self, _bus: &dyn RegisterBus, gain: i32) -> Result<()> {
        self.gain = gain;
        Ok(())
    }

    fn set_gain_mode(&mut self, _bus: &dyn RegisterBus, manual: bool) -> Result<()> {
        self.manual_gain = manual;
        Ok(())
    }

    fn gains(&self) -> &'static [i32] {
        MSI001_GAINS
    }

    fn state(&self) -> Option<&TunerState> {
        self.state.as_ref()
    }
}
