//! Zeroplus Logic Cube (LAP-C) driver.
//!
//! The analyzer samples into on-board memory; the host programs clock,
//! memory and trigger registers, starts the capture, polls the status
//! register until the memory is full, and then downloads it in bulk.
//! Samples are always 32 bits wide regardless of the model's channel count.

mod analyzer;
mod gl_usb;
mod plugin;
mod source;

pub use analyzer::{Analyzer, Compression, RegisterIo, Settings};
pub use gl_usb::GlUsb;
pub use plugin::ZeroplusPlugin;

use crate::error::{Error, Result};
use crate::types::{khz, mhz, Capability, StagePredicate};

pub const USB_VENDOR: u16 = 0x0c12;
pub const USB_INTERFACE: u8 = 0;
pub const NUM_TRIGGER_STAGES: usize = 4;

/// Bytes per bulk packet during download.
pub const PACKET_SIZE: usize = 2048;
/// Bytes per sample in the download.
pub const UNITSIZE: usize = 4;

/// Rates offered by the vendor software. Each model caps them at its
/// maximum.
pub const SAMPLE_RATES: [u64; 18] = [
    100,
    500,
    khz(1),
    khz(5),
    khz(25),
    khz(50),
    khz(100),
    khz(200),
    khz(400),
    khz(800),
    mhz(1),
    mhz(10),
    mhz(25),
    mhz(50),
    mhz(80),
    mhz(100),
    mhz(150),
    mhz(200),
];

pub(crate) const CAPABILITIES: &[Capability] = &[
    Capability::SampleRate,
    Capability::ProbeConfig,
    Capability::TriggerConfig,
    Capability::CaptureRatio,
    Capability::LimitSamples,
];

// =============================================================================
// Models
// =============================================================================

/// One member of the LAP-C family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Model {
    pub pid: u16,
    pub name: &'static str,
    pub channels: usize,
    /// Memory depth in K samples per channel.
    pub sample_depth: usize,
    pub max_mhz: u64,
}

impl Model {
    /// Samples the on-board memory holds.
    pub fn memory_size(&self) -> usize {
        self.sample_depth * 1024
    }

    /// Bulk packets needed to download the whole memory.
    pub fn num_packets(&self) -> usize {
        self.memory_size() * UNITSIZE / PACKET_SIZE
    }

    pub fn sample_rates(&self) -> Vec<u64> {
        SAMPLE_RATES
            .iter()
            .copied()
            .filter(|rate| *rate <= mhz(self.max_mhz))
            .collect()
    }
}

// 16032, 16064 and 16128 usually, but not always, have 128K of memory.
pub const MODELS: &[Model] = &[
    Model { pid: 0x7009, name: "LAP-C(16064)", channels: 16, sample_depth: 64, max_mhz: 100 },
    Model { pid: 0x700a, name: "LAP-C(16128)", channels: 16, sample_depth: 128, max_mhz: 200 },
    Model { pid: 0x700b, name: "LAP-C(32128)", channels: 32, sample_depth: 128, max_mhz: 200 },
    Model { pid: 0x700c, name: "LAP-C(321000)", channels: 32, sample_depth: 1024, max_mhz: 200 },
    Model { pid: 0x700d, name: "LAP-C(322000)", channels: 32, sample_depth: 2048, max_mhz: 200 },
    Model { pid: 0x700e, name: "LAP-C(16032)", channels: 16, sample_depth: 32, max_mhz: 100 },
    Model { pid: 0x7016, name: "LAP-C(162000)", channels: 16, sample_depth: 2048, max_mhz: 200 },
];

pub fn model_for_pid(pid: u16) -> Option<&'static Model> {
    MODELS.iter().find(|m| m.pid == pid)
}

// =============================================================================
// Clock
// =============================================================================

/// Values for the frequency registers: divisor, multiplier and range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrequencyRegs {
    pub divisor: u8,
    pub reg0: u8,
    pub reg2: u8,
}

impl FrequencyRegs {
    const fn new(divisor: u8, reg0: u8, reg2: u8) -> Self {
        Self {
            divisor,
            reg0,
            reg2,
        }
    }
}

/// Fallback used for values the scale tables do not cover.
const SLOWEST: FrequencyRegs = FrequencyRegs::new(5, 5, 64);

/// Derives the frequency registers from a sample rate in Hz.
pub fn frequency_regs(rate: u64) -> FrequencyRegs {
    if rate >= mhz(1) {
        mhz_scale(rate / mhz(1))
    } else if rate >= khz(1) {
        khz_scale(rate / khz(1))
    } else {
        hz_scale(rate)
    }
}

fn mhz_scale(freq: u64) -> FrequencyRegs {
    match freq {
        100..=200 => FrequencyRegs::new(1, (freq / 10) as u8, 0),
        50..=99 => FrequencyRegs::new(2, (freq / 5) as u8, 0),
        25 => FrequencyRegs::new(5, 25, 1),
        10..=49 => FrequencyRegs::new(5, (freq / 2) as u8, 1),
        2..=9 => FrequencyRegs::new(5, (freq * 2) as u8, 2),
        1 => FrequencyRegs::new(5, 5, 16),
        _ => SLOWEST,
    }
}

fn khz_scale(freq: u64) -> FrequencyRegs {
    match freq {
        500..=999 => FrequencyRegs::new(5, (freq / 100) as u8, 17),
        100..=499 => FrequencyRegs::new(5, (freq / 20) as u8, 32),
        50..=99 => FrequencyRegs::new(5, (freq / 10) as u8, 33),
        25 => FrequencyRegs::new(5, 25, 49),
        10..=49 => FrequencyRegs::new(5, (freq / 2) as u8, 48),
        2..=9 => FrequencyRegs::new(5, (freq * 2) as u8, 50),
        _ => SLOWEST,
    }
}

fn hz_scale(freq: u64) -> FrequencyRegs {
    match freq {
        500..=999 => FrequencyRegs::new(10, (freq / 100) as u8, 64),
        300..=499 => FrequencyRegs::new(5, (freq / 25) as u8, 67),
        100..=299 => FrequencyRegs::new(5, (freq * 2 / 25) as u8, 68),
        _ => SLOWEST,
    }
}

// =============================================================================
// Trigger
// =============================================================================

/// Number of trigger status registers.
pub const TRIGGER_STATUS_REGS: usize = 9;

/// Encodes one logic stage into the trigger status registers.
///
/// Each probe takes two bits: the low one arms a high-level match, the high
/// one a low-level match. Registers hold four probes each, two registers per
/// group of eight. The last register (edges) stays clear.
pub fn trigger_status(stage: &StagePredicate) -> [u8; TRIGGER_STATUS_REGS] {
    let mut regs = [0u8; TRIGGER_STATUS_REGS];
    for bit in (0..32).filter(|bit| stage.mask & (1 << bit) != 0) {
        let group = bit / 8;
        let within = bit % 8;
        let reg = group * 2 + within / 4;
        let low = stage.value & (1 << bit) == 0;
        regs[reg] |= 1 << (2 * (within % 4) + usize::from(low));
    }
    regs
}

/// Validates logic stages against the analyzer's limits.
pub fn check_stages(stages: &[StagePredicate], channels: usize) -> Result<()> {
    if stages.len() > NUM_TRIGGER_STAGES {
        return Err(Error::UnsupportedTrigger(format!(
            "{} stages requested, the analyzer supports {}",
            stages.len(),
            NUM_TRIGGER_STAGES
        )));
    }
    let word = if channels >= 64 { u64::MAX } else { (1u64 << channels) - 1 };
    if stages.iter().any(|s| s.mask & !word != 0) {
        return Err(Error::bad_value(
            Capability::TriggerConfig,
            format!("trigger mask wider than {} channels", channels),
        ));
    }
    Ok(())
}

// =============================================================================
// Memory layout
// =============================================================================

/// Memory setting written to MEMORY_LENGTH.
pub const MEMORY_SIZE_512K: u8 = 0x04;
const MEMORY_BYTES_512K: u32 = 512 * 1024;

/// Trigger-bar address programmed for the pre-trigger percentage `ratio`.
pub fn ramsize_triggerbar_address(ratio: u8) -> u32 {
    let post = 100 - u32::from(ratio.min(100));
    (post * MEMORY_BYTES_512K / 100) >> 2
}
