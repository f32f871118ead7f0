//! ASIX SIGMA driver.
//!
//! The SIGMA is an FPGA behind an FTDI chip. The FPGA has no persistent
//! configuration: a bitstream matching the sample rate is clocked in over
//! the FTDI bit-bang port before capturing. Samples go to on-board DRAM and
//! are downloaded after the capture stops, as timestamped clusters of
//! events.

mod decode;
mod plugin;
mod protocol;
mod source;

pub use decode::{trigger_offset, ChunkDecoder};
pub use plugin::SigmaPlugin;
pub use protocol::{Port, Positions, Sigma};

use crate::error::{Error, Result};
use crate::trigger::HardwareTrigger;
use crate::types::{khz, mhz, Capability, EdgeDirection, Probe, TriggerSpec};

pub const USB_VENDOR: u16 = 0xa600;
pub const USB_PRODUCT: u16 = 0xa000;

/// Probes available at 50 MHz and below.
pub const MAX_PROBES: usize = 16;

pub const SAMPLE_RATES: [u64; 10] = [
    khz(200),
    khz(250),
    khz(500),
    mhz(1),
    mhz(5),
    mhz(10),
    mhz(25),
    mhz(50),
    mhz(100),
    mhz(200),
];

pub const DEFAULT_SAMPLE_RATE: u64 = mhz(50);
pub const DEFAULT_CAPTURE_RATIO: u8 = 50;

pub(crate) const CAPABILITIES: &[Capability] = &[
    Capability::SampleRate,
    Capability::CaptureRatio,
    Capability::TriggerConfig,
    Capability::LimitMsec,
];

/// Edge detectors in the LUT trigger.
const MAX_EDGES: u32 = 2;

// =============================================================================
// Firmware
// =============================================================================

/// FPGA bitstream for a group of sample rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    /// 50 MHz and integer fractions of it.
    Fifty,
    Hundred,
    TwoHundred,
}

impl Firmware {
    pub fn for_rate(rate: u64) -> Self {
        if rate <= mhz(50) {
            Firmware::Fifty
        } else if rate <= mhz(100) {
            Firmware::Hundred
        } else {
            Firmware::TwoHundred
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            Firmware::Fifty => "asix-sigma-50.fw",
            Firmware::Hundred => "asix-sigma-100.fw",
            Firmware::TwoHundred => "asix-sigma-200.fw",
        }
    }

    pub fn num_probes(&self) -> usize {
        match self {
            Firmware::Fifty => 16,
            Firmware::Hundred => 8,
            Firmware::TwoHundred => 4,
        }
    }

    /// Samples packed into each 20 ns event.
    pub fn samples_per_event(&self) -> usize {
        MAX_PROBES / self.num_probes()
    }
}

pub fn check_rate(rate: u64) -> Result<()> {
    if SAMPLE_RATES.contains(&rate) {
        Ok(())
    } else {
        Err(Error::bad_value(
            Capability::SampleRate,
            format!("{} Hz is not available", rate),
        ))
    }
}

// =============================================================================
// Trigger
// =============================================================================

/// Builds the hardware trigger for `specs` at `rate`.
///
/// Below 100 MHz a single-stage value/mask plus up to two edges is allowed.
/// At 100 and 200 MHz only edges are.
pub fn build_trigger(specs: &[TriggerSpec], rate: u64) -> Result<HardwareTrigger> {
    let mut trigger = HardwareTrigger::default();

    for spec in specs {
        match spec {
            TriggerSpec::Edge { probe, direction } => {
                let bit = probe_bit(*probe)?;
                match direction {
                    EdgeDirection::Rising => trigger.rising_mask |= bit,
                    EdgeDirection::Falling => trigger.falling_mask |= bit,
                    EdgeDirection::Both => {
                        return Err(Error::UnsupportedTrigger(
                            "edge triggers must be rising or falling".into(),
                        ))
                    }
                }
                if trigger.num_edges() > MAX_EDGES {
                    return Err(Error::UnsupportedTrigger(format!(
                        "at most {} edge triggers",
                        MAX_EDGES
                    )));
                }
            }
            TriggerSpec::Logic { stages } => {
                if rate >= mhz(100) {
                    return Err(Error::UnsupportedTrigger(
                        "only edge triggers at 100 and 200 MHz".into(),
                    ));
                }
                let [stage] = stages.as_slice() else {
                    return Err(Error::UnsupportedTrigger(
                        "logic triggers have a single stage".into(),
                    ));
                };
                let mask = u16::try_from(stage.mask).map_err(|_| {
                    Error::bad_value(Capability::TriggerConfig, "mask wider than 16 probes")
                })?;
                trigger.simple_mask |= mask;
                trigger.simple_value |= (stage.value as u16) & mask;
            }
            other => {
                return Err(Error::UnsupportedTrigger(format!(
                    "{} triggers are not supported",
                    other.kind()
                )))
            }
        }
    }
    Ok(trigger)
}

fn probe_bit(probe: usize) -> Result<u16> {
    if !(1..=MAX_PROBES).contains(&probe) {
        return Err(Error::bad_value(
            Capability::TriggerConfig,
            format!("probe {} out of range 1..={}", probe, MAX_PROBES),
        ));
    }
    Ok(Probe::new(probe).mask() as u16)
}

// Bits of the trigger select register.
const LEDSEL0: u8 = 6;
const LEDSEL1: u8 = 7;
const SELECT_FALLING: u8 = 1 << 3;

/// Trigger select value for the LUT trigger.
pub const LUT_TRIGGER_SELECT: u8 = (1 << LEDSEL1) | (1 << LEDSEL0);

/// Trigger select value for the pin trigger used at 100 and 200 MHz.
///
/// The pin trigger watches a single input among the first eight. An empty
/// trigger selects no pin and the capture runs untriggered.
pub fn pin_trigger_select(trigger: &HardwareTrigger) -> Result<u8> {
    let edges = trigger.edge_mask();
    if trigger.simple_mask == 0 && edges == 0 {
        return Ok(1 << LEDSEL1);
    }
    if trigger.simple_mask != 0 || edges.count_ones() != 1 {
        return Err(Error::UnsupportedTrigger(
            "exactly one edge trigger is required at 100 and 200 MHz".into(),
        ));
    }
    let pin = edges.trailing_zeros() as u8;
    if pin >= 8 {
        return Err(Error::UnsupportedTrigger(format!(
            "probe {} cannot trigger at this rate",
            pin + 1
        )));
    }
    let mut select = (1 << LEDSEL1) | pin;
    if trigger.falling_mask != 0 {
        select |= SELECT_FALLING;
    }
    Ok(select)
}

// =============================================================================
// Clock
// =============================================================================

/// Contents of the clock select register for `rate`.
pub fn clock_select(rate: u64) -> Vec<u8> {
    match Firmware::for_rate(rate) {
        Firmware::TwoHundred => vec![0xf0],
        Firmware::Hundred => vec![0x00],
        Firmware::Fifty => {
            // async, fraction, disabled probes (16 bit)
            let fraction = (mhz(50) / rate.max(1)).saturating_sub(1).min(255) as u8;
            vec![0x00, fraction, 0x00, 0x00]
        }
    }
}

/// Post-trigger fill for a pre-trigger percentage.
pub fn post_trigger(capture_ratio: u8) -> u8 {
    (u32::from(capture_ratio.min(100)) * 255 / 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(probe: usize, direction: EdgeDirection) -> TriggerSpec {
        TriggerSpec::Edge { probe, direction }
    }

    #[test]
    fn test_firmware_for_rate() {
        assert_eq!(Firmware::for_rate(khz(200)), Firmware::Fifty);
        assert_eq!(Firmware::for_rate(mhz(50)), Firmware::Fifty);
        assert_eq!(Firmware::for_rate(mhz(100)), Firmware::Hundred);
        assert_eq!(Firmware::for_rate(mhz(200)).file_name(), "asix-sigma-200.fw");
        assert_eq!(Firmware::Hundred.samples_per_event(), 2);
        assert_eq!(Firmware::TwoHundred.samples_per_event(), 4);
        assert!(check_rate(mhz(2)).is_err());
    }

    #[test]
    fn test_build_logic_and_edges() {
        let specs = vec![
            TriggerSpec::logic(0x00f0, 0x0030),
            edge(1, EdgeDirection::Rising),
            edge(3, EdgeDirection::Falling),
        ];
        let trigger = build_trigger(&specs, mhz(50)).unwrap();
        assert_eq!(trigger.simple_mask, 0x00f0);
        assert_eq!(trigger.simple_value, 0x0030);
        assert_eq!(trigger.rising_mask, 0b001);
        assert_eq!(trigger.falling_mask, 0b100);
    }

    #[test]
    fn test_build_rejections() {
        let three = vec![
            edge(1, EdgeDirection::Rising),
            edge(2, EdgeDirection::Rising),
            edge(3, EdgeDirection::Falling),
        ];
        assert!(matches!(
            build_trigger(&three, mhz(50)),
            Err(Error::UnsupportedTrigger(_))
        ));
        assert!(build_trigger(&[edge(1, EdgeDirection::Both)], mhz(50)).is_err());
        assert!(build_trigger(&[TriggerSpec::logic(1, 1)], mhz(100)).is_err());
        assert!(build_trigger(&[edge(17, EdgeDirection::Rising)], mhz(50)).is_err());
        assert!(build_trigger(&[TriggerSpec::Width], mhz(50)).is_err());
        assert!(build_trigger(&[edge(2, EdgeDirection::Rising)], mhz(200)).is_ok());
    }

    #[test]
    fn test_pin_trigger_select() {
        let rising = build_trigger(&[edge(3, EdgeDirection::Rising)], mhz(100)).unwrap();
        assert_eq!(pin_trigger_select(&rising).unwrap(), 0x80 | 2);

        let falling = build_trigger(&[edge(1, EdgeDirection::Falling)], mhz(100)).unwrap();
        assert_eq!(pin_trigger_select(&falling).unwrap(), 0x80 | 0x08);

        assert_eq!(pin_trigger_select(&HardwareTrigger::default()).unwrap(), 0x80);
        let two = build_trigger(
            &[edge(1, EdgeDirection::Rising), edge(2, EdgeDirection::Rising)],
            mhz(100),
        )
        .unwrap();
        assert!(pin_trigger_select(&two).is_err());
        let high = build_trigger(&[edge(9, EdgeDirection::Rising)], mhz(100)).unwrap();
        assert!(pin_trigger_select(&high).is_err());
    }

    #[test]
    fn test_clock_select_and_post_trigger() {
        assert_eq!(clock_select(mhz(200)), vec![0xf0]);
        assert_eq!(clock_select(mhz(100)), vec![0x00]);
        assert_eq!(clock_select(mhz(50)), vec![0, 0, 0, 0]);
        assert_eq!(clock_select(mhz(10)), vec![0, 4, 0, 0]);
        assert_eq!(clock_select(khz(200)), vec![0, 249, 0, 0]);
        assert_eq!(post_trigger(50), 127);
        assert_eq!(post_trigger(100), 255);
        assert_eq!(post_trigger(0), 0);
    }
}
