//! Device plugins for the supported logic analyzers.
//!
//! Each driver is gated behind a feature flag. The helpers in this module
//! are shared by drivers that trigger in software.

#[cfg(feature = "demo")]
pub mod demo;

#[cfg(feature = "saleae-logic")]
pub mod saleae_logic;

#[cfg(feature = "zeroplus-logic-cube")]
pub mod zeroplus_logic_cube;

#[cfg(feature = "asix-sigma")]
pub mod asix_sigma;

use log::debug;

use crate::datafeed::{DatafeedBus, DeviceId, Packet};
use crate::error::{Error, Result};
use crate::trigger::SoftwareTrigger;
use crate::types::{Capability, Probe, TriggerSpec};

/// Publishes a chunk of samples through a software trigger.
///
/// Until the trigger fires nothing is published. The chunk that fires it
/// produces a Trigger packet, the matched stage samples, then every sample
/// after the completing one. Later chunks pass through unchanged.
///
/// With `remaining` set, at most that many samples are published and the
/// count is reduced by what was sent. Returns true once it reaches zero.
pub(crate) fn publish_triggered(
    bus: &mut DatafeedBus,
    device: DeviceId,
    trigger: &mut SoftwareTrigger,
    data: Vec<u8>,
    unitsize: usize,
    mut remaining: Option<&mut u64>,
) -> bool {
    if trigger.is_fired() {
        return publish_limited(bus, device, data, unitsize, &mut remaining);
    }

    let Some(found) = trigger.feed(&data, unitsize) else {
        return false;
    };
    debug!("{}: trigger fired at sample {}", device, found.offset);
    bus.send(device, Packet::Trigger);
    if publish_limited(bus, device, found.matched, unitsize, &mut remaining) {
        return true;
    }
    let rest = ((found.offset + 1) * unitsize).min(data.len());
    publish_limited(bus, device, data[rest..].to_vec(), unitsize, &mut remaining)
}

fn publish_limited(
    bus: &mut DatafeedBus,
    device: DeviceId,
    mut data: Vec<u8>,
    unitsize: usize,
    remaining: &mut Option<&mut u64>,
) -> bool {
    if let Some(left) = remaining.as_deref() {
        let room = usize::try_from(*left)
            .unwrap_or(usize::MAX)
            .saturating_mul(unitsize);
        data.truncate(room);
    }
    if !data.is_empty() {
        if let Some(left) = remaining.as_deref_mut() {
            *left -= (data.len() / unitsize) as u64;
        }
        bus.send(device, Packet::logic(unitsize, data));
    }
    remaining.as_deref().is_some_and(|left| *left == 0)
}

/// Rejects probes outside `1..=num_probes`.
pub(crate) fn check_probes(probes: &[Probe], num_probes: usize) -> Result<()> {
    match probes.iter().find(|p| p.index == 0 || p.index > num_probes) {
        Some(p) => Err(Error::bad_value(
            Capability::ProbeConfig,
            format!("probe {} out of range 1..={}", p.index, num_probes),
        )),
        None => Ok(()),
    }
}

/// Rejects trigger specs naming probes outside `1..=num_probes`, or masks
/// wider than the sample word.
pub(crate) fn check_trigger_probes(specs: &[TriggerSpec], num_probes: usize) -> Result<()> {
    let word = if num_probes >= 64 {
        u64::MAX
    } else {
        (1u64 << num_probes) - 1
    };
    for spec in specs {
        let fits = match spec {
            TriggerSpec::Sequence { probe, .. } | TriggerSpec::Edge { probe, .. } => {
                (1..=num_probes).contains(probe)
            }
            TriggerSpec::Logic { stages } => stages.iter().all(|s| s.mask & !word == 0),
            _ => true,
        };
        if !fits {
            return Err(Error::bad_value(
                Capability::TriggerConfig,
                format!("{} trigger refers to a probe beyond {}", spec.kind(), num_probes),
            ));
        }
    }
    Ok(())
}
