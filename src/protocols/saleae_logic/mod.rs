//! Saleae Logic driver.
//!
//! The Logic is a Cypress FX2 with no firmware of its own: on discovery a
//! blank unit gets its firmware uploaded and re-enumerates. Sampling is
//! driven by a clock divider, and triggering is done in software on the
//! stream of 8-bit samples read from EP2 IN.

mod plugin;

pub use plugin::SaleaePlugin;

use std::time::Duration;

use log::{debug, error};

use super::publish_triggered;
use crate::datafeed::{DatafeedBus, DeviceId, Packet};
use crate::error::{Error, Result};
use crate::event_loop::{Completion, Source, SourceControl, SourceEvent};
use crate::transport::{ExpectedProfile, PumpConfig, ReopenLock, StopFlag};
use crate::trigger::SoftwareTrigger;
use crate::types::{khz, mhz, Capability};

pub const USB_VENDOR: u16 = 0x0925;
pub const USB_PRODUCT: u16 = 0x3881;
pub const USB_INTERFACE: u8 = 0;
pub const USB_CONFIGURATION: u8 = 1;

pub const NUM_PROBES: usize = 8;
pub const NUM_TRIGGER_STAGES: usize = 4;

pub const FIRMWARE_NAME: &str = "saleae-logic.firmware";

/// Time a freshly flashed unit needs to re-enumerate.
pub const FIRMWARE_RENUM_DELAY: Duration = Duration::from_millis(3000);

/// Shared by every Saleae Logic in the process.
pub(crate) static REOPEN_LOCK: ReopenLock = ReopenLock::new(FIRMWARE_RENUM_DELAY);

/// Descriptor layout of a unit running our firmware.
pub const PROFILE: ExpectedProfile = ExpectedProfile::new(0x01, 0x82);

const EP_COMMAND: u8 = 0x01;
const EP_DATA: u8 = 0x82;
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Base clock the divider is applied to.
const BASE_CLOCK: u64 = mhz(48);

pub const SAMPLE_RATES: [u64; 10] = [
    khz(200),
    khz(250),
    khz(500),
    mhz(1),
    mhz(2),
    mhz(4),
    mhz(8),
    mhz(12),
    mhz(16),
    mhz(24),
];

pub(crate) const CAPABILITIES: &[Capability] = &[
    Capability::SampleRate,
    Capability::ProbeConfig,
    Capability::LimitSamples,
    Capability::LimitMsec,
];

/// Ten failed reads tolerated, a 2 KiB first read then 4 KiB, 40 ms each.
pub(crate) fn pump_config() -> PumpConfig {
    PumpConfig::new(10, 2048, 4096, Duration::from_millis(40))
}

/// Clock divider for `rate`, which must be one of [`SAMPLE_RATES`].
pub fn divider(rate: u64) -> Result<u8> {
    if !SAMPLE_RATES.contains(&rate) {
        return Err(Error::bad_value(
            Capability::SampleRate,
            format!("{} Hz is not available", rate),
        ));
    }
    Ok((BASE_CLOCK / rate - 1) as u8)
}

/// The set-rate command written to EP1 OUT.
pub fn rate_command(rate: u64) -> Result<[u8; 2]> {
    Ok([0x01, divider(rate)?])
}

/// Samples taken in `msec` milliseconds at `rate`.
pub fn msec_to_samples(rate: u64, msec: u64) -> u64 {
    rate.saturating_mul(msec) / 1000
}

// =============================================================================
// Capture source
// =============================================================================

/// Loop-side consumer of the bulk pump: triggers in software, enforces the
/// sample limit and ends the stream.
pub(crate) struct CaptureSource {
    device: DeviceId,
    trigger: SoftwareTrigger,
    /// Samples still to publish under the limit.
    remaining: Option<u64>,
    stop: StopFlag,
    ended: bool,
}

impl CaptureSource {
    pub(crate) fn new(
        device: DeviceId,
        trigger: SoftwareTrigger,
        limit: Option<u64>,
        stop: StopFlag,
    ) -> Self {
        Self {
            device,
            trigger,
            remaining: limit,
            stop,
            ended: false,
        }
    }

    /// Returns true once the sample limit is reached.
    fn accept(&mut self, bus: &mut DatafeedBus, data: Vec<u8>) -> bool {
        let done = publish_triggered(
            bus,
            self.device,
            &mut self.trigger,
            data,
            1,
            self.remaining.as_mut(),
        );
        if done {
            debug!("{}: sample limit reached", self.device);
        }
        done
    }

    fn end(&mut self, bus: &mut DatafeedBus) {
        self.stop.raise();
        if !self.ended {
            self.ended = true;
            bus.send(self.device, Packet::End);
        }
    }
}

impl Source for CaptureSource {
    fn dispatch(&mut self, event: SourceEvent, bus: &mut DatafeedBus) -> SourceControl {
        match event {
            SourceEvent::Ready(Completion::Data(data)) => {
                if self.accept(bus, data) {
                    self.end(bus);
                    return SourceControl::Remove;
                }
                SourceControl::Continue
            }
            SourceEvent::Ready(Completion::Error(e)) => {
                error!("{}: capture aborted: {}", self.device, e);
                self.end(bus);
                SourceControl::Remove
            }
            SourceEvent::Ready(Completion::Closed) => {
                self.end(bus);
                SourceControl::Remove
            }
            SourceEvent::Timeout => SourceControl::Continue,
        }
    }

    fn cancel(&mut self, bus: &mut DatafeedBus) {
        self.end(bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::{Header, PacketCollector};
    use crate::event_loop::EventLoop;
    use crate::types::StagePredicate;

    const DEV: DeviceId = DeviceId(0);

    fn run_source(source: CaptureSource, chunks: Vec<Vec<u8>>) -> PacketCollector {
        let mut ev = EventLoop::new().with_poll_interval(std::time::Duration::from_millis(1));
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());
        bus.send(DEV, Packet::Header(Header::new(mhz(1), NUM_PROBES)));

        let id = ev.add_source(0, None, Box::new(source));
        let sender = ev.sender(id);
        for chunk in chunks {
            sender.send(Completion::Data(chunk));
        }
        sender.send(Completion::Closed);
        while ev.has_sources() {
            ev.iteration(&mut bus);
        }
        collector
    }

    #[test]
    fn test_dividers() {
        assert_eq!(divider(mhz(24)).unwrap(), 1);
        assert_eq!(divider(mhz(1)).unwrap(), 47);
        assert_eq!(divider(khz(200)).unwrap(), 239);
        assert_eq!(rate_command(mhz(12)).unwrap(), [0x01, 3]);
        assert!(matches!(
            divider(mhz(3)),
            Err(Error::BadValue {
                capability: Capability::SampleRate,
                ..
            })
        ));
    }

    #[test]
    fn test_msec_to_samples() {
        assert_eq!(msec_to_samples(mhz(1), 1000), 1_000_000);
        assert_eq!(msec_to_samples(khz(200), 5), 1000);
    }

    #[test]
    fn test_limit_truncates_and_ends() {
        let stop = StopFlag::new();
        let source = CaptureSource::new(DEV, SoftwareTrigger::disabled(), Some(5), stop.clone());
        let collector = run_source(source, vec![vec![1, 2, 3], vec![4, 5, 6, 7], vec![8]]);

        assert_eq!(collector.logic_bytes(DEV), vec![1, 2, 3, 4, 5]);
        assert_eq!(collector.count("end"), 1);
        assert!(stop.is_raised());
    }

    #[test]
    fn test_trigger_sends_matched_then_rest() {
        let trigger = SoftwareTrigger::new(
            vec![StagePredicate::new(0x03, 0x01), StagePredicate::new(0x03, 0x02)],
            0,
            0,
            0,
        );
        let source = CaptureSource::new(DEV, trigger, None, StopFlag::new());
        let collector = run_source(source, vec![vec![0, 1, 0], vec![1, 2, 9, 9]]);

        let kinds: Vec<_> = collector.packets().iter().map(|(_, p)| p.kind()).collect();
        assert_eq!(kinds, ["header", "trigger", "logic", "logic", "end"]);
        assert_eq!(collector.logic_bytes(DEV), vec![1, 2, 9, 9]);
    }

    #[test]
    fn test_error_ends_stream() {
        let mut ev = EventLoop::new();
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());
        bus.send(DEV, Packet::Header(Header::new(mhz(1), NUM_PROBES)));

        let source = CaptureSource::new(DEV, SoftwareTrigger::disabled(), None, StopFlag::new());
        let id = ev.add_source(0, None, Box::new(source));
        ev.sender(id)
            .send(Completion::Error(Error::TransferSubmitFailed("gone".into())));
        ev.iteration(&mut bus);

        assert!(!ev.has_sources());
        assert!(bus.is_ended(DEV));
        assert_eq!(collector.count("end"), 1);
    }
}
