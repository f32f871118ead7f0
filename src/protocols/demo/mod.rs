//! Demo device: a software signal source.
//!
//! The demo plugin always has exactly one instance. A worker thread
//! generates random or incrementing samples and hands each chunk to the
//! event loop, where it passes through the software trigger onto the bus.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use logic_capture::protocols::demo::DemoPlugin;
//! use logic_capture::{Device, DeviceConfig, PacketCollector, Session};
//!
//! let mut plugin = DemoPlugin::new().with_interval(Duration::from_millis(10));
//! logic_capture::DevicePlugin::init(&mut plugin).unwrap();
//! let device = Device::from_plugin(Box::new(plugin), 0);
//! device.configure(&DeviceConfig::new().with_limit_samples(100)).unwrap();
//!
//! let mut session = Session::new();
//! let collector = PacketCollector::new();
//! session.subscribe(collector.clone());
//! session.add_device(device);
//! session.start().unwrap();
//! session.run();
//! ```

mod generator;

pub use generator::{Generator, BUFSIZE};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use self::generator::Budget;
use super::{check_probes, check_trigger_probes, publish_triggered};
use crate::datafeed::{DatafeedBus, DeviceId, Header, Packet};
use crate::error::{Error, Result};
use crate::event_loop::{Completion, Source, SourceControl, SourceEvent, SourceId};
use crate::plugin::{
    check_capability, instance, instance_mut, instance_status, AcquisitionContext, DeviceInstance,
    DevicePlugin,
};
use crate::trigger::{SoftwareTrigger, TRIGGER_CHARS};
use crate::types::{
    default_probes, khz, mhz, Capability, ConfigValue, DeviceIdentity, DeviceStatus, DriverKind,
    InfoField, InfoValue, PatternMode, Probe, SampleRates,
};

pub const NUM_PROBES: usize = 8;
pub const MAX_STAGES: usize = 4;
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Event loop priority of the demo source.
const SOURCE_PRIORITY: i32 = 40;

const SAMPLE_RATES: [u64; 5] = [khz(1), khz(10), khz(100), mhz(1), mhz(10)];

const CAPABILITIES: &[Capability] = &[
    Capability::SampleRate,
    Capability::ProbeConfig,
    Capability::TriggerConfig,
    Capability::LimitSamples,
    Capability::Continuous,
    Capability::PatternMode,
];

// =============================================================================
// Instance state
// =============================================================================

struct Running {
    source: SourceId,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Running {
    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.halt();
    }
}

struct DemoState {
    opened: bool,
    samplerate: u64,
    limit_samples: Option<u64>,
    continuous: bool,
    pattern: PatternMode,
    probes: Vec<Probe>,
    trigger: SoftwareTrigger,
    running: Option<Running>,
}

impl Default for DemoState {
    fn default() -> Self {
        Self {
            opened: false,
            samplerate: mhz(1),
            limit_samples: None,
            continuous: false,
            pattern: PatternMode::default(),
            probes: default_probes(NUM_PROBES),
            trigger: SoftwareTrigger::disabled(),
            running: None,
        }
    }
}

impl DemoState {
    fn budget(&self) -> Budget {
        match self.limit_samples {
            Some(limit) if !self.continuous => Budget::Samples(limit),
            _ => Budget::Unlimited,
        }
    }
}

// =============================================================================
// Plugin
// =============================================================================

/// The demo driver.
pub struct DemoPlugin {
    instances: Vec<DeviceInstance<DemoState>>,
    interval: Duration,
}

impl DemoPlugin {
    pub fn new() -> Self {
        Self {
            instances: Vec::new(),
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Sets the pause between generated chunks.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for DemoPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePlugin for DemoPlugin {
    fn kind(&self) -> DriverKind {
        DriverKind::Demo
    }

    fn init(&mut self) -> Result<usize> {
        self.instances = vec![DeviceInstance::new(
            0,
            DeviceStatus::Active,
            DeviceIdentity::new("Demo", "Demo device", ""),
            DemoState::default(),
        )];
        Ok(self.instances.len())
    }

    fn cleanup(&mut self) {
        self.instances.clear();
    }

    fn num_devices(&self) -> usize {
        self.instances.len()
    }

    fn open(&mut self, index: usize) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        if inst.state.opened {
            return Err(Error::AlreadyActive);
        }
        inst.state.opened = true;
        Ok(())
    }

    fn close(&mut self, index: usize) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        inst.state.opened = false;
        Ok(())
    }

    fn info(&self, index: usize, field: InfoField) -> Option<InfoValue> {
        let inst = instance(&self.instances, index).ok()?;
        match field {
            InfoField::Identity => Some(InfoValue::Identity(inst.identity.clone())),
            InfoField::NumProbes => Some(InfoValue::NumProbes(NUM_PROBES)),
            InfoField::SampleRates => Some(InfoValue::SampleRates(SampleRates::List(
                SAMPLE_RATES.to_vec(),
            ))),
            InfoField::TriggerTypes => Some(InfoValue::TriggerTypes(TRIGGER_CHARS.to_string())),
            InfoField::CurrentSampleRate => Some(InfoValue::CurrentSampleRate(inst.state.samplerate)),
            InfoField::PatternModes => Some(InfoValue::PatternModes(PatternMode::all().to_vec())),
            InfoField::UsbAddress => None,
        }
    }

    fn status(&self, index: usize) -> DeviceStatus {
        instance_status(&self.instances, index)
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn set_configuration(&mut self, index: usize, value: ConfigValue) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        check_capability(CAPABILITIES, &value)?;
        let state = &mut inst.state;

        match value {
            ConfigValue::SampleRate(rate) => {
                if !SAMPLE_RATES.contains(&rate) {
                    return Err(Error::bad_value(
                        Capability::SampleRate,
                        format!("{} Hz is not available", rate),
                    ));
                }
                state.samplerate = rate;
            }
            ConfigValue::Probes(probes) => {
                check_probes(&probes, NUM_PROBES)?;
                let trigger = SoftwareTrigger::from_probes(&probes, MAX_STAGES)?;
                state.probes = probes;
                state.trigger = trigger;
            }
            ConfigValue::Triggers(specs) => {
                check_trigger_probes(&specs, NUM_PROBES)?;
                state.trigger = SoftwareTrigger::from_specs(&specs, MAX_STAGES)?;
            }
            ConfigValue::LimitSamples(limit) => state.limit_samples = Some(limit),
            ConfigValue::Continuous(continuous) => state.continuous = continuous,
            ConfigValue::PatternMode(pattern) => state.pattern = pattern,
            other => {
                return Err(Error::bad_value(other.capability(), "not supported by this device"))
            }
        }
        debug!("demo {}: configuration updated", index);
        Ok(())
    }

    fn start_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        let interval = self.interval;
        let inst = instance_mut(&mut self.instances, index)?;
        let state = &mut inst.state;

        if let Some(running) = &state.running {
            if ctx.event_loop.contains(running.source) {
                return Err(Error::msg("acquisition already running"));
            }
        }
        // Reaps the worker of a finished capture.
        state.running = None;

        ctx.bus
            .send(ctx.device, Packet::Header(Header::new(state.samplerate, NUM_PROBES)));

        let stop = Arc::new(AtomicBool::new(false));
        let source = DemoSource {
            device: ctx.device,
            trigger: state.trigger.clone(),
            stop: Arc::clone(&stop),
            ended: false,
        };
        let id = ctx
            .event_loop
            .add_source(SOURCE_PRIORITY, None, Box::new(source));

        let generator = Generator::new(state.pattern);
        let budget = state.budget();
        let sender = ctx.event_loop.sender(id);
        let stop_flag = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("demo-generator".into())
            .spawn(move || generator::run(generator, budget, interval, sender, stop_flag));

        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                ctx.event_loop.remove_source(id, ctx.bus);
                return Err(Error::context("spawning demo generator", e));
            }
        };

        info!(
            "demo {}: acquisition started ({:?}, {:?})",
            index, state.pattern, budget
        );
        state.running = Some(Running {
            source: id,
            stop,
            worker: Some(worker),
        });
        Ok(())
    }

    fn stop_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        if let Some(mut running) = inst.state.running.take() {
            running.stop.store(true, Ordering::SeqCst);
            ctx.event_loop.remove_source(running.source, ctx.bus);
            running.halt();
            info!("demo {}: acquisition stopped", index);
        }
        Ok(())
    }
}

// =============================================================================
// Loop-side source
// =============================================================================

struct DemoSource {
    device: DeviceId,
    trigger: SoftwareTrigger,
    stop: Arc<AtomicBool>,
    ended: bool,
}

impl DemoSource {
    fn end(&mut self, bus: &mut DatafeedBus) {
        if !self.ended {
            self.ended = true;
            bus.send(self.device, Packet::End);
        }
    }
}

impl Source for DemoSource {
    fn dispatch(&mut self, event: SourceEvent, bus: &mut DatafeedBus) -> SourceControl {
        match event {
            SourceEvent::Ready(Completion::Data(data)) => {
                publish_triggered(bus, self.device, &mut self.trigger, data, 1, None);
                SourceControl::Continue
            }
            SourceEvent::Ready(Completion::Closed) => {
                self.end(bus);
                SourceControl::Remove
            }
            SourceEvent::Ready(Completion::Error(e)) => {
                error!("{}: demo generator failed: {}", self.device, e);
                self.stop.store(true, Ordering::SeqCst);
                self.end(bus);
                SourceControl::Remove
            }
            SourceEvent::Timeout => SourceControl::Continue,
        }
    }

    fn cancel(&mut self, bus: &mut DatafeedBus) {
        self.stop.store(true, Ordering::SeqCst);
        self.end(bus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafeed::PacketCollector;
    use crate::event_loop::EventLoop;
    use crate::types::StagePredicate;
    use std::time::Instant;

    const DEV: DeviceId = DeviceId(0);

    fn plugin() -> DemoPlugin {
        let mut plugin = DemoPlugin::new().with_interval(Duration::from_millis(1));
        plugin.init().unwrap();
        plugin
    }

    fn capture(plugin: &mut DemoPlugin) -> PacketCollector {
        let mut ev = EventLoop::new().with_poll_interval(Duration::from_millis(5));
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());

        let mut ctx = AcquisitionContext::new(DEV, &mut ev, &mut bus);
        plugin.start_acquisition(0, &mut ctx).unwrap();

        let start = Instant::now();
        while ev.has_sources() {
            ev.iteration(&mut bus);
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        collector
    }

    #[test]
    fn test_init_reports_one_active_instance() {
        let plugin = plugin();
        assert_eq!(plugin.num_devices(), 1);
        assert_eq!(plugin.status(0), DeviceStatus::Active);
        assert_eq!(plugin.status(1), DeviceStatus::NotFound);
        assert_eq!(
            plugin.info(0, InfoField::NumProbes),
            Some(InfoValue::NumProbes(8))
        );
        assert_eq!(plugin.info(0, InfoField::UsbAddress), None);
    }

    #[test]
    fn test_open_twice_is_already_active() {
        let mut plugin = plugin();
        plugin.open(0).unwrap();
        assert!(matches!(plugin.open(0), Err(Error::AlreadyActive)));
        plugin.close(0).unwrap();
        plugin.open(0).unwrap();
        assert!(matches!(plugin.open(5), Err(Error::DeviceNotFound(_))));
    }

    #[test]
    fn test_every_listed_rate_reads_back() {
        let mut plugin = plugin();
        for rate in SAMPLE_RATES {
            plugin.set_configuration(0, ConfigValue::SampleRate(rate)).unwrap();
            assert_eq!(
                plugin.info(0, InfoField::CurrentSampleRate),
                Some(InfoValue::CurrentSampleRate(rate))
            );
        }
        let err = plugin.set_configuration(0, ConfigValue::SampleRate(12345));
        assert!(matches!(err, Err(Error::BadValue { .. })));
        assert_eq!(
            plugin.info(0, InfoField::CurrentSampleRate),
            Some(InfoValue::CurrentSampleRate(mhz(10)))
        );
    }

    #[test]
    fn test_rejects_unadvertised_capability() {
        let mut plugin = plugin();
        let err = plugin.set_configuration(0, ConfigValue::CaptureRatio(50));
        assert!(matches!(
            err,
            Err(Error::BadValue {
                capability: Capability::CaptureRatio,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_trigger_keeps_previous() {
        let mut plugin = plugin();
        plugin
            .set_configuration(0, ConfigValue::Probes(vec![Probe::new(1).with_trigger("1")]))
            .unwrap();
        let err = plugin.set_configuration(
            0,
            ConfigValue::Probes(vec![Probe::new(1).with_trigger("10101")]),
        );
        assert!(matches!(err, Err(Error::UnsupportedTrigger(_))));
        let state = &instance(&plugin.instances, 0).unwrap().state;
        assert_eq!(state.probes[0].trigger.as_deref(), Some("1"));
        assert_eq!(state.trigger.num_stages(), 1);
    }

    #[test]
    fn test_limit_samples_stream() {
        let mut plugin = plugin();
        plugin.set_configuration(0, ConfigValue::LimitSamples(100)).unwrap();
        let collector = capture(&mut plugin);

        assert_eq!(collector.count("header"), 1);
        assert_eq!(collector.count("end"), 1);
        assert_eq!(collector.logic_bytes(DEV).len(), 100);
        let last = collector.packets().pop().map(|(_, p)| p);
        assert_eq!(last, Some(Packet::End));
    }

    #[test]
    fn test_limit_spans_several_chunks() {
        let mut plugin = plugin();
        plugin
            .set_configuration(0, ConfigValue::PatternMode(PatternMode::Incremental))
            .unwrap();
        plugin
            .set_configuration(0, ConfigValue::LimitSamples(BUFSIZE as u64 * 2 + 10))
            .unwrap();
        let collector = capture(&mut plugin);

        let bytes = collector.logic_bytes(DEV);
        assert_eq!(bytes.len(), BUFSIZE * 2 + 10);
        assert!(bytes.iter().enumerate().all(|(i, b)| *b == i as u8));
        assert_eq!(collector.count("logic"), 3);
    }

    #[test]
    fn test_trigger_drops_pretrigger_samples() {
        let mut plugin = plugin();
        plugin
            .set_configuration(0, ConfigValue::PatternMode(PatternMode::Incremental))
            .unwrap();
        plugin.set_configuration(0, ConfigValue::LimitSamples(64)).unwrap();
        plugin
            .set_configuration(
                0,
                ConfigValue::Triggers(vec![crate::types::TriggerSpec::Logic {
                    stages: vec![StagePredicate::new(0xff, 10), StagePredicate::new(0xff, 11)],
                }]),
            )
            .unwrap();
        let collector = capture(&mut plugin);

        assert_eq!(collector.count("trigger"), 1);
        let bytes = collector.logic_bytes(DEV);
        assert_eq!(bytes[..2], [10, 11]);
        assert_eq!(bytes.len(), 64 - 10);
    }

    #[test]
    fn test_stop_continuous_capture() {
        let mut plugin = plugin();
        plugin.set_configuration(0, ConfigValue::Continuous(true)).unwrap();

        let mut ev = EventLoop::new().with_poll_interval(Duration::from_millis(5));
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());

        let mut ctx = AcquisitionContext::new(DEV, &mut ev, &mut bus);
        plugin.start_acquisition(0, &mut ctx).unwrap();
        while collector.count("logic") < 3 {
            ev.iteration(&mut bus);
        }

        let mut ctx = AcquisitionContext::new(DEV, &mut ev, &mut bus);
        plugin.stop_acquisition(0, &mut ctx).unwrap();
        assert!(!ev.has_sources());
        for _ in 0..3 {
            ev.iteration(&mut bus);
        }

        assert_eq!(collector.count("end"), 1);
        let last = collector.packets().pop().map(|(_, p)| p);
        assert_eq!(last, Some(Packet::End));
    }

    #[test]
    fn test_restart_after_finished_capture() {
        let mut plugin = plugin();
        plugin.set_configuration(0, ConfigValue::LimitSamples(10)).unwrap();
        capture(&mut plugin);
        let collector = capture(&mut plugin);
        assert_eq!(collector.logic_bytes(DEV).len(), 10);
    }
}
