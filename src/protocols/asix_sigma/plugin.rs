use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{info, warn};
use rusb::Context;

use super::decode::ChunkDecoder;
use super::protocol::{
    Port, Sigma, MODE_RUN, TRIGGER_INOUT, WRITE_CLOCK_SELECT, WRITE_MODE, WRITE_POST_TRIGGER,
    WRITE_TRIGGER_OPTION, WRITE_TRIGGER_SELECT1,
};
use super::source::{CaptureSource, SharedSigma};
use super::{
    build_trigger, check_rate, clock_select, pin_trigger_select, post_trigger, Firmware,
    CAPABILITIES, DEFAULT_CAPTURE_RATIO, DEFAULT_SAMPLE_RATE, LUT_TRIGGER_SELECT, MAX_PROBES,
    SAMPLE_RATES, USB_PRODUCT, USB_VENDOR,
};
use crate::datafeed::{Header, Packet};
use crate::error::{Error, Result};
use crate::event_loop::SourceId;
use crate::firmware::{self, FirmwareLocator};
use crate::plugin::{
    check_capability, instance, instance_mut, instance_status, AcquisitionContext, DeviceInstance,
    DevicePlugin,
};
use crate::protocols::check_trigger_probes;
use crate::transport::ftdi::FtdiDevice;
use crate::transport::usb;
use crate::trigger::{HardwareTrigger, TriggerLut};
use crate::types::{
    mhz, Capability, ConfigValue, DeviceIdentity, DeviceStatus, DriverKind, InfoField, InfoValue,
    SampleRates, TriggerSpec,
};

/// How often a running capture checks its limits.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type SigmaPort = FtdiDevice<Context>;

struct SigmaState<P> {
    sigma: Option<SharedSigma<P>>,
    /// Bitstream currently in the FPGA.
    loaded: Option<Firmware>,
    samplerate: u64,
    capture_ratio: u8,
    limit_msec: Option<u64>,
    specs: Vec<TriggerSpec>,
    trigger: HardwareTrigger,
    running: Option<SourceId>,
}

impl<P> Default for SigmaState<P> {
    fn default() -> Self {
        Self {
            sigma: None,
            loaded: None,
            samplerate: DEFAULT_SAMPLE_RATE,
            capture_ratio: DEFAULT_CAPTURE_RATIO,
            limit_msec: None,
            specs: Vec::new(),
            trigger: HardwareTrigger::default(),
            running: None,
        }
    }
}

/// Trigger select register value, checking the trigger fits `rate`.
fn trigger_select(trigger: &HardwareTrigger, rate: u64) -> Result<u8> {
    if rate >= mhz(100) {
        pin_trigger_select(trigger)
    } else {
        Ok(LUT_TRIGGER_SELECT)
    }
}

/// Loads the bitstream for the configured rate if it is not already in
/// the FPGA, then programs trigger, clock and post-trigger fill and starts
/// sampling.
fn arm<P: Port>(
    sigma: &mut Sigma<P>,
    state: &mut SigmaState<P>,
    locator: &FirmwareLocator,
) -> Result<()> {
    let rate = state.samplerate;
    let select = trigger_select(&state.trigger, rate)?;

    let wanted = Firmware::for_rate(rate);
    if state.loaded != Some(wanted) {
        let image = locator.load(wanted.file_name())?;
        state.loaded = None;
        sigma.upload_firmware(&firmware::decode_bitbang(&image)?)?;
        state.loaded = Some(wanted);
    }

    sigma.set_register(WRITE_TRIGGER_SELECT1, 0x20)?;
    if rate >= mhz(100) {
        sigma.set_register(WRITE_TRIGGER_SELECT1, 0x81)?;
    } else {
        sigma.write_trigger_lut(&TriggerLut::basic(&state.trigger))?;
    }
    sigma.write_register(WRITE_TRIGGER_OPTION, &TRIGGER_INOUT)?;
    sigma.set_register(WRITE_TRIGGER_SELECT1, select)?;

    sigma.write_register(WRITE_CLOCK_SELECT, &clock_select(rate))?;
    sigma.set_register(WRITE_POST_TRIGGER, post_trigger(state.capture_ratio))?;
    sigma.set_register(WRITE_MODE, MODE_RUN)
}

/// Driver for the ASIX SIGMA and SIGMA2.
pub struct SigmaPlugin<P = SigmaPort> {
    context: Option<Context>,
    locator: FirmwareLocator,
    instances: Vec<DeviceInstance<SigmaState<P>>>,
}

impl SigmaPlugin {
    pub fn new() -> Self {
        Self::with_locator(FirmwareLocator::from_env())
    }

    /// Uses `locator` to find the FPGA bitstreams.
    pub fn with_locator(locator: FirmwareLocator) -> Self {
        Self {
            context: None,
            locator,
            instances: Vec::new(),
        }
    }
}

impl Default for SigmaPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Port + 'static> SigmaPlugin<P> {
    fn configure(&mut self, index: usize, value: ConfigValue) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        check_capability(CAPABILITIES, &value)?;
        let state = &mut inst.state;

        match value {
            ConfigValue::SampleRate(rate) => {
                check_rate(rate)?;
                // the stored trigger must still fit the new rate
                let trigger = build_trigger(&state.specs, rate)?;
                trigger_select(&trigger, rate)?;
                state.samplerate = rate;
                state.trigger = trigger;
            }
            ConfigValue::Triggers(specs) => {
                check_trigger_probes(&specs, MAX_PROBES)?;
                let trigger = build_trigger(&specs, state.samplerate)?;
                trigger_select(&trigger, state.samplerate)?;
                state.trigger = trigger;
                state.specs = specs;
            }
            ConfigValue::CaptureRatio(ratio) => {
                if ratio > 100 {
                    return Err(Error::bad_value(
                        Capability::CaptureRatio,
                        format!("{}% is not a percentage", ratio),
                    ));
                }
                state.capture_ratio = ratio;
            }
            ConfigValue::LimitMsec(msec) => {
                if msec == 0 {
                    warn!("a zero time limit stops the capture at once");
                }
                state.limit_msec = Some(msec);
            }
            other => {
                return Err(Error::bad_value(other.capability(), "not supported by this device"))
            }
        }
        Ok(())
    }

    fn start(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        let state = &mut inst.state;
        let shared = state
            .sigma
            .clone()
            .ok_or_else(|| Error::msg(format!("asix-sigma {} is not open", index)))?;

        if let Some(running) = state.running {
            if ctx.event_loop.contains(running) {
                return Err(Error::msg("acquisition already running"));
            }
        }
        state.running = None;

        {
            let mut sigma = shared.lock().unwrap_or_else(PoisonError::into_inner);
            arm(&mut sigma, state, &self.locator)?;
        }

        let firmware = Firmware::for_rate(state.samplerate);
        info!(
            "SIGMA sampling {} probes at {} Hz, limit {:?} ms",
            firmware.num_probes(),
            state.samplerate,
            state.limit_msec
        );
        ctx.bus.send(
            ctx.device,
            Packet::Header(Header::new(state.samplerate, firmware.num_probes())),
        );

        let decoder = ChunkDecoder::new(firmware.num_probes(), state.trigger);
        let limit = state.limit_msec.map(Duration::from_millis);
        let free_running =
            state.samplerate >= mhz(100) && state.trigger == HardwareTrigger::default();
        let source =
            CaptureSource::new(ctx.device, shared, limit, decoder).free_running(free_running);
        state.running = Some(ctx.event_loop.add_source(0, Some(POLL_INTERVAL), Box::new(source)));
        Ok(())
    }
}

impl DevicePlugin for SigmaPlugin {
    fn kind(&self) -> DriverKind {
        DriverKind::AsixSigma
    }

    fn init(&mut self) -> Result<usize> {
        self.cleanup();
        let context = usb::context()?;

        let mut instances = Vec::new();
        for device in usb::find_devices(&context, USB_VENDOR, Some(USB_PRODUCT))? {
            let address = usb::address_of(&device);
            info!("found ASIX SIGMA on {}", address);
            let inst = DeviceInstance::new(
                instances.len(),
                DeviceStatus::Initializing,
                DeviceIdentity::new("ASIX", "SIGMA", ""),
                SigmaState::default(),
            )
            .with_usb(address);
            instances.push(inst);
        }

        self.context = Some(context);
        self.instances = instances;
        Ok(self.instances.len())
    }

    fn cleanup(&mut self) {
        for index in 0..self.instances.len() {
            let _ = self.close(index);
        }
        self.instances.clear();
        self.context = None;
    }

    fn num_devices(&self) -> usize {
        self.instances.len()
    }

    fn open(&mut self, index: usize) -> Result<()> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| Error::msg("asix-sigma: plugin not initialised"))?;
        let inst = instance_mut(&mut self.instances, index)?;
        if inst.is_active() {
            return Err(Error::AlreadyActive);
        }

        let address = inst
            .usb
            .ok_or_else(|| Error::DeviceNotFound(format!("sigma unit {}", index)))?;
        let device = usb::find_at(context, USB_VENDOR, USB_PRODUCT, address)?
            .ok_or_else(|| Error::DeviceNotFound(format!("sigma unit {} on {}", index, address)))?;
        let port = FtdiDevice::open(&device)?;

        inst.state.sigma = Some(Arc::new(Mutex::new(Sigma::new(port))));
        inst.state.loaded = None;
        inst.status = DeviceStatus::Active;
        Ok(())
    }

    fn close(&mut self, index: usize) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        inst.state.running = None;
        if inst.state.sigma.take().is_some() {
            info!("closed SIGMA on {:?}", inst.usb);
            inst.state.loaded = None;
            inst.status = DeviceStatus::Inactive;
        }
        Ok(())
    }

    fn info(&self, index: usize, field: InfoField) -> Option<InfoValue> {
        let inst = instance(&self.instances, index).ok()?;
        match field {
            InfoField::Identity => Some(InfoValue::Identity(inst.identity.clone())),
            InfoField::NumProbes => Some(InfoValue::NumProbes(
                Firmware::for_rate(inst.state.samplerate).num_probes(),
            )),
            InfoField::SampleRates => Some(InfoValue::SampleRates(SampleRates::List(
                SAMPLE_RATES.to_vec(),
            ))),
            InfoField::CurrentSampleRate => Some(InfoValue::CurrentSampleRate(inst.state.samplerate)),
            InfoField::UsbAddress => inst.usb.map(InfoValue::UsbAddress),
            InfoField::TriggerTypes | InfoField::PatternModes => None,
        }
    }

    fn status(&self, index: usize) -> DeviceStatus {
        instance_status(&self.instances, index)
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn set_configuration(&mut self, index: usize, value: ConfigValue) -> Result<()> {
        self.configure(index, value)
    }

    fn start_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        self.start(index, ctx)
    }

    fn stop_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        if let Some(running) = inst.state.running.take() {
            ctx.event_loop.remove_source(running, ctx.bus);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::protocol::mock::MockPort;
    use super::*;
    use crate::datafeed::{DatafeedBus, DeviceId, PacketCollector};
    use crate::event_loop::EventLoop;
    use crate::types::{khz, EdgeDirection};

    fn plugin(locator: FirmwareLocator, port: Option<MockPort>) -> SigmaPlugin<MockPort> {
        let mut state = SigmaState::default();
        state.sigma = port.map(|p| Arc::new(Mutex::new(Sigma::new(p))));
        SigmaPlugin {
            context: None,
            locator,
            instances: vec![DeviceInstance::new(
                0,
                DeviceStatus::Active,
                DeviceIdentity::new("ASIX", "SIGMA", ""),
                state,
            )],
        }
    }

    fn rising(probe: usize) -> TriggerSpec {
        TriggerSpec::Edge {
            probe,
            direction: EdgeDirection::Rising,
        }
    }

    #[test]
    fn test_defaults() {
        let mut real = SigmaPlugin::new();
        real.instances.push(DeviceInstance::new(
            0,
            DeviceStatus::Initializing,
            DeviceIdentity::new("ASIX", "SIGMA", ""),
            SigmaState::default(),
        ));
        assert_eq!(
            real.info(0, InfoField::CurrentSampleRate),
            Some(InfoValue::CurrentSampleRate(mhz(50)))
        );
        assert_eq!(real.info(0, InfoField::NumProbes), Some(InfoValue::NumProbes(16)));
        assert!(real.info(0, InfoField::TriggerTypes).is_none());
        assert_eq!(real.instances[0].state.capture_ratio, 50);
    }

    #[test]
    fn test_configuration_rules() {
        let mut real = SigmaPlugin::new();
        real.instances.push(DeviceInstance::new(
            0,
            DeviceStatus::Initializing,
            DeviceIdentity::new("ASIX", "SIGMA", ""),
            SigmaState::default(),
        ));

        real.set_configuration(0, ConfigValue::SampleRate(khz(250))).unwrap();
        assert!(real.set_configuration(0, ConfigValue::SampleRate(khz(300))).is_err());
        real.set_configuration(0, ConfigValue::Triggers(vec![TriggerSpec::logic(0x3, 0x1)]))
            .unwrap();

        // a logic trigger cannot follow the rate up to 100 MHz
        assert!(matches!(
            real.set_configuration(0, ConfigValue::SampleRate(mhz(100))),
            Err(Error::UnsupportedTrigger(_))
        ));
        assert_eq!(real.instances[0].state.samplerate, khz(250));

        real.set_configuration(0, ConfigValue::Triggers(vec![rising(2)])).unwrap();
        real.set_configuration(0, ConfigValue::SampleRate(mhz(200))).unwrap();
        assert_eq!(real.info(0, InfoField::NumProbes), Some(InfoValue::NumProbes(4)));

        assert!(real.set_configuration(0, ConfigValue::CaptureRatio(101)).is_err());
        real.set_configuration(0, ConfigValue::LimitMsec(250)).unwrap();
        assert!(matches!(
            real.set_configuration(0, ConfigValue::LimitSamples(10)),
            Err(Error::BadValue { .. })
        ));
    }

    #[test]
    fn test_start_requires_open() {
        let mut plugin = plugin(FirmwareLocator::with_dirs(Vec::<std::path::PathBuf>::new()), None);
        let mut ev = EventLoop::new();
        let mut bus = DatafeedBus::new();
        let mut ctx = AcquisitionContext::new(DeviceId(0), &mut ev, &mut bus);
        assert!(plugin.start(0, &mut ctx).is_err());
        assert!(!ev.has_sources());
    }

    #[test]
    fn test_start_fails_without_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = plugin(FirmwareLocator::with_dirs([dir.path()]), Some(MockPort::default()));
        let mut ev = EventLoop::new();
        let mut bus = DatafeedBus::new();
        let mut ctx = AcquisitionContext::new(DeviceId(0), &mut ev, &mut bus);
        assert!(plugin.start(0, &mut ctx).is_err());
        assert!(plugin.instances[0].state.loaded.is_none());
        assert!(!ev.has_sources());
    }

    #[test]
    fn test_pin_trigger_checked_on_configure() {
        let mut plugin = plugin(FirmwareLocator::with_dirs(Vec::<std::path::PathBuf>::new()), None);

        // probe 9 is outside the pin trigger's reach
        plugin.configure(0, ConfigValue::Triggers(vec![rising(9)])).unwrap();
        assert!(matches!(
            plugin.configure(0, ConfigValue::SampleRate(mhz(100))),
            Err(Error::UnsupportedTrigger(_))
        ));
        assert_eq!(plugin.instances[0].state.samplerate, mhz(50));

        plugin
            .configure(0, ConfigValue::Triggers(vec![rising(1), rising(2)]))
            .unwrap();
        assert!(matches!(
            plugin.configure(0, ConfigValue::SampleRate(mhz(100))),
            Err(Error::UnsupportedTrigger(_))
        ));
        assert_eq!(plugin.instances[0].state.samplerate, mhz(50));

        plugin.configure(0, ConfigValue::Triggers(Vec::new())).unwrap();
        plugin.configure(0, ConfigValue::SampleRate(mhz(100))).unwrap();
        assert!(matches!(
            plugin.configure(0, ConfigValue::Triggers(vec![rising(1), rising(2)])),
            Err(Error::UnsupportedTrigger(_))
        ));
        assert!(plugin.instances[0].state.specs.is_empty());
        assert_eq!(plugin.instances[0].state.trigger, HardwareTrigger::default());
    }

    #[test]
    fn test_untriggered_capture_at_100mhz() {
        let dir = tempfile::tempdir().unwrap();
        let port = MockPort::default();
        let mut plugin = plugin(FirmwareLocator::with_dirs([dir.path()]), Some(port.clone()));
        plugin.configure(0, ConfigValue::SampleRate(mhz(100))).unwrap();
        plugin.instances[0].state.loaded = Some(Firmware::Hundred);
        plugin.instances[0].state.limit_msec = Some(0);

        let mut ev = EventLoop::new();
        let mut bus = DatafeedBus::new();
        let mut ctx = AcquisitionContext::new(DeviceId(0), &mut ev, &mut bus);
        plugin.start(0, &mut ctx).unwrap();
        assert!(ev.has_sources());

        // pin select with no pin chosen
        let writes = port.state().writes.clone();
        assert!(writes.contains(&vec![0x02, 0x10, 0x20, 0x38]));
    }

    #[test]
    fn test_start_with_loaded_firmware_arms_capture() {
        let dir = tempfile::tempdir().unwrap();
        let port = MockPort::default();
        let mut plugin = plugin(FirmwareLocator::with_dirs([dir.path()]), Some(port.clone()));
        plugin.configure(0, ConfigValue::SampleRate(mhz(100))).unwrap();
        plugin.configure(0, ConfigValue::Triggers(vec![rising(3)])).unwrap();
        plugin.instances[0].state.loaded = Some(Firmware::Hundred);
        plugin.instances[0].state.limit_msec = Some(0);

        let mut ev = EventLoop::new();
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());
        let mut ctx = AcquisitionContext::new(DeviceId(0), &mut ev, &mut bus);
        plugin.start(0, &mut ctx).unwrap();
        assert!(ev.has_sources());

        let writes = port.state().writes.clone();
        assert_eq!(
            writes,
            vec![
                vec![0x02, 0x10, 0x20, 0x32],
                vec![0x02, 0x10, 0x21, 0x38],
                vec![0x06, 0x10, 0x28, 0x30, 0x20, 0x34],
                vec![0x02, 0x10, 0x22, 0x38],
                vec![0x00, 0x10, 0x20, 0x30],
                vec![0x05, 0x10, 0x2f, 0x37],
                vec![0x03, 0x10, 0x2d, 0x30],
            ]
        );
        assert_eq!(collector.count("header"), 1);
        match &collector.packets()[0].1 {
            Packet::Header(header) => assert_eq!(header.num_logic_probes, 8),
            other => panic!("unexpected {:?}", other),
        }
    }
}
