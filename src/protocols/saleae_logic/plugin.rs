use std::sync::Arc;

use log::{info, warn};
use rusb::{Context, Device};

use super::{
    msec_to_samples, pump_config, rate_command, CaptureSource, CAPABILITIES, COMMAND_TIMEOUT,
    EP_COMMAND, EP_DATA, FIRMWARE_NAME, NUM_PROBES, NUM_TRIGGER_STAGES, PROFILE, REOPEN_LOCK,
    SAMPLE_RATES, USB_CONFIGURATION, USB_INTERFACE, USB_PRODUCT, USB_VENDOR,
};
use crate::datafeed::{Header, Packet};
use crate::error::{Error, Result};
use crate::event_loop::SourceId;
use crate::firmware::FirmwareLocator;
use crate::plugin::{
    check_capability, instance, instance_mut, instance_status, AcquisitionContext, DeviceInstance,
    DevicePlugin,
};
use crate::protocols::check_probes;
use crate::transport::usb::{self, BulkEndpoint, SharedHandle};
use crate::transport::{ezusb, nth_unclaimed, StopFlag, TransferPump};
use crate::trigger::{SoftwareTrigger, TRIGGER_CHARS};
use crate::types::{
    default_probes, Capability, ConfigValue, DeviceIdentity, DeviceStatus, DriverKind, InfoField,
    InfoValue, Probe, SampleRates,
};

struct Running {
    source: SourceId,
    pump: TransferPump,
}

struct SaleaeState {
    handle: Option<SharedHandle>,
    samplerate: u64,
    limit_samples: Option<u64>,
    limit_msec: Option<u64>,
    probes: Vec<Probe>,
    trigger: SoftwareTrigger,
    running: Option<Running>,
}

impl Default for SaleaeState {
    fn default() -> Self {
        Self {
            handle: None,
            samplerate: SAMPLE_RATES[0],
            limit_samples: None,
            limit_msec: None,
            probes: default_probes(NUM_PROBES),
            trigger: SoftwareTrigger::disabled(),
            running: None,
        }
    }
}

impl SaleaeState {
    fn limit(&self) -> Option<u64> {
        self.limit_samples
            .or_else(|| self.limit_msec.map(|ms| msec_to_samples(self.samplerate, ms)))
    }
}

/// Driver for the Saleae Logic.
pub struct SaleaePlugin {
    context: Option<Context>,
    locator: FirmwareLocator,
    instances: Vec<DeviceInstance<SaleaeState>>,
}

impl SaleaePlugin {
    pub fn new() -> Self {
        Self::with_locator(FirmwareLocator::from_env())
    }

    /// Uses `locator` to find the firmware image.
    pub fn with_locator(locator: FirmwareLocator) -> Self {
        Self {
            context: None,
            locator,
            instances: Vec::new(),
        }
    }

    fn context(&self) -> Result<&Context> {
        self.context
            .as_ref()
            .ok_or_else(|| Error::msg("saleae-logic: plugin not initialised"))
    }

    fn upload_firmware(&self, device: &Device<Context>) -> Result<()> {
        let image = self.locator.load(FIRMWARE_NAME)?;
        info!(
            "uploading firmware to device on {}",
            usb::address_of(device)
        );
        let handle = device
            .open()
            .map_err(|e| Error::OpenFailed(e.to_string()))?;
        handle
            .set_active_configuration(USB_CONFIGURATION)
            .map_err(|e| Error::context("setting configuration", e))?;
        ezusb::upload(&handle, &image)?;
        REOPEN_LOCK.record_upload();
        Ok(())
    }

    /// Finds the physical device backing instance `index`.
    fn locate(&self, index: usize) -> Result<Device<Context>> {
        let context = self.context()?;
        let inst = instance(&self.instances, index)?;

        let found = match inst.status {
            DeviceStatus::Initializing => {
                let devices = usb::find_devices(context, USB_VENDOR, Some(USB_PRODUCT))?;
                let candidates: Vec<_> = devices.iter().map(usb::address_of).collect();
                let owned: Vec<_> = self
                    .instances
                    .iter()
                    .filter(|i| i.index != index && i.status != DeviceStatus::Initializing)
                    .filter_map(|i| i.usb)
                    .collect();
                let skip = self
                    .instances
                    .iter()
                    .filter(|i| i.index < index && i.status == DeviceStatus::Initializing)
                    .count();
                nth_unclaimed(&candidates, &owned, skip)
                    .and_then(|addr| devices.into_iter().find(|d| usb::address_of(d) == addr))
            }
            DeviceStatus::Inactive => match inst.usb {
                Some(address) => usb::find_at(context, USB_VENDOR, USB_PRODUCT, address)?,
                None => None,
            },
            DeviceStatus::Active => return Err(Error::AlreadyActive),
            DeviceStatus::NotFound => None,
        };
        found.ok_or_else(|| Error::DeviceNotFound(format!("saleae-logic unit {}", index)))
    }
}

impl Default for SaleaePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePlugin for SaleaePlugin {
    fn kind(&self) -> DriverKind {
        DriverKind::SaleaeLogic
    }

    fn init(&mut self) -> Result<usize> {
        self.cleanup();
        let context = usb::context()?;
        let devices = usb::find_devices(&context, USB_VENDOR, Some(USB_PRODUCT))?;

        let mut instances = Vec::new();
        for (index, device) in devices.iter().enumerate() {
            let identity = DeviceIdentity::new("Saleae", "Logic", "");
            let ready = usb::descriptor_shape(device)
                .map(|shape| PROFILE.matches(&shape))
                .unwrap_or(false);

            let inst = if ready {
                DeviceInstance::new(index, DeviceStatus::Inactive, identity, SaleaeState::default())
                    .with_usb(usb::address_of(device))
            } else {
                if let Err(e) = self.upload_firmware(device) {
                    warn!("firmware upload failed for device {}: {}", index, e);
                }
                DeviceInstance::new(
                    index,
                    DeviceStatus::Initializing,
                    identity,
                    SaleaeState::default(),
                )
            };
            instances.push(inst);
        }

        info!("saleae-logic: found {} device(s)", instances.len());
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
        if instance(&self.instances, index)?.is_active() {
            return Err(Error::AlreadyActive);
        }

        let waited = REOPEN_LOCK.wait();
        if !waited.is_zero() {
            info!("waited {:?} for device to re-enumerate", waited);
        }

        let device = self.locate(index)?;
        let handle = usb::open_and_claim(&device, None, USB_INTERFACE)?;

        let inst = instance_mut(&mut self.instances, index)?;
        inst.usb = Some(usb::address_of(&device));
        inst.status = DeviceStatus::Active;
        inst.state.handle = Some(Arc::new(handle));
        Ok(())
    }

    fn close(&mut self, index: usize) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        // the pump posts Closed as it stops, which ends the stream
        inst.state.running = None;
        if let Some(handle) = inst.state.handle.take() {
            if let Ok(mut handle) = Arc::try_unwrap(handle) {
                let _ = handle.release_interface(USB_INTERFACE);
            }
            info!("closed device {} on {:?}", index, inst.usb);
            inst.status = DeviceStatus::Inactive;
        }
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
            InfoField::UsbAddress => inst.usb.map(InfoValue::UsbAddress),
            InfoField::PatternModes => None,
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
                rate_command(rate)?;
                state.samplerate = rate;
            }
            ConfigValue::Probes(probes) => {
                check_probes(&probes, NUM_PROBES)?;
                let trigger = SoftwareTrigger::from_probes(&probes, NUM_TRIGGER_STAGES)?;
                state.probes = probes;
                state.trigger = trigger;
            }
            ConfigValue::LimitSamples(limit) => state.limit_samples = Some(limit),
            ConfigValue::LimitMsec(msec) => state.limit_msec = Some(msec),
            other => {
                return Err(Error::bad_value(other.capability(), "not supported by this device"))
            }
        }
        Ok(())
    }

    fn start_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        let state = &mut inst.state;
        let handle = state
            .handle
            .clone()
            .ok_or_else(|| Error::msg(format!("saleae-logic {} is not open", index)))?;

        if let Some(running) = &state.running {
            if ctx.event_loop.contains(running.source) {
                return Err(Error::msg("acquisition already running"));
            }
        }
        state.running = None;

        let command = rate_command(state.samplerate)?;
        usb::write_bulk_all(&handle, EP_COMMAND, &command, COMMAND_TIMEOUT)?;
        info!(
            "sample rate {} Hz (divider {})",
            state.samplerate, command[1]
        );

        ctx.bus.send(
            ctx.device,
            Packet::Header(Header::new(state.samplerate, NUM_PROBES)),
        );

        let stop = StopFlag::new();
        let source = CaptureSource::new(ctx.device, state.trigger.clone(), state.limit(), stop.clone());
        let id = ctx.event_loop.add_source(0, None, Box::new(source));
        let reader = BulkEndpoint::new(handle, EP_DATA);
        let pump = match TransferPump::spawn_with(reader, pump_config(), ctx.event_loop.sender(id), stop) {
            Ok(pump) => pump,
            Err(e) => {
                ctx.event_loop.remove_source(id, ctx.bus);
                return Err(e);
            }
        };

        state.running = Some(Running { source: id, pump });
        Ok(())
    }

    fn stop_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        if let Some(mut running) = inst.state.running.take() {
            ctx.event_loop.remove_source(running.source, ctx.bus);
            running.pump.stop();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::datafeed::{DatafeedBus, DeviceId, PacketCollector};
    use crate::event_loop::EventLoop;
    use crate::transport::{BulkRead, ReadError};

    /// Streams zero samples for as long as it is read.
    struct Endless;

    impl BulkRead for Endless {
        fn read_bulk(
            &self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> std::result::Result<usize, ReadError> {
            std::thread::sleep(Duration::from_millis(1));
            buf.fill(0);
            Ok(buf.len())
        }
    }

    #[test]
    fn test_close_during_capture_ends_stream() {
        let device = DeviceId(0);
        let mut ev = EventLoop::new().with_poll_interval(Duration::from_millis(5));
        let mut bus = DatafeedBus::new();
        let collector = PacketCollector::new();
        bus.subscribe(collector.clone());
        bus.send(device, Packet::Header(Header::new(SAMPLE_RATES[0], NUM_PROBES)));

        let stop = StopFlag::new();
        let source = CaptureSource::new(device, SoftwareTrigger::disabled(), None, stop.clone());
        let id = ev.add_source(0, None, Box::new(source));
        let pump = TransferPump::spawn_with(Endless, pump_config(), ev.sender(id), stop).unwrap();

        let mut state = SaleaeState::default();
        state.running = Some(Running { source: id, pump });
        let mut plugin = SaleaePlugin::with_locator(FirmwareLocator::with_dirs(Vec::<PathBuf>::new()));
        plugin.instances.push(DeviceInstance::new(
            0,
            DeviceStatus::Active,
            DeviceIdentity::new("Saleae", "Logic", ""),
            state,
        ));

        let start = Instant::now();
        while collector.count("logic") == 0 {
            ev.iteration(&mut bus);
            assert!(start.elapsed() < Duration::from_secs(5));
        }

        plugin.close(0).unwrap();
        assert!(plugin.instances[0].state.running.is_none());

        while ev.has_sources() {
            ev.iteration(&mut bus);
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        assert_eq!(collector.count("end"), 1);
        assert!(bus.is_ended(device));
    }
}
