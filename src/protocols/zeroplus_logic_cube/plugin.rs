use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rusb::Context;

use super::analyzer::{Analyzer, Compression, Settings};
use super::gl_usb::GlUsb;
use super::source::DownloadSource;
use super::{
    check_stages, frequency_regs, model_for_pid, ramsize_triggerbar_address, trigger_status,
    Model, CAPABILITIES, MEMORY_SIZE_512K, NUM_TRIGGER_STAGES, USB_INTERFACE, USB_VENDOR,
};
use crate::datafeed::{Header, Packet};
use crate::error::{Error, Result};
use crate::event_loop::SourceId;
use crate::plugin::{
    check_capability, instance, instance_mut, instance_status, AcquisitionContext, DeviceInstance,
    DevicePlugin,
};
use crate::protocols::{check_probes, check_trigger_probes};
use crate::transport::usb::{self, SharedHandle};
use crate::trigger::{SoftwareTrigger, TRIGGER_CHARS};
use crate::types::{
    Capability, ConfigValue, DeviceIdentity, DeviceStatus, DriverKind, InfoField,
    InfoValue, SampleRates, StagePredicate, TriggerSpec,
};

/// How often a running capture polls the status register.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct ZeroplusState {
    model: &'static Model,
    handle: Option<SharedHandle>,
    samplerate: u64,
    limit_samples: Option<u64>,
    capture_ratio: u8,
    /// Only the first stage fits the hardware trigger.
    trigger: Option<StagePredicate>,
    running: Option<SourceId>,
}

impl ZeroplusState {
    fn new(model: &'static Model) -> Self {
        Self {
            model,
            handle: None,
            samplerate: model.sample_rates().first().copied().unwrap_or(0),
            limit_samples: None,
            capture_ratio: 0,
            trigger: None,
            running: None,
        }
    }

    fn settings(&self, compression: Compression) -> Settings {
        Settings {
            frequency: frequency_regs(self.samplerate),
            memory_size: MEMORY_SIZE_512K,
            trigger_status: self.trigger.as_ref().map(trigger_status).unwrap_or_default(),
            ramsize_triggerbar: ramsize_triggerbar_address(self.capture_ratio),
            compression,
        }
    }
}

/// First stage of `trigger`, after checking it fits the analyzer.
fn hardware_stage(trigger: &SoftwareTrigger, channels: usize) -> Result<Option<StagePredicate>> {
    check_stages(trigger.stages(), channels)?;
    Ok(trigger.stages().first().copied())
}

/// Driver for the Zeroplus Logic Cube family.
pub struct ZeroplusPlugin {
    context: Option<Context>,
    compression: Compression,
    instances: Vec<DeviceInstance<ZeroplusState>>,
}

impl ZeroplusPlugin {
    pub fn new() -> Self {
        Self {
            context: None,
            compression: Compression::None,
            instances: Vec::new(),
        }
    }

    /// Has the analyzer compress its memory. Downloads are expanded before
    /// they reach the datafeed.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

impl Default for ZeroplusPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl DevicePlugin for ZeroplusPlugin {
    fn kind(&self) -> DriverKind {
        DriverKind::ZeroplusLogicCube
    }

    fn init(&mut self) -> Result<usize> {
        self.cleanup();
        let context = usb::context()?;

        let mut instances = Vec::new();
        for device in usb::find_devices(&context, USB_VENDOR, None)? {
            let pid = match usb::product_id(&device) {
                Ok(pid) => pid,
                Err(e) => {
                    warn!("failed to read product id: {}", e);
                    continue;
                }
            };
            let Some(model) = model_for_pid(pid) else {
                warn!("unknown Zeroplus model {:#06x}", pid);
                continue;
            };
            info!(
                "found {} ({} channels, {}K samples, {} MHz)",
                model.name, model.channels, model.sample_depth, model.max_mhz
            );
            let inst = DeviceInstance::new(
                instances.len(),
                DeviceStatus::Inactive,
                DeviceIdentity::new("Zeroplus", model.name, ""),
                ZeroplusState::new(model),
            )
            .with_usb(usb::address_of(&device));
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
            .ok_or_else(|| Error::msg("zeroplus-logic-cube: plugin not initialised"))?;
        let inst = instance_mut(&mut self.instances, index)?;
        if inst.is_active() {
            return Err(Error::AlreadyActive);
        }

        let address = inst
            .usb
            .ok_or_else(|| Error::DeviceNotFound(format!("zeroplus unit {}", index)))?;
        let device = usb::find_at(context, USB_VENDOR, inst.state.model.pid, address)?
            .ok_or_else(|| Error::DeviceNotFound(format!("zeroplus unit {} on {}", index, address)))?;
        let handle: SharedHandle = Arc::new(usb::open_and_claim(&device, None, USB_INTERFACE)?);

        let mut analyzer = Analyzer::new(GlUsb::new(Arc::clone(&handle)));
        analyzer.reset()?;
        analyzer.initialize()?;

        inst.state.handle = Some(handle);
        inst.status = DeviceStatus::Active;
        Ok(())
    }

    fn close(&mut self, index: usize) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        inst.state.running = None;
        if let Some(handle) = inst.state.handle.take() {
            if let Ok(mut handle) = Arc::try_unwrap(handle) {
                let _ = handle.release_interface(USB_INTERFACE);
            }
            info!("closed {} on {:?}", inst.state.model.name, inst.usb);
            inst.status = DeviceStatus::Inactive;
        }
        Ok(())
    }

    fn info(&self, index: usize, field: InfoField) -> Option<InfoValue> {
        let inst = instance(&self.instances, index).ok()?;
        let model = inst.state.model;
        match field {
            InfoField::Identity => Some(InfoValue::Identity(inst.identity.clone())),
            InfoField::NumProbes => Some(InfoValue::NumProbes(model.channels)),
            InfoField::SampleRates => Some(InfoValue::SampleRates(SampleRates::List(
                model.sample_rates(),
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
        let channels = state.model.channels;

        match value {
            ConfigValue::SampleRate(rate) => {
                if !state.model.sample_rates().contains(&rate) {
                    return Err(Error::bad_value(
                        Capability::SampleRate,
                        format!("{} Hz is not available on the {}", rate, state.model.name),
                    ));
                }
                state.samplerate = rate;
            }
            ConfigValue::Probes(probes) => {
                check_probes(&probes, channels)?;
                let trigger = SoftwareTrigger::from_probes(&probes, NUM_TRIGGER_STAGES)?;
                let stage = hardware_stage(&trigger, channels)?;
                state.trigger = stage;
            }
            ConfigValue::Triggers(specs) => {
                if let Some(other) = specs.iter().find(|s| !matches!(s, TriggerSpec::Logic { .. })) {
                    return Err(Error::UnsupportedTrigger(format!(
                        "{} triggers are not supported by the analyzer",
                        other.kind()
                    )));
                }
                check_trigger_probes(&specs, channels)?;
                let trigger = SoftwareTrigger::from_specs(&specs, NUM_TRIGGER_STAGES)?;
                state.trigger = hardware_stage(&trigger, channels)?;
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
            ConfigValue::LimitSamples(limit) => state.limit_samples = Some(limit),
            other => {
                return Err(Error::bad_value(other.capability(), "not supported by this device"))
            }
        }
        Ok(())
    }

    fn start_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        let compression = self.compression;
        let inst = instance_mut(&mut self.instances, index)?;
        let state = &mut inst.state;
        let handle = state
            .handle
            .clone()
            .ok_or_else(|| Error::msg(format!("zeroplus-logic-cube {} is not open", index)))?;

        if let Some(running) = state.running {
            if ctx.event_loop.contains(running) {
                return Err(Error::msg("acquisition already running"));
            }
        }
        state.running = None;

        let mut analyzer = Analyzer::new(GlUsb::new(handle));
        analyzer.configure(&state.settings(compression))?;
        analyzer.start()?;
        info!(
            "{}: capture armed at {} Hz, waiting for data",
            state.model.name, state.samplerate
        );

        ctx.bus.send(
            ctx.device,
            Packet::Header(Header::new(state.samplerate, state.model.channels)),
        );
        let source = DownloadSource::new(
            ctx.device,
            analyzer,
            state.model.num_packets(),
            compression != Compression::None,
            state.limit_samples,
        );
        state.running = Some(ctx.event_loop.add_source(0, Some(POLL_INTERVAL), Box::new(source)));
        Ok(())
    }

    fn stop_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        let inst = instance_mut(&mut self.instances, index)?;
        if let Some(running) = inst.state.running.take() {
            ctx.event_loop.remove_source(running, ctx.bus);
        }
        Ok(())
    }
}
