//! A handle to one device instance of a plugin.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::config::DeviceConfig;
use crate::error::Result;
use crate::plugin::{AcquisitionContext, DevicePlugin};
use crate::types::{
    Capability, ConfigValue, DeviceStatus, DriverKind, InfoField, InfoValue, SampleRates,
};

/// A plugin shared by every device handle of its family.
pub type SharedPlugin = Arc<Mutex<Box<dyn DevicePlugin>>>;

/// Wraps a plugin so several [`Device`] handles can share it.
pub fn share_plugin(plugin: Box<dyn DevicePlugin>) -> SharedPlugin {
    Arc::new(Mutex::new(plugin))
}

/// Device information for discovery and display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable identifier, `"<driver>:<index>"`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub kind: DriverKind,
}

impl DeviceInfo {
    pub fn new(kind: DriverKind, index: usize, name: impl Into<String>) -> Self {
        Self {
            id: format!("{}:{}", kind.name(), index),
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// One instance of a plugin, addressed by its plugin-local index.
#[derive(Clone)]
pub struct Device {
    info: DeviceInfo,
    plugin: SharedPlugin,
    index: usize,
}

impl Device {
    pub fn new(info: DeviceInfo, plugin: SharedPlugin, index: usize) -> Self {
        Self {
            info,
            plugin,
            index,
        }
    }

    /// Wraps a single-instance plugin that has already been initialised.
    pub fn from_plugin(plugin: Box<dyn DevicePlugin>, index: usize) -> Self {
        let kind = plugin.kind();
        let name = kind.display_name().to_string();
        Self::new(DeviceInfo::new(kind, index, name), share_plugin(plugin), index)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn kind(&self) -> &DriverKind {
        &self.info.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }

    fn plugin(&self) -> MutexGuard<'_, Box<dyn DevicePlugin>> {
        self.plugin.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open(&self) -> Result<()> {
        self.plugin().open(self.index)
    }

    pub fn close(&self) -> Result<()> {
        self.plugin().close(self.index)
    }

    pub fn status(&self) -> DeviceStatus {
        self.plugin().status(self.index)
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.plugin().capabilities().to_vec()
    }

    pub fn query(&self, field: InfoField) -> Option<InfoValue> {
        self.plugin().info(self.index, field)
    }

    /// Number of logic probes, 0 if the driver does not say.
    pub fn num_probes(&self) -> usize {
        match self.query(InfoField::NumProbes) {
            Some(InfoValue::NumProbes(n)) => n,
            _ => 0,
        }
    }

    pub fn sample_rates(&self) -> Option<SampleRates> {
        match self.query(InfoField::SampleRates) {
            Some(InfoValue::SampleRates(rates)) => Some(rates),
            _ => None,
        }
    }

    pub fn current_sample_rate(&self) -> Option<u64> {
        match self.query(InfoField::CurrentSampleRate) {
            Some(InfoValue::CurrentSampleRate(rate)) => Some(rate),
            _ => None,
        }
    }

    pub fn set(&self, value: ConfigValue) -> Result<()> {
        self.plugin().set_configuration(self.index, value)
    }

    /// Applies every value of `config` in order.
    pub fn configure(&self, config: &DeviceConfig) -> Result<()> {
        let mut plugin = self.plugin();
        config.apply(plugin.as_mut(), self.index)
    }

    pub fn start(&self, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        self.plugin().start_acquisition(self.index, ctx)
    }

    pub fn stop(&self, ctx: &mut AcquisitionContext<'_>) -> Result<()> {
        self.plugin().stop_acquisition(self.index, ctx)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", &self.info)
            .field("index", &self.index)
            .finish()
    }
}
