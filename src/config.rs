//! Acquisition configuration builder.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::plugin::DevicePlugin;
use crate::types::{ConfigValue, PatternMode, Probe, TriggerSpec};

/// An ordered list of configuration values to apply to a device.
///
/// ```
/// use logic_capture::{mhz, DeviceConfig};
///
/// let config = DeviceConfig::new()
///     .with_sample_rate(mhz(1))
///     .with_limit_samples(10_000);
/// assert_eq!(config.values().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceConfig {
    values: Vec<ConfigValue>,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, value: ConfigValue) -> Self {
        self.values.push(value);
        self
    }

    pub fn with_sample_rate(self, rate: u64) -> Self {
        self.with(ConfigValue::SampleRate(rate))
    }

    pub fn with_probes(self, probes: Vec<Probe>) -> Self {
        self.with(ConfigValue::Probes(probes))
    }

    pub fn with_triggers(self, triggers: Vec<TriggerSpec>) -> Self {
        self.with(ConfigValue::Triggers(triggers))
    }

    pub fn with_capture_ratio(self, percent: u8) -> Self {
        self.with(ConfigValue::CaptureRatio(percent))
    }

    pub fn with_limit_samples(self, samples: u64) -> Self {
        self.with(ConfigValue::LimitSamples(samples))
    }

    pub fn with_limit_msec(self, msec: u64) -> Self {
        self.with(ConfigValue::LimitMsec(msec))
    }

    pub fn with_continuous(self, continuous: bool) -> Self {
        self.with(ConfigValue::Continuous(continuous))
    }

    pub fn with_pattern(self, mode: PatternMode) -> Self {
        self.with(ConfigValue::PatternMode(mode))
    }

    pub fn values(&self) -> &[ConfigValue] {
        &self.values
    }

    /// Applies every value in order. Stops at the first rejected value.
    pub fn apply(&self, plugin: &mut dyn DevicePlugin, index: usize) -> Result<()> {
        for value in &self.values {
            plugin.set_configuration(index, value.clone())?;
        }
        Ok(())
    }
}
