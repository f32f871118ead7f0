//! Device, probe and capability types.
//!
//! Provides driver-agnostic types for configuring acquisitions and
//! describing devices, plus the enum-dispatched configuration values
//! that every driver accepts through [`crate::DevicePlugin::set_configuration`].

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// `n` kilohertz in Hz.
pub const fn khz(n: u64) -> u64 {
    n * 1_000
}

/// `n` megahertz in Hz.
pub const fn mhz(n: u64) -> u64 {
    n * 1_000_000
}

/// `n` gigahertz in Hz.
pub const fn ghz(n: u64) -> u64 {
    n * 1_000_000_000
}

/// Formats a sample rate with the largest unit that divides it exactly.
///
/// `samplerate_string(mhz(24))` is `"24 MHz"`, `samplerate_string(1500)` is
/// `"1500 Hz"`.
pub fn samplerate_string(rate: u64) -> String {
    if rate >= ghz(1) && rate % ghz(1) == 0 {
        format!("{} GHz", rate / ghz(1))
    } else if rate >= mhz(1) && rate % mhz(1) == 0 {
        format!("{} MHz", rate / mhz(1))
    } else if rate >= khz(1) && rate % khz(1) == 0 {
        format!("{} kHz", rate / khz(1))
    } else {
        format!("{} Hz", rate)
    }
}

// =============================================================================
// Driver kinds
// =============================================================================

/// Families of logic analyzer hardware supported.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DriverKind {
    /// Synthetic pattern generator, no hardware required.
    Demo,
    /// Saleae Logic (Cypress FX2 based, bulk streaming).
    SaleaeLogic,
    /// Zeroplus Logic Cube LAP-C series (on-device memory).
    ZeroplusLogicCube,
    /// ASIX SIGMA (FTDI + FPGA, RLE compressed DRAM).
    AsixSigma,
    /// Driver supplied by the application.
    Custom(String),
}

impl DriverKind {
    /// Returns all built-in driver kinds.
    pub fn all() -> &'static [DriverKind] {
        &[
            DriverKind::Demo,
            DriverKind::SaleaeLogic,
            DriverKind::ZeroplusLogicCube,
            DriverKind::AsixSigma,
        ]
    }

    /// Short machine-readable name, used as the device id prefix.
    pub fn name(&self) -> &str {
        match self {
            DriverKind::Demo => "demo",
            DriverKind::SaleaeLogic => "saleae-logic",
            DriverKind::ZeroplusLogicCube => "zeroplus-logic-cube",
            DriverKind::AsixSigma => "asix-sigma",
            DriverKind::Custom(name) => name,
        }
    }

    /// Returns the display name for this driver kind.
    pub fn display_name(&self) -> &str {
        match self {
            DriverKind::Demo => "Demo driver and pattern generator",
            DriverKind::SaleaeLogic => "Saleae Logic",
            DriverKind::ZeroplusLogicCube => "Zeroplus Logic Cube LAP-C series",
            DriverKind::AsixSigma => "ASIX SIGMA",
            DriverKind::Custom(name) => name,
        }
    }

    /// Returns a description of this driver kind.
    pub fn description(&self) -> &'static str {
        match self {
            DriverKind::Demo => "Synthetic logic source",
            DriverKind::SaleaeLogic => "USB streaming logic analyzer",
            DriverKind::ZeroplusLogicCube => "USB logic analyzer with sample memory",
            DriverKind::AsixSigma => "USB logic analyzer with compressed sample memory",
            DriverKind::Custom(_) => "Custom driver",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Set of enabled driver kinds for discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EnabledDrivers {
    kinds: HashSet<DriverKind>,
}

impl EnabledDrivers {
    /// Creates a new set with all built-in drivers enabled.
    pub fn all() -> Self {
        Self {
            kinds: DriverKind::all().iter().cloned().collect(),
        }
    }

    /// Creates an empty set (no drivers enabled).
    pub fn none() -> Self {
        Self {
            kinds: HashSet::new(),
        }
    }

    /// Returns true if the given kind is enabled.
    pub fn is_enabled(&self, kind: &DriverKind) -> bool {
        self.kinds.contains(kind)
    }

    /// Enables a driver kind for discovery.
    pub fn enable(&mut self, kind: DriverKind) -> &mut Self {
        self.kinds.insert(kind);
        self
    }

    /// Disables a driver kind for discovery.
    pub fn disable(&mut self, kind: &DriverKind) -> &mut Self {
        self.kinds.remove(kind);
        self
    }

    /// Returns an iterator over enabled kinds.
    pub fn iter(&self) -> impl Iterator<Item = &DriverKind> {
        self.kinds.iter()
    }

    /// Returns true if no kinds are enabled.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

impl Default for EnabledDrivers {
    fn default() -> Self {
        Self::all()
    }
}

impl std::iter::FromIterator<DriverKind> for EnabledDrivers {
    fn from_iter<I: IntoIterator<Item = DriverKind>>(iter: I) -> Self {
        Self {
            kinds: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Device identity and lifecycle
// =============================================================================

/// Lifecycle state of a device instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceStatus {
    /// No device at this index.
    NotFound,
    /// Firmware was uploaded and the device is re-enumerating.
    Initializing,
    /// Present and idle, not opened.
    Inactive,
    /// Opened and interface claimed.
    Active,
}

/// Vendor/model/version triple reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceIdentity {
    pub vendor: String,
    pub model: String,
    pub version: String,
}

impl DeviceIdentity {
    pub fn new(
        vendor: impl Into<String>,
        model: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.vendor, self.model)?;
        if !self.version.is_empty() {
            write!(f, " {}", self.version)?;
        }
        Ok(())
    }
}

/// USB bus number and device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UsbAddress {
    pub bus: u8,
    pub address: u8,
}

impl UsbAddress {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// A configurable property a driver may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Capability {
    SampleRate,
    ProbeConfig,
    TriggerConfig,
    /// Pre/post-trigger split, in percent.
    CaptureRatio,
    LimitSamples,
    LimitMsec,
    Continuous,
    /// Pattern generator mode (demo driver).
    PatternMode,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::SampleRate => "samplerate",
            Capability::ProbeConfig => "probeconfig",
            Capability::TriggerConfig => "triggerconfig",
            Capability::CaptureRatio => "captureratio",
            Capability::LimitSamples => "limit_samples",
            Capability::LimitMsec => "limit_msec",
            Capability::Continuous => "continuous",
            Capability::PatternMode => "patternmode",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Probes and triggers
// =============================================================================

/// One digital input channel.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Probe {
    /// 1-based probe index.
    pub index: usize,
    pub enabled: bool,
    pub name: String,
    /// Per-stage trigger characters, one per stage (e.g. `"01"`).
    pub trigger: Option<String>,
}

impl Probe {
    /// Creates an enabled probe named after its index.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            enabled: true,
            name: index.to_string(),
            trigger: None,
        }
    }

    /// Sets the per-stage trigger string.
    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    /// Sets the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Marks the probe as disabled.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Bit mask of this probe within a sample word.
    pub fn mask(&self) -> u64 {
        1u64 << (self.index.saturating_sub(1) as u32 & 63)
    }
}

/// Default probe list `1..=count`, all enabled.
pub fn default_probes(count: usize) -> Vec<Probe> {
    (1..=count).map(Probe::new).collect()
}

/// Edge polarity for edge triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EdgeDirection {
    Rising,
    Falling,
    Both,
}

/// One stage of a logic trigger: fires when `(sample & mask) == value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StagePredicate {
    pub mask: u64,
    pub value: u64,
}

impl StagePredicate {
    pub fn new(mask: u64, value: u64) -> Self {
        Self {
            mask,
            value: value & mask,
        }
    }

    pub fn matches(&self, sample: u64) -> bool {
        sample & self.mask == self.value
    }
}

/// Trigger description handed to a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TriggerSpec {
    /// Value/mask match, one predicate per stage.
    Logic { stages: Vec<StagePredicate> },
    /// Per-probe stage string, same syntax as [`Probe::trigger`].
    Sequence { probe: usize, pattern: String },
    /// Edge on a single probe (1-based).
    Edge {
        probe: usize,
        direction: EdgeDirection,
    },
    Width,
    Count,
    Serial,
    Protocol,
}

impl TriggerSpec {
    /// Single-stage logic trigger.
    pub fn logic(mask: u64, value: u64) -> Self {
        TriggerSpec::Logic {
            stages: vec![StagePredicate::new(mask, value)],
        }
    }

    pub fn kind(&self) -> TriggerType {
        match self {
            TriggerSpec::Logic { .. } => TriggerType::Logic,
            TriggerSpec::Sequence { .. } => TriggerType::Sequence,
            TriggerSpec::Edge { .. } => TriggerType::Edge,
            TriggerSpec::Width => TriggerType::Width,
            TriggerSpec::Count => TriggerType::Count,
            TriggerSpec::Serial => TriggerType::Serial,
            TriggerSpec::Protocol => TriggerType::Protocol,
        }
    }
}

/// Discriminant of [`TriggerSpec`], used in capability listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TriggerType {
    Logic,
    Sequence,
    Edge,
    Width,
    Count,
    Serial,
    Protocol,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerType::Logic => "logic",
            TriggerType::Sequence => "sequence",
            TriggerType::Edge => "edge",
            TriggerType::Width => "width",
            TriggerType::Count => "count",
            TriggerType::Serial => "serial",
            TriggerType::Protocol => "protocol",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Sample rates and pattern modes
// =============================================================================

/// Sample rates a device supports.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SampleRates {
    Range { low: u64, high: u64, step: u64 },
    List(Vec<u64>),
}

impl SampleRates {
    pub fn contains(&self, rate: u64) -> bool {
        match self {
            SampleRates::Range { low, high, step } => {
                rate >= *low && rate <= *high && (*step == 0 || (rate - low) % step == 0)
            }
            SampleRates::List(rates) => rates.contains(&rate),
        }
    }
}

/// Demo generator pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PatternMode {
    #[default]
    Random,
    Incremental,
}

impl PatternMode {
    pub fn all() -> &'static [PatternMode] {
        &[PatternMode::Random, PatternMode::Incremental]
    }

    pub fn name(&self) -> &'static str {
        match self {
            PatternMode::Random => "random",
            PatternMode::Incremental => "incremental",
        }
    }
}

impl FromStr for PatternMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(PatternMode::Random),
            "incremental" => Ok(PatternMode::Incremental),
            other => Err(Error::bad_value(
                Capability::PatternMode,
                format!("unknown pattern '{}'", other),
            )),
        }
    }
}

impl fmt::Display for PatternMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Configuration values
// =============================================================================

/// A typed configuration value. The capability it configures is implied by
/// the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConfigValue {
    SampleRate(u64),
    Probes(Vec<Probe>),
    Triggers(Vec<TriggerSpec>),
    CaptureRatio(u8),
    LimitSamples(u64),
    LimitMsec(u64),
    Continuous(bool),
    PatternMode(PatternMode),
}

impl ConfigValue {
    pub fn capability(&self) -> Capability {
        match self {
            ConfigValue::SampleRate(_) => Capability::SampleRate,
            ConfigValue::Probes(_) => Capability::ProbeConfig,
            ConfigValue::Triggers(_) => Capability::TriggerConfig,
            ConfigValue::CaptureRatio(_) => Capability::CaptureRatio,
            ConfigValue::LimitSamples(_) => Capability::LimitSamples,
            ConfigValue::LimitMsec(_) => Capability::LimitMsec,
            ConfigValue::Continuous(_) => Capability::Continuous,
            ConfigValue::PatternMode(_) => Capability::PatternMode,
        }
    }
}

/// Information a driver can be queried for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InfoField {
    Identity,
    NumProbes,
    SampleRates,
    TriggerTypes,
    CurrentSampleRate,
    PatternModes,
    UsbAddress,
}

/// Answer to an [`InfoField`] query.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum InfoValue {
    Identity(DeviceIdentity),
    NumProbes(usize),
    SampleRates(SampleRates),
    /// Characters accepted in per-probe trigger strings.
    TriggerTypes(String),
    CurrentSampleRate(u64),
    PatternModes(Vec<PatternMode>),
    UsbAddress(UsbAddress),
}
