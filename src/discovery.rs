//! Device discovery.
//!
//! [`DeviceDiscovery`] owns one plugin per driver family, runs each enabled
//! plugin's scan and hands out a [`Device`] per instance found.

use log::{debug, info, warn};

use crate::device::{share_plugin, Device, DeviceInfo, SharedPlugin};
use crate::error::{Error, Result};
use crate::plugin::DevicePlugin;
use crate::types::{DriverKind, EnabledDrivers, InfoField, InfoValue};

#[cfg(feature = "asix-sigma")]
use crate::protocols::asix_sigma::SigmaPlugin;
#[cfg(feature = "demo")]
use crate::protocols::demo::DemoPlugin;
#[cfg(feature = "saleae-logic")]
use crate::protocols::saleae_logic::SaleaePlugin;
#[cfg(feature = "zeroplus-logic-cube")]
use crate::protocols::zeroplus_logic_cube::ZeroplusPlugin;

/// Plugins for every driver compiled into this build.
fn builtin_plugins() -> Vec<Box<dyn DevicePlugin>> {
    #[allow(unused_mut)]
    let mut plugins: Vec<Box<dyn DevicePlugin>> = Vec::new();
    #[cfg(feature = "demo")]
    plugins.push(Box::new(DemoPlugin::new()));
    #[cfg(feature = "saleae-logic")]
    plugins.push(Box::new(SaleaePlugin::new()));
    #[cfg(feature = "zeroplus-logic-cube")]
    plugins.push(Box::new(ZeroplusPlugin::new()));
    #[cfg(feature = "asix-sigma")]
    plugins.push(Box::new(SigmaPlugin::new()));
    plugins
}

/// Discovery coordinator for all driver families.
pub struct DeviceDiscovery {
    plugins: Vec<SharedPlugin>,
    /// Plugins added with [`register`](Self::register); always scanned.
    external: Vec<SharedPlugin>,
    enabled: EnabledDrivers,
}

impl DeviceDiscovery {
    /// Creates a discovery instance with the built-in drivers.
    ///
    /// No hardware is touched until [`scan`](Self::scan).
    pub fn new(enabled: EnabledDrivers) -> Self {
        Self {
            plugins: builtin_plugins().into_iter().map(share_plugin).collect(),
            external: Vec::new(),
            enabled,
        }
    }

    /// Update which driver families to scan.
    pub fn set_enabled(&mut self, enabled: EnabledDrivers) {
        self.enabled = enabled;
    }

    pub fn enabled(&self) -> &EnabledDrivers {
        &self.enabled
    }

    /// Adds a driver supplied by the application.
    pub fn register(&mut self, plugin: Box<dyn DevicePlugin>) {
        debug!("registered external driver {}", plugin.kind().name());
        self.external.push(share_plugin(plugin));
    }

    /// Rescans every enabled driver.
    ///
    /// Each scan starts from a clean plugin: instances from an earlier scan
    /// are closed first. A driver whose scan fails is skipped.
    pub fn scan(&mut self) -> Vec<Device> {
        let enabled = &self.enabled;
        let builtin = self.plugins.iter().filter(|p| {
            let plugin = p.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            enabled.is_enabled(&plugin.kind())
        });

        let mut devices = Vec::new();
        for shared in builtin.chain(self.external.iter()) {
            devices.extend(scan_plugin(shared));
        }
        info!("found {} device(s)", devices.len());
        devices
    }

    /// Scans, then opens the device whose id is `id`.
    pub fn open(&mut self, id: &str) -> Result<Device> {
        let device = self
            .scan()
            .into_iter()
            .find(|d| d.id() == id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        device.open()?;
        Ok(device)
    }
}

impl Default for DeviceDiscovery {
    fn default() -> Self {
        Self::new(EnabledDrivers::default())
    }
}

fn scan_plugin(shared: &SharedPlugin) -> Vec<Device> {
    let mut plugin = shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let kind = plugin.kind();
    plugin.cleanup();
    let count = match plugin.init() {
        Ok(count) => count,
        Err(e) => {
            warn!("{} scan failed: {}", kind.name(), e);
            return Vec::new();
        }
    };
    debug!("{}: {} instance(s)", kind.name(), count);

    (0..count)
        .map(|index| {
            let name = device_name(plugin.as_ref(), &kind, index);
            Device::new(DeviceInfo::new(kind.clone(), index, name), shared.clone(), index)
        })
        .collect()
}

/// Identity reported by the driver, or the family name.
fn device_name(plugin: &dyn DevicePlugin, kind: &DriverKind, index: usize) -> String {
    match plugin.info(index, InfoField::Identity) {
        Some(InfoValue::Identity(identity)) if !identity.model.is_empty() => identity.to_string(),
        _ => kind.display_name().to_string(),
    }
}
