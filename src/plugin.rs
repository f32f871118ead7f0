//! Device plugin contract.
//!
//! This module provides the [`DevicePlugin`] trait that every driver
//! implements, plus the per-instance bookkeeping drivers share.

use crate::datafeed::{DatafeedBus, DeviceId};
use crate::error::{Error, Result};
use crate::event_loop::EventLoop;
use crate::types::{
    Capability, ConfigValue, DeviceIdentity, DeviceStatus, DriverKind, InfoField, InfoValue,
    UsbAddress,
};

// =============================================================================
// Acquisition context
// =============================================================================

/// What a plugin gets to work with while starting or stopping a capture.
pub struct AcquisitionContext<'a> {
    /// Session-wide id stamped on every packet of this device.
    pub device: DeviceId,
    pub event_loop: &'a mut EventLoop,
    pub bus: &'a mut DatafeedBus,
}

impl<'a> AcquisitionContext<'a> {
    pub fn new(device: DeviceId, event_loop: &'a mut EventLoop, bus: &'a mut DatafeedBus) -> Self {
        Self {
            device,
            event_loop,
            bus,
        }
    }
}

// =============================================================================
// DevicePlugin Trait
// =============================================================================

/// A driver for one family of devices.
///
/// A plugin owns every instance of its family found by [`init`](Self::init)
/// and addresses them by plugin-local index. Configuration lives on the
/// instance; a rejected value leaves the previous configuration in place.
///
/// # Contract
///
/// 1. Unknown indices fail with [`Error::DeviceNotFound`]; [`status`](Self::status)
///    reports [`DeviceStatus::NotFound`].
/// 2. [`set_configuration`](Self::set_configuration) rejects capabilities not
///    listed by [`capabilities`](Self::capabilities) with [`Error::BadValue`].
/// 3. [`open`](Self::open) on an active instance fails with [`Error::AlreadyActive`].
/// 4. [`start_acquisition`](Self::start_acquisition) sends the Header
///    packet and registers the sources producing the rest of the stream,
///    which must end with exactly one End packet.
pub trait DevicePlugin: Send + 'static {
    /// Returns the driver family.
    fn kind(&self) -> DriverKind;

    /// Scans for devices and returns how many instances were found.
    fn init(&mut self) -> Result<usize>;

    /// Closes every instance and forgets them.
    fn cleanup(&mut self);

    /// Number of instances found by the last [`init`](Self::init).
    fn num_devices(&self) -> usize;

    fn open(&mut self, index: usize) -> Result<()>;

    fn close(&mut self, index: usize) -> Result<()>;

    /// Answers an info query, or `None` if the field is not known.
    fn info(&self, index: usize, field: InfoField) -> Option<InfoValue>;

    fn status(&self, index: usize) -> DeviceStatus;

    fn capabilities(&self) -> &[Capability];

    fn set_configuration(&mut self, index: usize, value: ConfigValue) -> Result<()>;

    fn start_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()>;

    fn stop_acquisition(&mut self, index: usize, ctx: &mut AcquisitionContext<'_>) -> Result<()>;

    /// Returns true if the capability is advertised.
    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Fails with [`Error::BadValue`] unless `value` targets an advertised
/// capability.
pub fn check_capability(capabilities: &[Capability], value: &ConfigValue) -> Result<()> {
    let capability = value.capability();
    if capabilities.contains(&capability) {
        Ok(())
    } else {
        Err(Error::bad_value(capability, "not supported by this device"))
    }
}

// =============================================================================
// Device instances
// =============================================================================

/// One device found by a plugin, with driver-specific state `S`.
#[derive(Debug)]
pub struct DeviceInstance<S> {
    pub index: usize,
    pub status: DeviceStatus,
    pub identity: DeviceIdentity,
    pub usb: Option<UsbAddress>,
    pub state: S,
}

impl<S> DeviceInstance<S> {
    pub fn new(index: usize, status: DeviceStatus, identity: DeviceIdentity, state: S) -> Self {
        Self {
            index,
            status,
            identity,
            usb: None,
            state,
        }
    }

    pub fn with_usb(mut self, usb: UsbAddress) -> Self {
        self.usb = Some(usb);
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == DeviceStatus::Active
    }
}

/// Looks up an instance by index.
pub fn instance<S>(instances: &[DeviceInstance<S>], index: usize) -> Result<&DeviceInstance<S>> {
    instances
        .iter()
        .find(|i| i.index == index)
        .ok_or_else(|| Error::no_index(index))
}

/// Looks up an instance by index, mutably.
pub fn instance_mut<S>(
    instances: &mut [DeviceInstance<S>],
    index: usize,
) -> Result<&mut DeviceInstance<S>> {
    instances
        .iter_mut()
        .find(|i| i.index == index)
        .ok_or_else(|| Error::no_index(index))
}

/// Status of an instance, [`DeviceStatus::NotFound`] for unknown indices.
pub fn instance_status<S>(instances: &[DeviceInstance<S>], index: usize) -> DeviceStatus {
    instance(instances, index)
        .map(|i| i.status)
        .unwrap_or(DeviceStatus::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_capability() {
        let caps = [Capability::SampleRate, Capability::LimitSamples];
        assert!(check_capability(&caps, &ConfigValue::SampleRate(1)).is_ok());
        assert!(matches!(
            check_capability(&caps, &ConfigValue::Continuous(true)),
            Err(Error::BadValue {
                capability: Capability::Continuous,
                ..
            })
        ));
    }

    #[test]
    fn test_instance_lookup() {
        let mut instances = vec![
            DeviceInstance::new(0, DeviceStatus::Inactive, DeviceIdentity::default(), 1u8),
            DeviceInstance::new(1, DeviceStatus::Initializing, DeviceIdentity::default(), 2u8),
        ];
        assert_eq!(instance(&instances, 1).unwrap().state, 2);
        instance_mut(&mut instances, 0).unwrap().status = DeviceStatus::Active;
        assert!(instances[0].is_active());
        assert_eq!(instance_status(&instances, 7), DeviceStatus::NotFound);
        assert!(matches!(
            instance(&instances, 7),
            Err(Error::DeviceNotFound(_))
        ));
    }
}
