//! rusb helpers: finding, opening and claiming devices.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rusb::{Context, Device, DeviceHandle, UsbContext};

use super::error::{Result, UsbError};
use super::pump::{BulkRead, ReadError};
use super::DescriptorShape;
use crate::error::Error;
use crate::types::UsbAddress;

/// Handle type shared between a plugin and its transfer pump.
pub type SharedHandle = Arc<DeviceHandle<Context>>;

/// Creates a libusb context.
pub fn context() -> crate::Result<Context> {
    Context::new().map_err(|e| Error::context("initializing USB", e))
}

/// All devices matching `vid`/`pid`, in bus enumeration order.
pub fn find_devices(context: &Context, vid: u16, pid: Option<u16>) -> Result<Vec<Device<Context>>> {
    let mut found = Vec::new();
    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                warn!("failed to get device descriptor: {}", e);
                continue;
            }
        };
        if descriptor.vendor_id() == vid && pid.map_or(true, |p| descriptor.product_id() == p) {
            found.push(device);
        }
    }
    Ok(found)
}

pub fn address_of<T: UsbContext>(device: &Device<T>) -> UsbAddress {
    UsbAddress::new(device.bus_number(), device.address())
}

pub fn product_id<T: UsbContext>(device: &Device<T>) -> Result<u16> {
    Ok(device.device_descriptor()?.product_id())
}

/// Reads the descriptor fields used for firmware profile checks.
pub fn descriptor_shape<T: UsbContext>(device: &Device<T>) -> Result<DescriptorShape> {
    let descriptor = device.device_descriptor()?;
    let config = device.config_descriptor(0)?;
    let mut shape = DescriptorShape {
        num_configurations: descriptor.num_configurations(),
        num_interfaces: config.num_interfaces(),
        ..Default::default()
    };
    if let Some(interface) = config.interfaces().next() {
        let alt_settings: Vec<_> = interface.descriptors().collect();
        shape.num_alt_settings = alt_settings.len() as u8;
        if let Some(alt) = alt_settings.first() {
            shape.endpoints = alt.endpoint_descriptors().map(|ep| ep.address()).collect();
        }
    }
    Ok(shape)
}

/// Finds the device at `address` among the `vid`/`pid` matches.
pub fn find_at(
    context: &Context,
    vid: u16,
    pid: u16,
    address: UsbAddress,
) -> Result<Option<Device<Context>>> {
    Ok(find_devices(context, vid, Some(pid))?
        .into_iter()
        .find(|d| address_of(d) == address))
}

/// Opens `device`, optionally selects a configuration, and claims
/// `interface`.
pub fn open_and_claim<T: UsbContext>(
    device: &Device<T>,
    configuration: Option<u8>,
    interface: u8,
) -> crate::Result<DeviceHandle<T>> {
    let address = address_of(device);
    let mut handle = device
        .open()
        .map_err(|e| Error::OpenFailed(format!("{}: {}", address, e)))?;
    if let Some(configuration) = configuration {
        if let Err(e) = handle.set_active_configuration(configuration) {
            debug!("{}: set configuration {} failed: {}", address, configuration, e);
        }
    }
    handle
        .claim_interface(interface)
        .map_err(|_| Error::ClaimFailed { interface })?;
    info!("opened device on {} interface {}", address, interface);
    Ok(handle)
}

/// Writes `data` to a bulk OUT endpoint, failing on short writes.
pub fn write_bulk_all<T: UsbContext>(
    handle: &DeviceHandle<T>,
    endpoint: u8,
    data: &[u8],
    timeout: Duration,
) -> Result<()> {
    let written = handle.write_bulk(endpoint, data, timeout)?;
    if written != data.len() {
        return Err(UsbError::ShortWrite {
            written,
            expected: data.len(),
        });
    }
    Ok(())
}

/// A bulk IN endpoint on a shared handle, for [`super::TransferPump`].
pub struct BulkEndpoint {
    handle: SharedHandle,
    endpoint: u8,
}

impl BulkEndpoint {
    pub fn new(handle: SharedHandle, endpoint: u8) -> Self {
        Self { handle, endpoint }
    }
}

impl BulkRead for BulkEndpoint {
    fn read_bulk(&self, buf: &mut [u8], timeout: Duration) -> std::result::Result<usize, ReadError> {
        self.handle
            .read_bulk(self.endpoint, buf, timeout)
            .map_err(ReadError::from)
    }
}
