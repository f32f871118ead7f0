//! Cypress EZ-USB (FX2) firmware loading over vendor control requests.

use std::time::Duration;

use log::{debug, info};
use rusb::{DeviceHandle, UsbContext};

use super::error::{Result, UsbError};

/// Vendor request that reads/writes internal RAM.
const FIRMWARE_LOAD: u8 = 0xa0;
/// CPU control and status register.
const CPUCS: u16 = 0xe600;
/// Bytes per RAM write.
const CHUNK_SIZE: usize = 4096;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);

fn request_type_out() -> u8 {
    rusb::request_type(
        rusb::Direction::Out,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    )
}

/// Holds (`true`) or releases (`false`) the 8051 core in reset.
pub fn reset<T: UsbContext>(handle: &DeviceHandle<T>, hold: bool) -> Result<()> {
    debug!("setting CPU reset mode to {}", if hold { "on" } else { "off" });
    let buf = [u8::from(hold)];
    let written = handle.write_control(request_type_out(), FIRMWARE_LOAD, CPUCS, 0, &buf, CONTROL_TIMEOUT)?;
    if written != 1 {
        return Err(UsbError::ShortWrite {
            written,
            expected: 1,
        });
    }
    Ok(())
}

/// Splits `image` into RAM writes, each with its load address.
fn load_chunks(image: &[u8]) -> Result<Vec<(u16, &[u8])>> {
    image
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(n, chunk)| {
            let offset =
                u16::try_from(n * CHUNK_SIZE).map_err(|_| UsbError::ImageTooLarge(image.len()))?;
            Ok((offset, chunk))
        })
        .collect()
}

/// Writes `image` to RAM starting at address 0.
pub fn install_firmware<T: UsbContext>(handle: &DeviceHandle<T>, image: &[u8]) -> Result<()> {
    info!("installing {} bytes of firmware", image.len());
    for (offset, chunk) in load_chunks(image)? {
        let written = handle.write_control(
            request_type_out(),
            FIRMWARE_LOAD,
            offset,
            0,
            chunk,
            CONTROL_TIMEOUT,
        )?;
        if written != chunk.len() {
            return Err(UsbError::ShortWrite {
                written,
                expected: chunk.len(),
            });
        }
        debug!("uploaded {} bytes at 0x{:04x}", chunk.len(), offset);
    }
    Ok(())
}

/// Resets the core, loads `image`, and lets it run. The device then
/// disconnects and re-enumerates with the new firmware.
pub fn upload<T: UsbContext>(handle: &DeviceHandle<T>, image: &[u8]) -> Result<()> {
    reset(handle, true)?;
    install_firmware(handle, image)?;
    reset(handle, false)
}
