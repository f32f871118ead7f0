//! Register access over the Genesys Logic USB bridge.
//!
//! Registers are reached indirectly: a vendor request latches the address,
//! a second one writes or reads the data byte. Memory is read by arming a
//! bulk transfer with its length, then reading EP1 IN.

use std::time::Duration;

use log::trace;
use rusb::{Direction, Recipient, RequestType};

use super::analyzer::RegisterIo;
use crate::error::{Error, Result};
use crate::transport::usb::SharedHandle;
use crate::transport::UsbError;

const REQ_READBULK: u16 = 0x82;
const REQ_WRITEADDR: u16 = 0x83;
const REQ_READDATA: u16 = 0x84;
const REQ_WRITEDATA: u16 = 0x85;

const REQUEST_REGISTER: u8 = 0x0c;
const REQUEST_BULK: u8 = 0x04;

const EP_BULK_IN: u8 = 0x81;
const TIMEOUT: Duration = Duration::from_millis(5000);

/// Register link over a shared device handle. Clones share the handle.
#[derive(Clone)]
pub struct GlUsb {
    handle: SharedHandle,
}

impl GlUsb {
    pub fn new(handle: SharedHandle) -> Self {
        Self { handle }
    }

    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<()> {
        let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Interface);
        let written = self
            .handle
            .write_control(request_type, request, value, 0, data, TIMEOUT)
            .map_err(UsbError::from)?;
        if written != data.len() {
            return Err(UsbError::ShortWrite {
                written,
                expected: data.len(),
            }
            .into());
        }
        Ok(())
    }

    fn control_in(&self, request: u8, value: u16) -> Result<u8> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Interface);
        let mut data = [0u8; 1];
        let read = self
            .handle
            .read_control(request_type, request, value, 0, &mut data, TIMEOUT)
            .map_err(UsbError::from)?;
        if read != 1 {
            return Err(UsbError::InvalidResponse.into());
        }
        Ok(data[0])
    }
}

impl RegisterIo for GlUsb {
    fn write_reg(&mut self, reg: u8, value: u8) -> Result<()> {
        trace!("reg {:#04x} <- {:#04x}", reg, value);
        self.control_out(REQUEST_REGISTER, REQ_WRITEADDR, &[reg])?;
        self.control_out(REQUEST_REGISTER, REQ_WRITEDATA, &[value])
    }

    fn read_reg(&mut self, reg: u8) -> Result<u8> {
        self.control_out(REQUEST_REGISTER, REQ_WRITEADDR, &[reg])?;
        self.control_in(REQUEST_REGISTER, REQ_READDATA)
    }

    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = u32::try_from(buf.len())
            .map_err(|_| Error::msg(format!("bulk read of {} bytes too large", buf.len())))?;
        let mut arm = [0u8; 8];
        arm[4..].copy_from_slice(&size.to_le_bytes());
        self.control_out(REQUEST_BULK, REQ_READBULK, &arm)?;

        let read = self
            .handle
            .read_bulk(EP_BULK_IN, buf, TIMEOUT)
            .map_err(UsbError::from)?;
        Ok(read)
    }
}
