//! Minimal FTDI FT245/FT232 access over plain USB.
//!
//! Implements the vendor requests needed to drive an FTDI chip in FIFO and
//! bit-bang modes: reset, purge, baud rate, latency, bit mode, and bulk
//! data transfers with the modem status bytes stripped.

use std::time::Duration;

use log::{debug, trace};
use rusb::{Device, DeviceHandle, UsbContext};

use super::error::{Result, UsbError};
use super::usb::open_and_claim;

const REQUEST_OUT: u8 = 0x40;

const SIO_RESET: u8 = 0x00;
const SIO_SET_BAUDRATE: u8 = 0x03;
const SIO_SET_LATENCY_TIMER: u8 = 0x09;
const SIO_SET_BITMODE: u8 = 0x0b;

const SIO_RESET_SIO: u16 = 0;
const SIO_RESET_PURGE_RX: u16 = 1;
const SIO_RESET_PURGE_TX: u16 = 2;

/// Bulk OUT endpoint of interface A.
const EP_OUT: u8 = 0x02;
/// Bulk IN endpoint of interface A.
const EP_IN: u8 = 0x81;
/// Interface A, as used in the wIndex of vendor requests.
const INTERFACE_A: u16 = 1;

/// Every IN packet starts with two modem status bytes.
pub const STATUS_BYTES: usize = 2;
pub const MAX_PACKET_SIZE: usize = 64;

const WRITE_CHUNK: usize = 4096;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);
const DATA_TIMEOUT: Duration = Duration::from_millis(1000);

/// Base clock for baud rate divisors, in 1/8 steps.
const BAUD_CLOCK: u32 = 24_000_000;

/// Pin modes for [`FtdiDevice::set_bitmode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BitMode {
    Reset = 0x00,
    Bitbang = 0x01,
}

/// Encodes `baud` into the (wValue, wIndex) pair of SET_BAUDRATE.
pub fn baud_divisor(baud: u32) -> (u16, u16) {
    const FRAC_CODE: [u32; 8] = [0, 3, 2, 4, 1, 5, 6, 7];

    let baud = baud.max(1);
    let divisor = ((BAUD_CLOCK + baud / 2) / baud).max(8);
    let mut encoded = (divisor >> 3) | (FRAC_CODE[(divisor & 7) as usize] << 14);
    if encoded == 1 {
        // 3 MBaud
        encoded = 0;
    } else if encoded == 0x4001 {
        // 2 MBaud
        encoded = 1;
    }
    ((encoded & 0xffff) as u16, (encoded >> 16) as u16)
}

/// Removes the status bytes from each `packet_size` packet of `raw`.
pub fn strip_status(raw: &[u8], packet_size: usize) -> Vec<u8> {
    raw.chunks(packet_size)
        .filter(|packet| packet.len() > STATUS_BYTES)
        .flat_map(|packet| packet[STATUS_BYTES..].iter().copied())
        .collect()
}

/// An opened FTDI chip.
pub struct FtdiDevice<T: UsbContext> {
    handle: DeviceHandle<T>,
    pending: Vec<u8>,
    timeout: Duration,
}

impl<T: UsbContext> FtdiDevice<T> {
    /// Opens `device` and claims interface A.
    pub fn open(device: &Device<T>) -> crate::Result<Self> {
        let handle = open_and_claim(device, None, 0)?;
        Ok(Self {
            handle,
            pending: Vec::new(),
            timeout: DATA_TIMEOUT,
        })
    }

    fn control(&self, request: u8, value: u16, index: u16) -> Result<()> {
        self.handle
            .write_control(REQUEST_OUT, request, value, index, &[], CONTROL_TIMEOUT)?;
        Ok(())
    }

    pub fn usb_reset(&mut self) -> Result<()> {
        self.pending.clear();
        self.control(SIO_RESET, SIO_RESET_SIO, INTERFACE_A)
    }

    pub fn purge_rx(&mut self) -> Result<()> {
        self.pending.clear();
        self.control(SIO_RESET, SIO_RESET_PURGE_RX, INTERFACE_A)
    }

    pub fn purge_tx(&mut self) -> Result<()> {
        self.control(SIO_RESET, SIO_RESET_PURGE_TX, INTERFACE_A)
    }

    pub fn purge_buffers(&mut self) -> Result<()> {
        self.purge_rx()?;
        self.purge_tx()
    }

    pub fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()> {
        debug!("bitmode {:?}, mask 0x{:02x}", mode, mask);
        self.control(SIO_SET_BITMODE, mask as u16 | (mode as u16) << 8, INTERFACE_A)
    }

    /// Sets the baud rate. In bit-bang mode the chip clocks pins at four
    /// times the nominal rate.
    pub fn set_baudrate(&mut self, baud: u32, bitbang: bool) -> Result<()> {
        let effective = if bitbang { baud.saturating_mul(4) } else { baud };
        let (value, index) = baud_divisor(effective);
        debug!("baud rate {} (value 0x{:04x}, index 0x{:04x})", baud, value, index);
        self.control(SIO_SET_BAUDRATE, value, index)
    }

    pub fn set_latency_timer(&mut self, millis: u8) -> Result<()> {
        self.control(SIO_SET_LATENCY_TIMER, millis as u16, INTERFACE_A)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Writes all of `data`.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        for chunk in data.chunks(WRITE_CHUNK) {
            let written = self.handle.write_bulk(EP_OUT, chunk, self.timeout)?;
            if written != chunk.len() {
                return Err(UsbError::ShortWrite {
                    written,
                    expected: chunk.len(),
                });
            }
        }
        trace!("wrote {} bytes", data.len());
        Ok(data.len())
    }

    /// Reads up to `buf.len()` payload bytes. Returns fewer only when the
    /// chip has nothing more to send.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = self.take_pending(buf);

        while filled < buf.len() {
            let wanted = buf.len() - filled;
            let packets = wanted.div_ceil(MAX_PACKET_SIZE - STATUS_BYTES);
            let mut raw = vec![0u8; packets * MAX_PACKET_SIZE];
            let n = match self.handle.read_bulk(EP_IN, &mut raw, self.timeout) {
                Ok(n) => n,
                Err(rusb::Error::Timeout) => break,
                Err(e) => return Err(e.into()),
            };
            let payload = strip_status(&raw[..n], MAX_PACKET_SIZE);
            if payload.is_empty() {
                break;
            }
            self.pending.extend_from_slice(&payload);
            filled += self.take_pending(&mut buf[filled..]);
        }

        trace!("read {} of {} bytes", filled, buf.len());
        Ok(filled)
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_divisor_special_cases() {
        // 750 kBd bit-bang runs the chip at 3 MBaud
        assert_eq!(baud_divisor(750_000 * 4), (0, 0));
        assert_eq!(baud_divisor(2_000_000), (1, 0));
        assert_eq!(baud_divisor(10_000_000), (0, 0));
    }

    #[test]
    fn test_baud_divisor_common_rates() {
        // 24 MHz / 9600 = 2500 -> 312 + 4/8
        assert_eq!(baud_divisor(9600), (312 | (1 << 14), 0));
        // 24 MHz / 115200 = 208.3 -> 26 + 0/8
        assert_eq!(baud_divisor(115_200), (26, 0));
    }

    #[test]
    fn test_strip_status() {
        let mut raw = vec![0x31, 0x60];
        raw.extend(1..=62u8);
        raw.extend([0x31, 0x60, 0xaa, 0xbb]);
        let payload = strip_status(&raw, MAX_PACKET_SIZE);
        assert_eq!(payload.len(), 64);
        assert_eq!(payload[0], 1);
        assert_eq!(&payload[62..], &[0xaa, 0xbb]);

        // status-only packets carry no data
        assert!(strip_status(&[0x31, 0x60, 0x31, 0x60], 2).is_empty());
    }
}
