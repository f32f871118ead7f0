//! Register, DRAM and configuration protocol of the SIGMA FPGA.
//!
//! Every command byte carries a 4-bit opcode in its high nibble and a
//! 4-bit argument in its low nibble, so register addresses and data are
//! sent a nibble at a time.

use log::{debug, info, trace};
use rusb::UsbContext;

use crate::error::{Error, Result};
use crate::transport::ftdi::{BitMode, FtdiDevice};
use crate::trigger::{fixup_position, TriggerLut};

// Write registers.
pub(super) const WRITE_CLOCK_SELECT: u8 = 0;
pub(super) const WRITE_TRIGGER_SELECT0: u8 = 1;
pub(super) const WRITE_TRIGGER_SELECT1: u8 = 2;
pub(super) const WRITE_MODE: u8 = 3;
pub(super) const WRITE_MEMROW: u8 = 4;
pub(super) const WRITE_POST_TRIGGER: u8 = 5;
pub(super) const WRITE_TRIGGER_OPTION: u8 = 6;

// Read registers.
pub(super) const READ_TRIGGER_POS_LOW: u8 = 1;
pub(super) const READ_MODE: u8 = 7;

// Opcodes.
const REG_ADDR_LOW: u8 = 0x00;
const REG_ADDR_HIGH: u8 = 0x10;
const REG_DATA_LOW: u8 = 0x20;
const REG_DATA_HIGH_WRITE: u8 = 0x30;
const REG_READ_ADDR: u8 = 0x40;
const REG_DRAM_WAIT_ACK: u8 = 0x50;
const REG_DRAM_BLOCK: u8 = 0x60;
const REG_DRAM_BLOCK_DATA: u8 = 0xa0;

/// Auto-increment flag on read commands.
const NEXT_REG: u8 = 1;

/// Bytes in one DRAM row.
pub const CHUNK_SIZE: usize = 1024;

/// Address units per DRAM row.
pub const ROW_LENGTH: u32 = 512;

// Mode register values.
pub(super) const MODE_RUN: u8 = 0x0d;
pub(super) const MODE_STOP: u8 = 0x11;
pub(super) const MODE_DOWNLOAD: u8 = 0x02;
/// Set in the read mode register once the trigger has fired.
pub(super) const MODE_TRIGGERED: u8 = 0x20;

/// Trigger in and out options written before arming.
pub(super) const TRIGGER_INOUT: [u8; 2] = [0x08, 0x40];

/// Pulses PROG_B until the FPGA drops its configuration.
const SUICIDE: [u8; 8] = [0x84, 0x84, 0x88, 0x84, 0x88, 0x84, 0x88, 0x84];
/// Raises PROG_B and waits for INIT_B.
const PROG_INIT: [u8; 9] = [0x03, 0x03, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01, 0x01];
/// Switches a freshly configured FPGA into logic analyzer mode and asks
/// for the test pattern back.
const LOGIC_MODE_START: [u8; 12] = [
    0x00, 0x40, 0x0f, 0x25, 0x35, 0x40, 0x2a, 0x3a, 0x40, 0x03, 0x20, 0x38,
];
const LOGIC_MODE_REPLY: [u8; 3] = [0xa6, 0x55, 0xaa];

/// Pins driven in bit-bang mode during configuration.
const BITBANG_PINS: u8 = 0xdf;
const BITBANG_BAUD: u32 = 750_000;
const INIT_B: u8 = 0x20;
const INIT_B_POLLS: usize = 10_000;
/// Upper bound on stale bytes drained after configuration.
const DRAIN_LIMIT: usize = 1 << 16;

// =============================================================================
// Port
// =============================================================================

/// Byte pipe to the FPGA.
pub trait Port: Send {
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Reads up to `buf.len()` bytes, returning fewer when none are pending.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()>;

    /// Sets the nominal bit-bang rate.
    fn set_baudrate(&mut self, baud: u32) -> Result<()>;

    fn purge_buffers(&mut self) -> Result<()>;
}

impl<T: UsbContext + Send> Port for FtdiDevice<T> {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(FtdiDevice::write(self, data)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(FtdiDevice::read(self, buf)?)
    }

    fn set_bitmode(&mut self, mask: u8, mode: BitMode) -> Result<()> {
        Ok(FtdiDevice::set_bitmode(self, mask, mode)?)
    }

    fn set_baudrate(&mut self, baud: u32) -> Result<()> {
        Ok(FtdiDevice::set_baudrate(self, baud, true)?)
    }

    fn purge_buffers(&mut self) -> Result<()> {
        Ok(FtdiDevice::purge_buffers(self)?)
    }
}

/// Corrected capture addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Positions {
    pub trigger: u32,
    pub stop: u32,
}

// =============================================================================
// Sigma
// =============================================================================

/// A SIGMA reached through `port`.
#[derive(Debug)]
pub struct Sigma<P> {
    port: P,
}

impl<P: Port> Sigma<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let written = self.port.write(data)?;
        if written != data.len() {
            return Err(Error::msg(format!(
                "short write to sigma: {} of {} bytes",
                written,
                data.len()
            )));
        }
        Ok(())
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        let read = self.port.read(&mut buf)?;
        if read != len {
            return Err(Error::msg(format!(
                "short read from sigma: {} of {} bytes",
                read, len
            )));
        }
        Ok(buf)
    }

    /// Writes `data` to consecutive bytes of register `reg`.
    pub fn write_register(&mut self, reg: u8, data: &[u8]) -> Result<()> {
        trace!("reg {} <- {:02x?}", reg, data);
        let mut cmd = Vec::with_capacity(2 + 2 * data.len());
        cmd.push(REG_ADDR_LOW | (reg & 0xf));
        cmd.push(REG_ADDR_HIGH | (reg >> 4));
        for byte in data {
            cmd.push(REG_DATA_LOW | (byte & 0xf));
            cmd.push(REG_DATA_HIGH_WRITE | (byte >> 4));
        }
        self.write_all(&cmd)
    }

    pub fn set_register(&mut self, reg: u8, value: u8) -> Result<()> {
        self.write_register(reg, &[value])
    }

    pub fn get_register(&mut self, reg: u8) -> Result<u8> {
        self.write_all(&[
            REG_ADDR_LOW | (reg & 0xf),
            REG_ADDR_HIGH | (reg >> 4),
            REG_READ_ADDR,
        ])?;
        let value = self.read_exact(1)?;
        Ok(value[0])
    }

    /// Reads the trigger and stop addresses.
    pub fn read_positions(&mut self) -> Result<Positions> {
        let mut cmd = vec![REG_ADDR_LOW | READ_TRIGGER_POS_LOW];
        cmd.extend([REG_READ_ADDR | NEXT_REG; 6]);
        self.write_all(&cmd)?;

        let raw = self.read_exact(6)?;
        let word = |b: &[u8]| u32::from(b[0]) | u32::from(b[1]) << 8 | u32::from(b[2]) << 16;
        Ok(Positions {
            trigger: fixup_position(word(&raw[0..3])),
            stop: fixup_position(word(&raw[3..6])),
        })
    }

    /// Reads `num_chunks` DRAM rows starting at `start_chunk`.
    ///
    /// Rows are fetched into two alternating buffers: while one is sent,
    /// the next is loaded into the other.
    pub fn read_dram(&mut self, start_chunk: u16, num_chunks: usize) -> Result<Vec<u8>> {
        if num_chunks == 0 {
            return Ok(Vec::new());
        }
        self.write_register(WRITE_MEMROW, &start_chunk.to_be_bytes())?;

        let mut cmd = vec![REG_DRAM_BLOCK, REG_DRAM_WAIT_ACK];
        for i in 0..num_chunks {
            let last = i + 1 == num_chunks;
            if !last {
                cmd.push(REG_DRAM_BLOCK | ((((i + 1) % 2) as u8) << 4));
            }
            cmd.push(REG_DRAM_BLOCK_DATA | (((i % 2) as u8) << 4));
            if !last {
                cmd.push(REG_DRAM_WAIT_ACK);
            }
        }
        self.write_all(&cmd)?;
        self.read_exact(num_chunks * CHUNK_SIZE)
    }

    /// Programs the trigger LUT and its parameter block.
    pub fn write_trigger_lut(&mut self, lut: &TriggerLut) -> Result<()> {
        for (i, row) in lut.transposed().iter().enumerate() {
            self.write_register(WRITE_TRIGGER_SELECT0, row)?;
            self.set_register(WRITE_TRIGGER_SELECT1, 0x30 | i as u8)?;
        }
        self.write_register(WRITE_TRIGGER_SELECT0, &lut.params.to_bytes())
    }

    /// Configures the FPGA with a bit-bang encoded bitstream and switches
    /// it into logic analyzer mode.
    pub fn upload_firmware(&mut self, bitbang: &[u8]) -> Result<()> {
        self.port.set_bitmode(BITBANG_PINS, BitMode::Bitbang)?;
        self.port.set_baudrate(BITBANG_BAUD)?;

        for _ in 0..4 {
            self.write_all(&SUICIDE)?;
        }
        self.write_all(&PROG_INIT)?;
        self.port.purge_buffers()?;
        self.wait_init_b()?;

        info!("uploading {} bytes of FPGA configuration", bitbang.len());
        self.write_all(bitbang)?;

        self.port.set_bitmode(0x00, BitMode::Reset)?;
        self.port.purge_buffers()?;
        self.drain()?;

        self.write_all(&LOGIC_MODE_START)?;
        let mut reply = [0u8; 3];
        let read = self.port.read(&mut reply)?;
        if read != reply.len() || reply != LOGIC_MODE_REPLY {
            return Err(Error::FirmwareError(format!(
                "unexpected logic mode reply {:02x?}",
                &reply[..read]
            )));
        }
        debug!("FPGA configured");
        Ok(())
    }

    fn wait_init_b(&mut self) -> Result<()> {
        let mut pins = [0u8; 1];
        for _ in 0..INIT_B_POLLS {
            if self.port.read(&mut pins)? == 1 && pins[0] & INIT_B != 0 {
                return Ok(());
            }
        }
        Err(Error::FirmwareError("FPGA did not raise INIT_B".into()))
    }

    fn drain(&mut self) -> Result<()> {
        let mut byte = [0u8; 1];
        for _ in 0..DRAIN_LIMIT {
            if self.port.read(&mut byte)? != 1 {
                return Ok(());
            }
        }
        Err(Error::FirmwareError("FPGA keeps sending after configuration".into()))
    }
}
