//! Register sequences of the LAP-C analyzer.
//!
//! The analyzer is driven entirely through byte-wide registers plus one bulk
//! read path for the sample memory. [`RegisterIo`] abstracts that access so
//! the sequences can run against the USB link or a test double.

use log::{debug, trace};

use super::{FrequencyRegs, TRIGGER_STATUS_REGS};
use crate::error::Result;

// Registers
const START_STATUS: u8 = 0x20;
const DEVICE_STATUS: u8 = 0x21;
const DEVICE_ID0: u8 = 0x10;
const DEVICE_ID1: u8 = 0x11;

const FREQUENCY_REG0: u8 = 0x30;
const FREQUENCY_REG1: u8 = 0x31;
const FREQUENCY_REG2: u8 = 0x32;
const FREQUENCY_REG4: u8 = 0x34;
const MEMORY_LENGTH: u8 = 0x35;
const CLOCK_SOURCE: u8 = 0x36;

const TRIGGER_STATUS0: u8 = 0x40;
const TRIGGER_COUNT0: u8 = 0x50;
const TRIGGER_COUNT1: u8 = 0x51;
const TRIGGER_LEVEL0: u8 = 0x55;
const TRIGGER_LEVELS: u8 = 4;

const RAMSIZE_TRIGGERBAR_ADDRESS0: u8 = 0x60;
const TRIGGERBAR_ADDRESS0: u8 = 0x63;
const DONT_CARE_TRIGGERBAR: u8 = 0x66;
const FILTER_ENABLE: u8 = 0x70;
const FILTER_STATUS: u8 = 0x71;
const FILTER_STATUS_REGS: u8 = 8;
const DELAY_REG0: u8 = 0x7a;
const DELAY_REG1: u8 = 0x7b;
const INSERT_DATA0: u8 = 0x80;
const COMPRESSION_TYPE0: u8 = 0x84;
const COMPRESSION_TYPE1: u8 = 0x85;

const TRIGGER_ADDRESS0: u8 = 0x90;
const NOW_ADDRESS0: u8 = 0x96;
const STOP_ADDRESS0: u8 = 0x9b;
const READ_RAM_STATUS: u8 = 0xa0;

// START_STATUS flags
const STATUS_FLAG_NONE: u8 = 0x00;
const STATUS_FLAG_RESET: u8 = 0x01;
const STATUS_FLAG_INIT: u8 = 0x02;
const STATUS_FLAG_GO: u8 = 0x04;
const STATUS_FLAG_READ: u8 = 0x10;
const STATUS_FLAG_20: u8 = 0x20;

// DEVICE_STATUS bits
const STATUS_BUSY: u8 = 0x01;
const STATUS_READY: u8 = 0x02;
const STATUS_DATA: u8 = 0x08;

const CLOCK_INTERNAL: u8 = 0x03;
const TRIGGER_LEVEL: u8 = 0x31;
const TRIGGERBAR: u32 = 0x3fe;
const INSERT_DATA: [u8; 4] = [0x12, 0x34, 0x56, 0x78];

/// How the analyzer packs its sample memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Enabled,
    Double,
}

impl Compression {
    fn register_value(self) -> u16 {
        match self {
            Compression::None => 0x0001,
            Compression::Enabled => 0x8001,
            Compression::Double => 0x8002,
        }
    }
}

/// Byte-wide register access plus the bulk memory path.
pub trait RegisterIo: Send {
    fn write_reg(&mut self, reg: u8, value: u8) -> Result<()>;

    fn read_reg(&mut self, reg: u8) -> Result<u8>;

    /// Reads one block of sample memory into `buf`, returning the bytes read.
    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// Everything [`Analyzer::configure`] programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub frequency: FrequencyRegs,
    pub memory_size: u8,
    pub trigger_status: [u8; TRIGGER_STATUS_REGS],
    pub ramsize_triggerbar: u32,
    pub compression: Compression,
}

/// Sequencer for one analyzer.
#[derive(Debug, Clone)]
pub struct Analyzer<R> {
    io: R,
}

impl<R: RegisterIo> Analyzer<R> {
    pub fn new(io: R) -> Self {
        Self { io }
    }

    pub fn io(&self) -> &R {
        &self.io
    }

    fn write_status(&mut self, unknown: u8, flags: u8) -> Result<()> {
        self.io.write_reg(START_STATUS, (unknown << 6) | flags)
    }

    fn write_u16(&mut self, reg: u8, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.io.write_reg(reg, lo)?;
        self.io.write_reg(reg + 1, hi)
    }

    fn write_u24(&mut self, reg: u8, value: u32) -> Result<()> {
        let bytes = value.to_le_bytes();
        for (offset, byte) in bytes[..3].iter().enumerate() {
            self.io.write_reg(reg + offset as u8, *byte)?;
        }
        Ok(())
    }

    fn read_u24(&mut self, reg: u8) -> Result<u32> {
        let mut bytes = [0u8; 4];
        for (offset, byte) in bytes[..3].iter_mut().enumerate() {
            *byte = self.io.read_reg(reg + offset as u8)?;
        }
        Ok(u32::from_le_bytes(bytes))
    }

    /// Puts the analyzer back in its idle state.
    pub fn reset(&mut self) -> Result<()> {
        debug!("resetting analyzer");
        self.write_status(3, STATUS_FLAG_NONE)?;
        self.write_status(3, STATUS_FLAG_RESET)
    }

    pub fn initialize(&mut self) -> Result<()> {
        self.write_status(1, STATUS_FLAG_NONE)?;
        self.write_status(1, STATUS_FLAG_INIT)?;
        self.write_status(1, STATUS_FLAG_NONE)
    }

    pub fn device_id(&mut self) -> Result<u16> {
        let lo = self.io.read_reg(DEVICE_ID0)?;
        let hi = self.io.read_reg(DEVICE_ID1)?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Programs clock, memory, trigger and compression registers.
    pub fn configure(&mut self, settings: &Settings) -> Result<()> {
        self.write_status(1, STATUS_FLAG_RESET)?;
        self.initialize()?;

        let freq = settings.frequency;
        self.io.write_reg(FREQUENCY_REG0, freq.divisor)?;
        self.io.write_reg(FREQUENCY_REG1, freq.reg0)?;
        self.io.write_reg(FREQUENCY_REG2, 0x02)?;
        self.io.write_reg(FREQUENCY_REG4, freq.reg2)?;

        self.io.write_reg(MEMORY_LENGTH, settings.memory_size)?;
        self.io.write_reg(CLOCK_SOURCE, CLOCK_INTERNAL)?;

        for (offset, value) in settings.trigger_status.iter().enumerate() {
            self.io.write_reg(TRIGGER_STATUS0 + offset as u8, *value)?;
        }
        self.write_u16(TRIGGER_COUNT0, 1)?;
        for level in 0..TRIGGER_LEVELS {
            self.io.write_reg(TRIGGER_LEVEL0 + level, TRIGGER_LEVEL)?;
        }

        self.write_u24(RAMSIZE_TRIGGERBAR_ADDRESS0, settings.ramsize_triggerbar)?;
        self.write_u24(TRIGGERBAR_ADDRESS0, TRIGGERBAR)?;
        self.io.write_reg(DONT_CARE_TRIGGERBAR, 0x01)?;

        self.io.write_reg(FILTER_ENABLE, 0x00)?;
        for offset in 0..FILTER_STATUS_REGS {
            self.io.write_reg(FILTER_STATUS + offset, 0x00)?;
        }
        self.io.write_reg(DELAY_REG0, 0x00)?;
        self.io.write_reg(DELAY_REG1, 0x00)?;

        for (offset, byte) in INSERT_DATA.iter().enumerate() {
            self.io.write_reg(INSERT_DATA0 + offset as u8, *byte)?;
        }
        let compression = settings.compression.register_value();
        self.io.write_reg(COMPRESSION_TYPE0, compression as u8)?;
        self.io.write_reg(COMPRESSION_TYPE1, (compression >> 8) as u8)?;
        debug!("analyzer configured: {:?}", settings);
        Ok(())
    }

    /// Arms the capture.
    pub fn start(&mut self) -> Result<()> {
        self.initialize()?;
        self.write_status(1, STATUS_FLAG_GO)
    }

    /// True once the capture memory holds data to download.
    pub fn data_ready(&mut self) -> Result<bool> {
        let status = self.io.read_reg(DEVICE_STATUS)?;
        trace!("device status {:#04x}", status);
        Ok(status & (STATUS_READY | STATUS_DATA) != 0 && status & STATUS_BUSY == 0)
    }

    pub fn trigger_address(&mut self) -> Result<u32> {
        self.read_u24(TRIGGER_ADDRESS0)
    }

    pub fn now_address(&mut self) -> Result<u32> {
        self.read_u24(NOW_ADDRESS0)
    }

    pub fn stop_address(&mut self) -> Result<u32> {
        self.read_u24(STOP_ADDRESS0)
    }

    /// Switches the analyzer into memory read-out.
    pub fn read_start(&mut self) -> Result<()> {
        self.write_status(3, STATUS_FLAG_20 | STATUS_FLAG_READ)?;
        // The RAM status register has to be read a few times before the
        // first bulk read returns data.
        for _ in 0..8 {
            self.io.read_reg(READ_RAM_STATUS)?;
        }
        Ok(())
    }

    pub fn read_packet(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.io.read_bulk(buf)
    }

    pub fn read_stop(&mut self) -> Result<()> {
        self.write_status(3, STATUS_FLAG_20)?;
        self.write_status(3, STATUS_FLAG_NONE)
    }
}

#[cfg(test)]
pub(super) mod mock {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, PoisonError};

    use super::RegisterIo;
    use crate::error::{Error, Result};

    #[derive(Debug, Default)]
    pub struct MockState {
        pub writes: Vec<(u8, u8)>,
        pub reads: Vec<u8>,
        pub registers: HashMap<u8, u8>,
        /// Bytes served by bulk reads, consumed front to back.
        pub memory: Vec<u8>,
        pub fail_bulk: bool,
    }

    /// In-memory analyzer. Clones share state.
    #[derive(Debug, Clone, Default)]
    pub struct MockIo(pub Arc<Mutex<MockState>>);

    impl MockIo {
        pub fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn set(&self, reg: u8, value: u8) {
            self.state().registers.insert(reg, value);
        }
    }

    impl RegisterIo for MockIo {
        fn write_reg(&mut self, reg: u8, value: u8) -> Result<()> {
            self.state().writes.push((reg, value));
            Ok(())
        }

        fn read_reg(&mut self, reg: u8) -> Result<u8> {
            let mut state = self.state();
            state.reads.push(reg);
            Ok(state.registers.get(&reg).copied().unwrap_or(0))
        }

        fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize> {
            let mut state = self.state();
            if state.fail_bulk {
                return Err(Error::TransferSubmitFailed("bulk read".into()));
            }
            let n = buf.len().min(state.memory.len());
            buf[..n].copy_from_slice(&state.memory[..n]);
            state.memory.drain(..n);
            Ok(n)
        }
    }
}
