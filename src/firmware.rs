//! Firmware images: locating, decoding and bit-bang expansion.
//!
//! FPGA bitstreams for FTDI based analyzers ship XOR-obfuscated and zlib
//! compressed. [`decode_bitbang`] turns such a file into the byte stream that
//! clocks the bitstream into the FPGA over the FTDI bit-bang port. EZ-USB
//! firmware is shipped as a raw image and used as-is.

use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use log::debug;

use crate::error::{Error, Result};

/// Environment variable holding extra firmware directories (colon-separated).
pub const FIRMWARE_DIR_ENV: &str = "LOGIC_CAPTURE_FIRMWARE_DIR";

/// Directories searched after the ones named in [`FIRMWARE_DIR_ENV`].
pub const DEFAULT_FIRMWARE_DIRS: &[&str] = &[
    "/usr/local/share/logic-capture/firmware",
    "/usr/share/logic-capture/firmware",
];

/// Upper bound on a decompressed image.
pub const MAX_FIRMWARE_SIZE: usize = 65536;

const KEYSTREAM_SEED: u32 = 0x3f6d_f2ab;

/// Bit-bang pin driving the FPGA data line.
const BITBANG_DATA: u8 = 0x40;
/// Bit-bang pin driving the FPGA clock line.
const BITBANG_CLOCK: u8 = 0x01;

// =============================================================================
// Locating
// =============================================================================

/// Resolves firmware file names against a list of directories.
#[derive(Debug, Clone)]
pub struct FirmwareLocator {
    dirs: Vec<PathBuf>,
}

impl FirmwareLocator {
    /// Directories from the environment followed by the defaults.
    pub fn from_env() -> Self {
        let mut dirs: Vec<PathBuf> = env::var_os(FIRMWARE_DIR_ENV)
            .map(|value| env::split_paths(&value).collect())
            .unwrap_or_default();
        dirs.extend(DEFAULT_FIRMWARE_DIRS.iter().map(PathBuf::from));
        Self { dirs }
    }

    /// Searches only the given directories.
    pub fn with_dirs<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Returns the first existing path for `name`.
    pub fn locate(&self, name: &str) -> Result<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                Error::FirmwareError(format!(
                    "{} not found in {}",
                    name,
                    self.dirs
                        .iter()
                        .map(|d| d.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    /// Reads the named file.
    pub fn load(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.locate(name)?;
        read_file(&path)
    }
}

impl Default for FirmwareLocator {
    fn default() -> Self {
        Self::from_env()
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    debug!("loading firmware {}", path.display());
    fs::read(path).map_err(|e| Error::context(format!("reading {}", path.display()), e))
}

// =============================================================================
// Decoding
// =============================================================================

/// Iterator over the obfuscation keystream.
#[derive(Debug, Clone)]
pub struct Keystream {
    state: u32,
}

impl Keystream {
    pub fn new() -> Self {
        Self {
            state: KEYSTREAM_SEED,
        }
    }
}

impl Default for Keystream {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for Keystream {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        let s = self.state;
        self.state = (s.wrapping_add(0x0a85_3753) % 177).wrapping_add(s.wrapping_mul(0x0803_4052));
        Some(self.state as u8)
    }
}

/// XORs `data` with the keystream. Applying it twice restores the input.
pub fn deobfuscate(data: &[u8]) -> Vec<u8> {
    data.iter().zip(Keystream::new()).map(|(b, k)| b ^ k).collect()
}

/// zlib-inflates `data`, refusing images larger than [`MAX_FIRMWARE_SIZE`].
pub fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut image = Vec::new();
    let mut decoder = ZlibDecoder::new(data).take(MAX_FIRMWARE_SIZE as u64 + 1);
    decoder
        .read_to_end(&mut image)
        .map_err(|e| Error::context("inflating firmware", e))?;
    if image.len() > MAX_FIRMWARE_SIZE {
        return Err(Error::FirmwareError(format!(
            "image exceeds {} bytes",
            MAX_FIRMWARE_SIZE
        )));
    }
    Ok(image)
}

/// Expands each bit, most significant first, into a clock-high/clock-low
/// pair with the data line set to the bit.
pub fn bitbang(image: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(image.len() * 16);
    for byte in image {
        for bit in (0..8).rev() {
            let v = if byte & (1 << bit) != 0 {
                BITBANG_DATA
            } else {
                0
            };
            out.push(v | BITBANG_CLOCK);
            out.push(v);
        }
    }
    out
}

/// Full pipeline: deobfuscate, inflate, expand.
pub fn decode_bitbang(raw: &[u8]) -> Result<Vec<u8>> {
    let image = inflate(&deobfuscate(raw))?;
    debug!(
        "firmware image {} bytes, bit-bang stream {} bytes",
        image.len(),
        image.len() * 16
    );
    Ok(bitbang(&image))
}
