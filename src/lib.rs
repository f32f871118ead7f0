//! Acquisition engine for USB logic analyzers.
//!
//! This crate drives several families of logic analyzers through one device
//! lifecycle (scan, open, configure, acquire, close) and delivers their
//! samples as an ordered packet stream: a Header, Logic chunks with at most
//! one Trigger marker between them, then exactly one End.
//!
//! # Getting Started
//!
//! ```no_run
//! use logic_capture::{list_devices, open_device, khz, DeviceConfig, PacketCollector, Session};
//!
//! // Discover devices
//! let devices = list_devices().unwrap();
//! for info in &devices {
//!     println!("{}", info);
//! }
//!
//! // Open and configure
//! let device = open_device("demo:0").unwrap();
//! device
//!     .configure(
//!         &DeviceConfig::new()
//!             .with_sample_rate(khz(100))
//!             .with_limit_samples(10_000),
//!     )
//!     .unwrap();
//!
//! // Acquire until the device ends its stream
//! let mut session = Session::new();
//! let collector = PacketCollector::new();
//! session.subscribe(collector.clone());
//! let id = session.add_device(device);
//! session.start().unwrap();
//! session.run();
//!
//! println!("{} bytes captured", collector.logic_bytes(id).len());
//! ```
//!
//! Sinks are anything implementing [`datafeed::DatafeedSink`], closures
//! included. [`output::OutputSink`] renders packets as text or raw bytes and
//! [`decoder::DecoderSink`] runs protocol decoders on them.
//!
//! # Supported Devices
//!
//! - **Demo** - synthetic pattern generator (feature: `demo`)
//! - **Saleae Logic** - FX2 based, streaming over bulk transfers (feature: `saleae-logic`)
//! - **Zeroplus Logic Cube** - LAP-C series with on-board memory (feature: `zeroplus-logic-cube`)
//! - **ASIX SIGMA** - FTDI + FPGA, compressed sample memory (feature: `asix-sigma`)
//!
//! # Features
//!
//! - `all-drivers` (default): every driver
//! - `usb-drivers`: the USB drivers only
//! - `serde`: (de)serializable configuration types
//!
//! Firmware files are searched in the directories named by
//! `LOGIC_CAPTURE_FIRMWARE_DIR` before the built-in search path.

pub mod codec;
pub mod config;
pub mod datafeed;
pub mod decoder;
pub mod device;
pub mod discovery;
mod error;
pub mod event_loop;
pub mod firmware;
pub mod input;
pub mod output;
pub mod plugin;
pub mod protocols;
pub mod session;
pub mod transport;
pub mod trigger;
pub mod types;

// Crate-level error types
pub use error::{Error, Result};

pub use config::DeviceConfig;
pub use datafeed::{DeviceId, Packet, PacketCollector};
pub use device::{Device, DeviceInfo};
pub use discovery::DeviceDiscovery;
pub use plugin::DevicePlugin;
pub use session::{Session, SessionControl};

// Core types
pub use types::{
    ghz, khz, mhz, samplerate_string, Capability, ConfigValue, DeviceStatus, DriverKind,
    EnabledDrivers, InfoField, InfoValue, PatternMode, Probe, TriggerSpec,
};

#[cfg(feature = "demo")]
pub use protocols::demo;

#[cfg(feature = "saleae-logic")]
pub use protocols::saleae_logic;

#[cfg(feature = "zeroplus-logic-cube")]
pub use protocols::zeroplus_logic_cube;

#[cfg(feature = "asix-sigma")]
pub use protocols::asix_sigma;

// =============================================================================
// Device Discovery Functions
// =============================================================================

/// List all available devices.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    list_devices_filtered(&EnabledDrivers::all())
}

/// List available devices of the given driver families.
pub fn list_devices_filtered(enabled: &EnabledDrivers) -> Result<Vec<DeviceInfo>> {
    let mut discovery = DeviceDiscovery::new(enabled.clone());
    Ok(discovery
        .scan()
        .into_iter()
        .map(|device| device.info().clone())
        .collect())
}

/// Open a device by ID.
///
/// The ID should match the `id` field returned by [`list_devices`], for
/// example `demo:0` or `saleae-logic:1`.
pub fn open_device(id: &str) -> Result<Device> {
    let kind = id.split(':').next().unwrap_or_default();
    let enabled: EnabledDrivers = DriverKind::all()
        .iter()
        .filter(|k| k.name() == kind)
        .cloned()
        .collect();
    if enabled.is_empty() {
        return Err(Error::DeviceNotFound(id.to_string()));
    }
    DeviceDiscovery::new(enabled).open(id)
}
