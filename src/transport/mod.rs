//! USB transport and firmware bootstrap.
//!
//! The pieces here are shared by the USB drivers: descriptor profile checks
//! that tell a device running our firmware from a blank one, the per-family
//! reopen lock that keeps a freshly flashed device alone while it
//! re-enumerates, re-finding a device by address, and the bulk transfer pump.

pub mod pump;

#[cfg(feature = "usb")]
pub mod error;
#[cfg(feature = "usb")]
pub mod ezusb;
#[cfg(feature = "usb")]
pub mod ftdi;
#[cfg(feature = "usb")]
pub mod usb;

use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::info;

use crate::types::UsbAddress;

#[cfg(feature = "usb")]
pub use error::UsbError;
pub use pump::{BulkRead, PumpConfig, ReadError, StopFlag, TransferPump};

// =============================================================================
// Reopen lock
// =============================================================================

/// Enforces a settle delay between a firmware upload and the next open.
///
/// One lock exists per device family, as a `static`.
#[derive(Debug)]
pub struct ReopenLock {
    last_upload: Mutex<Option<Instant>>,
    delay: Duration,
}

impl ReopenLock {
    pub const fn new(delay: Duration) -> Self {
        Self {
            last_upload: Mutex::new(None),
            delay,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Marks a firmware upload as having just happened.
    pub fn record_upload(&self) {
        self.record_upload_at(Instant::now());
    }

    pub fn record_upload_at(&self, at: Instant) {
        *self
            .last_upload
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// How long an open at `now` has to wait.
    pub fn wait_time(&self, now: Instant) -> Duration {
        match *self
            .last_upload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Some(at) => self.delay.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    /// Sleeps for whatever is left of the delay, then clears the lock.
    /// Returns the time slept.
    pub fn wait(&self) -> Duration {
        let remaining = self.wait_time(Instant::now());
        if !remaining.is_zero() {
            info!("waiting {} ms for device to re-enumerate", remaining.as_millis());
            thread::sleep(remaining);
        }
        *self
            .last_upload
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        remaining
    }
}

// =============================================================================
// Descriptor profiles
// =============================================================================

/// The parts of a device's descriptors that identify its firmware.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DescriptorShape {
    pub num_configurations: u8,
    pub num_interfaces: u8,
    pub num_alt_settings: u8,
    /// Endpoint addresses of the single alt setting, in descriptor order.
    pub endpoints: Vec<u8>,
}

/// Shape a device has once it runs the expected firmware: one configuration,
/// one interface, one alt setting and exactly an OUT then an IN endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedProfile {
    pub out_endpoint: u8,
    pub in_endpoint: u8,
}

impl ExpectedProfile {
    pub const fn new(out_endpoint: u8, in_endpoint: u8) -> Self {
        Self {
            out_endpoint,
            in_endpoint,
        }
    }

    pub fn matches(&self, shape: &DescriptorShape) -> bool {
        shape.num_configurations == 1
            && shape.num_interfaces == 1
            && shape.num_alt_settings == 1
            && shape.endpoints.len() == 2
            && shape.endpoints[0] & 0x8f == self.out_endpoint
            && shape.endpoints[1] & 0x8f == self.in_endpoint
    }
}

// =============================================================================
// Address reuse
// =============================================================================

/// Picks the `n`th candidate (in discovery order) whose address is not
/// already owned by another instance.
pub fn nth_unclaimed(
    candidates: &[UsbAddress],
    owned: &[UsbAddress],
    n: usize,
) -> Option<UsbAddress> {
    candidates
        .iter()
        .filter(|addr| !owned.contains(addr))
        .nth(n)
        .copied()
}
