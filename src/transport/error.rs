//! Error types for USB transport operations.

use thiserror::Error;

/// Errors that can occur while talking to a USB device.
#[derive(Error, Debug)]
pub enum UsbError {
    /// USB communication error.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// The device descriptors do not match the expected firmware profile.
    #[error("unexpected descriptor layout")]
    ProfileMismatch,

    /// Fewer bytes were written than requested.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// A firmware image does not fit the 16-bit load address space.
    #[error("firmware image of {0} bytes exceeds the 64 KiB address space")]
    ImageTooLarge(usize),

    /// Device returned invalid or unexpected data.
    #[error("invalid device response")]
    InvalidResponse,

    /// Operation timed out.
    #[error("operation timed out")]
    Timeout,
}

impl UsbError {
    /// True if the device is gone or the bus failed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            UsbError::Usb(rusb::Error::NoDevice | rusb::Error::Io | rusb::Error::Pipe)
        )
    }
}

/// Result type alias for USB transport operations.
pub type Result<T> = std::result::Result<T, UsbError>;

impl From<UsbError> for crate::Error {
    fn from(e: UsbError) -> Self {
        crate::Error::context("USB transfer failed", e)
    }
}
