//! Crate-level error types.

use std::error::Error as StdError;

use crate::types::Capability;

/// Crate-level error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No device exists at the given index or id.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The device is already open.
    #[error("device is already active")]
    AlreadyActive,

    /// The device could not be opened.
    #[error("failed to open device: {0}")]
    OpenFailed(String),

    /// The USB interface could not be claimed.
    #[error("failed to claim interface {interface}")]
    ClaimFailed { interface: u8 },

    /// A configuration value was rejected. Prior configuration is unchanged.
    #[error("bad value for {capability}: {reason}")]
    BadValue {
        capability: Capability,
        reason: String,
    },

    /// The trigger cannot be expressed on this device.
    #[error("unsupported trigger: {0}")]
    UnsupportedTrigger(String),

    /// A buffer or transfer could not be allocated.
    #[error("allocation failure")]
    AllocationFailure,

    /// A transfer could not be submitted.
    #[error("transfer submit failed: {0}")]
    TransferSubmitFailed(String),

    /// Firmware could not be located, decoded or installed.
    #[error("firmware error: {0}")]
    FirmwareError(String),

    /// An error with context describing what operation failed.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A simple error message.
    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Create a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self::Message(msg.into())
    }

    /// Create an error with context wrapping another error.
    pub fn context(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Create a [`Error::BadValue`] for the given capability.
    pub fn bad_value(capability: Capability, reason: impl Into<String>) -> Self {
        Self::BadValue {
            capability,
            reason: reason.into(),
        }
    }

    /// Create a [`Error::DeviceNotFound`] for a plugin-local index.
    pub fn no_index(index: usize) -> Self {
        Self::DeviceNotFound(format!("index {}", index))
    }
}

/// Crate-level result type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_value_names_capability() {
        let err = Error::bad_value(Capability::SampleRate, "12345 Hz not supported");
        assert_eq!(
            err.to_string(),
            "bad value for samplerate: 12345 Hz not supported"
        );
    }

    #[test]
    fn test_context_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "pipe closed");
        let err = Error::context("writing output", io);
        assert_eq!(err.to_string(), "writing output: pipe closed");
        assert!(StdError::source(&err).is_some());
    }
}
