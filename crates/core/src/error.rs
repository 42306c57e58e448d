//! Error types for open-icue-core.

use thiserror::Error;

/// Core library error type.
#[derive(Debug, Error)]
pub enum Error {
    /// HID write or read failed.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// A reply arrived but did not make sense (wrong tag, bad status, implausible length).
    #[error("protocol error in {context}: {detail}")]
    Protocol {
        context: &'static str,
        detail: String,
    },

    /// Value out of safe range.
    #[error("value out of range: {field} = {value} (allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Key-assignment table does not match the firmware key count.
    #[error("key table has {actual} entries, firmware expects {expected}")]
    KeyCountMismatch { expected: usize, actual: usize },

    /// Wireless peripheral is not connected, or the device is shutting down.
    #[error("device disconnected: {0}")]
    Disconnected(String),

    /// Unrecoverable daemon start-up failure (uinput, HID enumeration).
    #[error("fatal: {0}")]
    Fatal(String),

    /// Device not found during enumeration.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Operation timed out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Profile deserialization error.
    #[error("profile error: {0}")]
    Profile(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn protocol(context: &'static str, detail: impl Into<String>) -> Self {
        Self::Protocol {
            context,
            detail: detail.into(),
        }
    }

    /// Whether the error comes from profile validation (the only class shown to operators).
    pub fn is_config(&self) -> bool {
        matches!(self, Self::OutOfRange { .. } | Self::KeyCountMismatch { .. })
    }
}

impl From<hidapi::HidError> for Error {
    fn from(err: hidapi::HidError) -> Self {
        Self::Transfer(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Profile(err.to_string())
    }
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, Error>;
