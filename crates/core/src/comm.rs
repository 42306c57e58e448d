//! Device communication policy: error classification and retry.
//!
//! The state machine retries a failed transfer once; what happens after the
//! second failure depends on the error class and on the lifecycle state.

use crate::error::{Error, Result};
use tracing::{debug, warn};

/// Retries applied at the state-machine level.
pub const STATE_MACHINE_RETRIES: u32 = 1;

/// Classification of communication errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient errors that may succeed on retry (timeout, short write).
    Transient,
    /// Device is gone or the wireless link dropped.
    Disconnected,
    /// Reply arrived but was malformed.
    Protocol,
    /// A profile value was rejected before reaching the device.
    Config,
    /// Start-up failure; the daemon must abort.
    Fatal,
}

impl ErrorClass {
    /// Classify an error for retry decisions.
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::Timeout(_) => Self::Transient,
            Error::Disconnected(_) | Error::DeviceNotFound(_) => Self::Disconnected,
            Error::Protocol { .. } => Self::Protocol,
            Error::OutOfRange { .. } | Error::KeyCountMismatch { .. } | Error::Profile(_) => {
                Self::Config
            }
            Error::Fatal(_) => Self::Fatal,
            Error::Transfer(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("closed")
                    || lower.contains("no such device")
                    || lower.contains("disconnect")
                {
                    Self::Disconnected
                } else {
                    Self::Transient
                }
            }
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::BrokenPipe => {
                    Self::Disconnected
                }
                _ => Self::Transient,
            },
        }
    }

    /// Whether this error class is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Run `op`, retrying transient failures up to `max_retries` times.
///
/// Returns the first success or the last error.
pub fn with_retry<T>(max_retries: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => {
                if attempt > 0 {
                    debug!("request succeeded on attempt {}", attempt + 1);
                }
                return Ok(v);
            }
            Err(e) => {
                let class = ErrorClass::classify(&e);
                if !class.is_retryable() || attempt >= max_retries {
                    warn!(
                        "request failed (class={:?}, attempt={}/{}): {}",
                        class,
                        attempt + 1,
                        max_retries + 1,
                        e
                    );
                    return Err(e);
                }
                debug!(
                    "transient error (attempt {}/{}): {}, retrying...",
                    attempt + 1,
                    max_retries + 1,
                    e
                );
                attempt += 1;
            }
        }
    }
}
