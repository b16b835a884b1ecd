//! Driver failure classification
//!
//! The orchestrator's retry policy keys off these variants: transient
//! failures and timeouts are retried with backoff, configuration problems
//! surface synchronously as validation errors, hardware faults end the
//! operation and move the node to a failed state.

use std::time::Duration;
use thiserror::Error;

use ferrite_common::Error;

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// Communication hiccup with the management controller. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Missing or invalid node configuration. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The hardware reported a fault. Terminal for the operation.
    #[error("hardware fault: {0}")]
    Hardware(String),

    /// The capability is not implemented by this driver. Distinct from
    /// failure: validation reports it as "unsupported" rather than false.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A single driver call exceeded the configured bound. Retryable.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriverError::Transient(_) | DriverError::Timeout(_))
    }

    /// Shorthand for the common missing-key configuration error.
    pub fn missing_key(section: &str, key: &str) -> Self {
        DriverError::Config(format!("{section} is missing key '{key}'"))
    }
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::Transient(msg) => Error::TransientHardware(msg),
            DriverError::Config(msg) => Error::Validation(msg),
            DriverError::Hardware(msg) => Error::HardwareFault(msg),
            DriverError::Unsupported(msg) => Error::Validation(msg),
            DriverError::Timeout(d) => {
                Error::TransientHardware(format!("call timed out after {d:?}"))
            }
        }
    }
}
