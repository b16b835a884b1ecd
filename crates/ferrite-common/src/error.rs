//! Error taxonomy shared across Ferrite crates
//!
//! Synchronous failures (validation, busy, not-found) are returned to the
//! caller directly. Hardware failures surface asynchronously through the
//! node's `last_error` field and a failed provision state; they never
//! propagate back through a request path that already returned accepted.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{ProvisionState, Verb};

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The node's exclusive lease is already held. The caller must retry.
    #[error("node {node} is locked by {holder}")]
    NodeBusy { node: Uuid, holder: String },

    /// Unknown node, driver, port or passthru method.
    #[error("{0} not found")]
    NotFound(String),

    /// The passthru method exists but does not allow the requested verb.
    #[error("method {method} does not support {verb}")]
    MethodNotAllowed { method: String, verb: String },

    /// The verb is not a legal transition from the node's current state.
    #[error("cannot {verb} node in state {state}")]
    InvalidState { verb: Verb, state: ProvisionState },

    /// A communication failure that may succeed on retry.
    #[error("transient hardware error: {0}")]
    TransientHardware(String),

    /// A terminal hardware failure for the current operation.
    #[error("hardware fault: {0}")]
    HardwareFault(String),

    /// Storage-layer failure.
    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a not-found error about a node addressed by id or name.
    pub fn node_not_found(ident: &str) -> Self {
        Error::NotFound(format!("node {ident}"))
    }

    pub fn driver_not_found(name: &str) -> Self {
        Error::NotFound(format!("driver {name}"))
    }
}
