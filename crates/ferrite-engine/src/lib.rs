//! Ferrite Engine
//!
//! The provisioning state machine and task orchestration for bare metal
//! nodes. The engine owns:
//!
//! - the transition table ([`fsm`]) deciding which verbs are legal where,
//! - the per-node lease table ([`lease`]) enforcing one operation per node,
//! - the conductor ([`conductor`]) running transitions on a bounded worker
//!   pool with heartbeats, retries and crash takeover,
//! - step-based cleaning workflows ([`steps`]),
//! - vendor passthru dispatch ([`passthru`]),
//! - the storage trait ([`store`]) and the external facade ([`service`]).
//!
//! Requests are admitted synchronously and executed asynchronously;
//! polling the node record is the only way to observe an outcome. Every
//! failure leaves `last_error` populated and the node in a named failed
//! state.

pub mod conductor;
pub mod events;
pub mod fsm;
pub mod lease;
pub mod passthru;
pub mod retry;
pub mod service;
pub mod steps;
pub mod store;

pub use conductor::Conductor;
pub use events::{EventManager, NodeEvent};
pub use lease::{Acquired, LeaseTable};
pub use passthru::PassthruOutcome;
pub use retry::RetryPolicy;
pub use service::{InterfaceValidation, NodeService};
pub use store::{MemoryStore, NodeStore};
