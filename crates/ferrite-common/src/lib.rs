//! Ferrite Common
//!
//! Shared vocabulary for the Ferrite bare metal lifecycle orchestrator:
//! the node and port data model, the provisioning and power state enums,
//! the error taxonomy, and the conductor configuration.
//!
//! Everything hardware-specific lives behind the capability traits in
//! `ferrite-driver`; everything stateful lives in `ferrite-engine`. This
//! crate is plain data.

pub mod config;
pub mod error;
pub mod models;

pub use config::ConductorConfig;
pub use error::{Error, Result};
pub use models::{
    ApiVersion, InterfaceKind, InterfaceSelection, Node, NodePatch, Port, PowerAction,
    PowerState, ProvisionState, Verb,
};
