//! Ferrite Driver
//!
//! Capability contracts for hardware drivers and the process-wide registry
//! that composes them.
//!
//! A driver fills up to eight capability slots (power, boot, deploy,
//! management, console, raid, inspect, vendor). Two composition styles
//! exist:
//!
//! - **Hardware types** declare a set of interchangeable implementations per
//!   slot plus a default; nodes may select one per capability.
//! - **Classic drivers** are fixed bundles; nodes using them carry no
//!   interface selections at all.
//!
//! Every interface call receives the node as an explicit parameter. Driver
//! objects are stateless with respect to any given node and must be safe to
//! call concurrently for different nodes.
//!
//! Concrete hardware protocols (IPMI, Redfish, vendor REST APIs) live
//! outside this crate; the in-tree `fake` module provides a scriptable
//! implementation for the orchestrator and its tests.

pub mod error;
pub mod fake;
pub mod registry;
pub mod traits;
pub mod types;

pub use error::{DriverError, DriverResult};
pub use registry::{build_enabled, BoundDriver, ClassicDriver, DriverRegistry, HardwareType};
pub use traits::{
    BootInterface, ConsoleInterface, DeployInterface, InspectInterface, ManagementInterface,
    PowerInterface, RaidInterface, VendorInterface,
};
pub use types::{
    BootDevice, CleanStep, HttpMethod, InspectionReport, PassthruMethod, PassthruScope,
    StepOutcome,
};
