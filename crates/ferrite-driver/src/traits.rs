//! Capability interface contracts
//!
//! Every capability carries the same base obligations: `get_properties`
//! describes the configuration keys the implementation needs (shown to
//! operators), and `validate` checks a node's `driver_info`/`properties`
//! for them without ever touching hardware. The remaining methods are the
//! capability-specific actions.
//!
//! All methods take the node as an explicit parameter; implementations must
//! not cache per-node state.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;

use ferrite_common::models::{Node, PowerState};

use crate::error::{DriverError, DriverResult};
use crate::types::{
    BootDevice, CleanStep, InspectionReport, PassthruMethod, PassthruScope, StepOutcome,
};

/// Power control via the node's management controller.
#[async_trait]
pub trait PowerInterface: Send + Sync {
    /// Required configuration keys with human-readable descriptions.
    fn get_properties(&self) -> BTreeMap<String, String>;

    /// Check the node's configuration. Never touches hardware.
    async fn validate(&self, node: &Node) -> DriverResult<()>;

    async fn get_power_state(&self, node: &Node) -> DriverResult<PowerState>;

    async fn set_power_state(&self, node: &Node, target: PowerState) -> DriverResult<()>;

    async fn reboot(&self, node: &Node) -> DriverResult<()>;
}

/// Boot configuration for the deploy ramdisk and the final instance.
#[async_trait]
pub trait BootInterface: Send + Sync {
    fn get_properties(&self) -> BTreeMap<String, String>;

    async fn validate(&self, node: &Node) -> DriverResult<()>;

    /// Arrange for the node to boot the deploy ramdisk on next power-on.
    async fn prepare_ramdisk(&self, node: &Node) -> DriverResult<()>;

    async fn clean_up_ramdisk(&self, node: &Node) -> DriverResult<()>;
}

/// Image deployment and teardown.
///
/// `deploy` may finish synchronously or park the node in `deploy wait`
/// until an out-of-band callback resumes it via `continue_deploy`.
#[async_trait]
pub trait DeployInterface: Send + Sync {
    fn get_properties(&self) -> BTreeMap<String, String>;

    async fn validate(&self, node: &Node) -> DriverResult<()>;

    /// Preparatory work, e.g. pre-caching image data.
    async fn prepare(&self, node: &Node) -> DriverResult<()>;

    async fn deploy(&self, node: &Node) -> DriverResult<StepOutcome>;

    /// Continue a deployment that returned [`StepOutcome::Wait`].
    async fn continue_deploy(&self, node: &Node) -> DriverResult<StepOutcome>;

    async fn tear_down(&self, node: &Node) -> DriverResult<()>;

    /// Remove anything `prepare` set up.
    async fn clean_up(&self, node: &Node) -> DriverResult<()>;

    /// Re-assert ownership of an in-flight deployment after the previous
    /// conductor disappeared.
    async fn take_over(&self, node: &Node) -> DriverResult<()>;

    /// All cleaning steps this interface offers, enabled or not.
    fn clean_steps(&self) -> Vec<CleanStep> {
        Vec::new()
    }

    async fn execute_clean_step(&self, node: &Node, step: &CleanStep) -> DriverResult<StepOutcome> {
        let _ = node;
        Err(DriverError::Unsupported(format!(
            "clean step '{}' is not implemented",
            step.name
        )))
    }
}

/// Out-of-band management: boot device control.
#[async_trait]
pub trait ManagementInterface: Send + Sync {
    fn get_properties(&self) -> BTreeMap<String, String>;

    async fn validate(&self, node: &Node) -> DriverResult<()>;

    fn get_supported_boot_devices(&self) -> Vec<BootDevice>;

    /// `persistent` keeps the device across reboots instead of one boot.
    async fn set_boot_device(
        &self,
        node: &Node,
        device: BootDevice,
        persistent: bool,
    ) -> DriverResult<()>;

    async fn get_boot_device(&self, node: &Node) -> DriverResult<BootDevice>;

    fn clean_steps(&self) -> Vec<CleanStep> {
        Vec::new()
    }

    async fn execute_clean_step(&self, node: &Node, step: &CleanStep) -> DriverResult<StepOutcome> {
        let _ = node;
        Err(DriverError::Unsupported(format!(
            "clean step '{}' is not implemented",
            step.name
        )))
    }
}

/// Serial/graphical console access.
#[async_trait]
pub trait ConsoleInterface: Send + Sync {
    fn get_properties(&self) -> BTreeMap<String, String>;

    async fn validate(&self, node: &Node) -> DriverResult<()>;

    async fn start_console(&self, node: &Node) -> DriverResult<()>;

    async fn stop_console(&self, node: &Node) -> DriverResult<()>;
}

/// RAID configuration.
#[async_trait]
pub trait RaidInterface: Send + Sync {
    fn get_properties(&self) -> BTreeMap<String, String>;

    async fn validate(&self, node: &Node) -> DriverResult<()>;

    async fn create_configuration(&self, node: &Node) -> DriverResult<()>;

    async fn delete_configuration(&self, node: &Node) -> DriverResult<()>;

    fn clean_steps(&self) -> Vec<CleanStep> {
        Vec::new()
    }

    async fn execute_clean_step(&self, node: &Node, step: &CleanStep) -> DriverResult<StepOutcome> {
        let _ = node;
        Err(DriverError::Unsupported(format!(
            "clean step '{}' is not implemented",
            step.name
        )))
    }
}

/// Hardware introspection.
#[async_trait]
pub trait InspectInterface: Send + Sync {
    fn get_properties(&self) -> BTreeMap<String, String>;

    async fn validate(&self, node: &Node) -> DriverResult<()>;

    async fn inspect_hardware(&self, node: &Node) -> DriverResult<InspectionReport>;
}

/// Driver-defined custom operations outside the standard capability set.
#[async_trait]
pub trait VendorInterface: Send + Sync {
    fn get_properties(&self) -> BTreeMap<String, String>;

    /// Methods registered under the given scope.
    fn methods(&self, scope: PassthruScope) -> Vec<PassthruMethod>;

    /// Validate call parameters before any hardware action. `node` is
    /// `None` for driver-scoped calls.
    async fn validate_passthru(
        &self,
        node: Option<&Node>,
        method: &str,
        params: &Value,
    ) -> DriverResult<()>;

    async fn invoke(
        &self,
        node: Option<&Node>,
        method: &str,
        params: &Value,
    ) -> DriverResult<Value>;
}
