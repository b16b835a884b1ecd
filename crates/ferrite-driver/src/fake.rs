//! Scriptable fake driver
//!
//! A complete in-memory hardware type used by the orchestrator tests and
//! by development deployments without real hardware. All interfaces share
//! one [`FakeHardware`] state: tests can read the calls that were made,
//! script the next failure for any operation, and flip deployment or
//! individual clean steps into asynchronous completion.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use ferrite_common::models::{InterfaceKind, Node, PowerState};

use crate::error::{DriverError, DriverResult};
use crate::registry::{ClassicDriver, HardwareType};
use crate::traits::{
    BootInterface, DeployInterface, InspectInterface, ManagementInterface, PowerInterface,
    VendorInterface,
};
use crate::types::{
    BootDevice, CleanStep, HttpMethod, InspectionReport, PassthruMethod, PassthruScope,
    StepOutcome,
};

/// Configuration key the fake power interface requires.
pub const POWER_ADDRESS_KEY: &str = "power_address";

/// Shared state behind every fake interface.
#[derive(Debug, Default)]
pub struct FakeHardware {
    power: Mutex<HashMap<Uuid, PowerState>>,
    boot_devices: Mutex<HashMap<Uuid, BootDevice>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, DriverError>>,
    delays: Mutex<HashMap<String, Duration>>,
    clean_steps: Mutex<Vec<CleanStep>>,
    async_steps: Mutex<HashSet<String>>,
    async_deploy: AtomicBool,
    inspection: Mutex<Option<InspectionReport>>,
}

impl FakeHardware {
    pub fn shared() -> Arc<Self> {
        let state = Self::default();
        *state.clean_steps.lock().unwrap() = vec![
            CleanStep::new("erase_devices", InterfaceKind::Deploy, 10),
            CleanStep::new("reset_bios", InterfaceKind::Management, 5),
        ];
        Arc::new(state)
    }

    /// Operations invoked so far, in order, e.g. `deploy.deploy` or
    /// `clean_step:erase_devices`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Script `op` to fail once with `err`.
    pub fn fail_next(&self, op: &str, err: DriverError) {
        self.failures.lock().unwrap().insert(op.to_string(), err);
    }

    /// Make `op` take `delay` to complete. Applies to power changes,
    /// deployment, clean steps and inspection.
    pub fn set_delay(&self, op: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(op.to_string(), delay);
    }

    async fn stall(&self, op: &str) {
        let delay = self.delays.lock().unwrap().get(op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Make `deploy` park in `deploy wait` instead of finishing inline.
    pub fn set_async_deploy(&self, on: bool) {
        self.async_deploy.store(on, Ordering::SeqCst);
    }

    /// Make the named clean step complete out of band.
    pub fn set_step_async(&self, name: &str) {
        self.async_steps.lock().unwrap().insert(name.to_string());
    }

    pub fn set_clean_steps(&self, steps: Vec<CleanStep>) {
        *self.clean_steps.lock().unwrap() = steps;
    }

    pub fn set_inspection(&self, report: InspectionReport) {
        *self.inspection.lock().unwrap() = Some(report);
    }

    pub fn power_state_of(&self, node: Uuid) -> PowerState {
        self.power
            .lock()
            .unwrap()
            .get(&node)
            .copied()
            .unwrap_or(PowerState::Off)
    }

    pub fn set_power_state_of(&self, node: Uuid, state: PowerState) {
        self.power.lock().unwrap().insert(node, state);
    }

    fn steps_for(&self, interface: InterfaceKind) -> Vec<CleanStep> {
        self.clean_steps
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.interface == interface)
            .cloned()
            .collect()
    }

    /// Record the call and return the scripted failure, if one is set.
    fn hit(&self, op: &str) -> DriverResult<()> {
        self.calls.lock().unwrap().push(op.to_string());
        match self.failures.lock().unwrap().remove(op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn step_outcome(&self, name: &str) -> StepOutcome {
        if self.async_steps.lock().unwrap().contains(name) {
            StepOutcome::Wait
        } else {
            StepOutcome::Complete
        }
    }
}

pub struct FakePower {
    state: Arc<FakeHardware>,
}

#[async_trait]
impl PowerInterface for FakePower {
    fn get_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            POWER_ADDRESS_KEY.to_string(),
            "Address of the management controller. Required.".to_string(),
        )])
    }

    async fn validate(&self, node: &Node) -> DriverResult<()> {
        self.state.hit("power.validate")?;
        if !node.driver_info.contains_key(POWER_ADDRESS_KEY) {
            return Err(DriverError::missing_key("driver_info", POWER_ADDRESS_KEY));
        }
        Ok(())
    }

    async fn get_power_state(&self, node: &Node) -> DriverResult<PowerState> {
        self.state.hit("power.get_power_state")?;
        Ok(self.state.power_state_of(node.id))
    }

    async fn set_power_state(&self, node: &Node, target: PowerState) -> DriverResult<()> {
        self.state.stall("power.set_power_state").await;
        self.state.hit("power.set_power_state")?;
        if !matches!(target, PowerState::On | PowerState::Off) {
            return Err(DriverError::Config(format!(
                "cannot set power state to '{target}'"
            )));
        }
        self.state.set_power_state_of(node.id, target);
        Ok(())
    }

    async fn reboot(&self, node: &Node) -> DriverResult<()> {
        self.state.hit("power.reboot")?;
        self.state.set_power_state_of(node.id, PowerState::On);
        Ok(())
    }
}

pub struct FakeBoot {
    state: Arc<FakeHardware>,
}

#[async_trait]
impl BootInterface for FakeBoot {
    fn get_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn validate(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("boot.validate")
    }

    async fn prepare_ramdisk(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("boot.prepare_ramdisk")
    }

    async fn clean_up_ramdisk(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("boot.clean_up_ramdisk")
    }
}

pub struct FakeDeploy {
    state: Arc<FakeHardware>,
}

#[async_trait]
impl DeployInterface for FakeDeploy {
    fn get_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn validate(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("deploy.validate")
    }

    async fn prepare(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("deploy.prepare")
    }

    async fn deploy(&self, _node: &Node) -> DriverResult<StepOutcome> {
        self.state.stall("deploy.deploy").await;
        self.state.hit("deploy.deploy")?;
        if self.state.async_deploy.load(Ordering::SeqCst) {
            Ok(StepOutcome::Wait)
        } else {
            Ok(StepOutcome::Complete)
        }
    }

    async fn continue_deploy(&self, _node: &Node) -> DriverResult<StepOutcome> {
        self.state.hit("deploy.continue_deploy")?;
        Ok(StepOutcome::Complete)
    }

    async fn tear_down(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("deploy.tear_down")
    }

    async fn clean_up(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("deploy.clean_up")
    }

    async fn take_over(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("deploy.take_over")
    }

    fn clean_steps(&self) -> Vec<CleanStep> {
        self.state.steps_for(InterfaceKind::Deploy)
    }

    async fn execute_clean_step(
        &self,
        _node: &Node,
        step: &CleanStep,
    ) -> DriverResult<StepOutcome> {
        self.state.stall(&format!("clean_step:{}", step.name)).await;
        self.state.hit(&format!("clean_step:{}", step.name))?;
        Ok(self.state.step_outcome(&step.name))
    }
}

pub struct FakeManagement {
    state: Arc<FakeHardware>,
}

#[async_trait]
impl ManagementInterface for FakeManagement {
    fn get_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn validate(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("management.validate")
    }

    fn get_supported_boot_devices(&self) -> Vec<BootDevice> {
        vec![BootDevice::Pxe, BootDevice::Disk]
    }

    async fn set_boot_device(
        &self,
        node: &Node,
        device: BootDevice,
        _persistent: bool,
    ) -> DriverResult<()> {
        self.state
            .hit(&format!("management.set_boot_device:{device}"))?;
        if !self.get_supported_boot_devices().contains(&device) {
            return Err(DriverError::Config(format!(
                "boot device '{device}' is not supported"
            )));
        }
        self.state.boot_devices.lock().unwrap().insert(node.id, device);
        Ok(())
    }

    async fn get_boot_device(&self, node: &Node) -> DriverResult<BootDevice> {
        self.state.hit("management.get_boot_device")?;
        Ok(self
            .state
            .boot_devices
            .lock()
            .unwrap()
            .get(&node.id)
            .copied()
            .unwrap_or(BootDevice::Pxe))
    }

    fn clean_steps(&self) -> Vec<CleanStep> {
        self.state.steps_for(InterfaceKind::Management)
    }

    async fn execute_clean_step(
        &self,
        _node: &Node,
        step: &CleanStep,
    ) -> DriverResult<StepOutcome> {
        self.state.hit(&format!("clean_step:{}", step.name))?;
        Ok(self.state.step_outcome(&step.name))
    }
}

pub struct FakeInspect {
    state: Arc<FakeHardware>,
}

#[async_trait]
impl InspectInterface for FakeInspect {
    fn get_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn validate(&self, _node: &Node) -> DriverResult<()> {
        self.state.hit("inspect.validate")
    }

    async fn inspect_hardware(&self, _node: &Node) -> DriverResult<InspectionReport> {
        self.state.stall("inspect.inspect_hardware").await;
        self.state.hit("inspect.inspect_hardware")?;
        if let Some(report) = self.state.inspection.lock().unwrap().clone() {
            return Ok(report);
        }
        let mut properties = Map::new();
        properties.insert("cpus".to_string(), json!(4));
        properties.insert("memory_mb".to_string(), json!(4096));
        properties.insert("local_gb".to_string(), json!(40));
        Ok(InspectionReport {
            properties,
            mac_addresses: vec!["52:54:00:12:34:56".to_string()],
        })
    }
}

pub struct FakeVendor {
    state: Arc<FakeHardware>,
}

#[async_trait]
impl VendorInterface for FakeVendor {
    fn get_properties(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn methods(&self, scope: PassthruScope) -> Vec<PassthruMethod> {
        match scope {
            PassthruScope::Node => vec![
                PassthruMethod::new("first_method", "Echo the 'bar' parameter")
                    .with_http_methods(vec![HttpMethod::Get, HttpMethod::Post])
                    .synchronous(),
                PassthruMethod::new("second_method", "Echo the 'bar' parameter, eventually"),
            ],
            PassthruScope::Driver => vec![
                PassthruMethod::new("driver_ping", "Liveness probe")
                    .with_http_methods(vec![HttpMethod::Get])
                    .synchronous(),
            ],
        }
    }

    async fn validate_passthru(
        &self,
        _node: Option<&Node>,
        method: &str,
        params: &Value,
    ) -> DriverResult<()> {
        self.state.hit(&format!("vendor.validate:{method}"))?;
        match method {
            "first_method" | "second_method" => {
                if params.get("bar").is_none() {
                    return Err(DriverError::Config(format!(
                        "parameter 'bar' not passed to method '{method}'"
                    )));
                }
                Ok(())
            }
            "driver_ping" => Ok(()),
            other => Err(DriverError::Config(format!(
                "unsupported passthru method '{other}'"
            ))),
        }
    }

    async fn invoke(
        &self,
        node: Option<&Node>,
        method: &str,
        params: &Value,
    ) -> DriverResult<Value> {
        self.state.hit(&format!("vendor.invoke:{method}"))?;
        Ok(json!({
            "method": method,
            "node": node.map(|n| n.id.to_string()),
            "bar": params.get("bar").cloned().unwrap_or(Value::Null),
        }))
    }
}

/// The composable fake: one implementation (named `fake`) per capability,
/// with console and raid deliberately left unimplemented so validation has
/// something to report as unsupported.
pub fn fake_hardware_type(state: &Arc<FakeHardware>) -> HardwareType {
    HardwareType::new("fake-hardware")
        .with_power(
            "fake",
            Arc::new(FakePower {
                state: Arc::clone(state),
            }),
        )
        .with_boot(
            "fake",
            Arc::new(FakeBoot {
                state: Arc::clone(state),
            }),
        )
        .with_deploy(
            "fake",
            Arc::new(FakeDeploy {
                state: Arc::clone(state),
            }),
        )
        .with_management(
            "fake",
            Arc::new(FakeManagement {
                state: Arc::clone(state),
            }),
        )
        .with_inspect(
            "fake",
            Arc::new(FakeInspect {
                state: Arc::clone(state),
            }),
        )
        .with_vendor(
            "fake",
            Arc::new(FakeVendor {
                state: Arc::clone(state),
            }),
        )
}

/// The classic-driver packaging of the same fake interfaces.
pub fn fake_classic_driver(state: &Arc<FakeHardware>) -> ClassicDriver {
    ClassicDriver {
        name: "fake".to_string(),
        power: Arc::new(FakePower {
            state: Arc::clone(state),
        }),
        boot: Arc::new(FakeBoot {
            state: Arc::clone(state),
        }),
        deploy: Arc::new(FakeDeploy {
            state: Arc::clone(state),
        }),
        management: Arc::new(FakeManagement {
            state: Arc::clone(state),
        }),
        console: None,
        raid: None,
        inspect: Some(Arc::new(FakeInspect {
            state: Arc::clone(state),
        })),
        vendor: Some(Arc::new(FakeVendor {
            state: Arc::clone(state),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrite_common::models::ProvisionState;

    fn power(state: &Arc<FakeHardware>) -> FakePower {
        FakePower {
            state: Arc::clone(state),
        }
    }

    #[tokio::test]
    async fn test_power_cycle() {
        let state = FakeHardware::shared();
        let power = power(&state);
        let node = Node::new("fake-hardware", ProvisionState::Available);

        assert_eq!(power.get_power_state(&node).await.unwrap(), PowerState::Off);
        power
            .set_power_state(&node, PowerState::On)
            .await
            .unwrap();
        assert_eq!(power.get_power_state(&node).await.unwrap(), PowerState::On);
        power.reboot(&node).await.unwrap();
        assert_eq!(power.get_power_state(&node).await.unwrap(), PowerState::On);
    }

    #[tokio::test]
    async fn test_power_validate_requires_address() {
        let state = FakeHardware::shared();
        let power = power(&state);
        let mut node = Node::new("fake-hardware", ProvisionState::Enroll);

        let err = power.validate(&node).await.unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
        assert!(err.to_string().contains(POWER_ADDRESS_KEY));

        node.driver_info
            .insert(POWER_ADDRESS_KEY.to_string(), json!("10.0.0.7"));
        assert!(power.validate(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_power_target_rejected() {
        let state = FakeHardware::shared();
        let power = power(&state);
        let node = Node::new("fake-hardware", ProvisionState::Available);
        assert!(power
            .set_power_state(&node, PowerState::Error)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_scripted_failure_fires_once() {
        let state = FakeHardware::shared();
        let power = power(&state);
        let node = Node::new("fake-hardware", ProvisionState::Available);

        state.fail_next(
            "power.get_power_state",
            DriverError::Transient("BMC unreachable".into()),
        );
        assert!(power.get_power_state(&node).await.is_err());
        assert!(power.get_power_state(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_calls_are_recorded() {
        let state = FakeHardware::shared();
        let deploy = FakeDeploy {
            state: Arc::clone(&state),
        };
        let node = Node::new("fake-hardware", ProvisionState::Deploying);

        deploy.prepare(&node).await.unwrap();
        assert_eq!(deploy.deploy(&node).await.unwrap(), StepOutcome::Complete);
        assert_eq!(
            state.calls(),
            vec!["deploy.prepare".to_string(), "deploy.deploy".to_string()]
        );
    }

    #[tokio::test]
    async fn test_async_deploy_waits() {
        let state = FakeHardware::shared();
        let deploy = FakeDeploy {
            state: Arc::clone(&state),
        };
        let node = Node::new("fake-hardware", ProvisionState::Deploying);

        state.set_async_deploy(true);
        assert_eq!(deploy.deploy(&node).await.unwrap(), StepOutcome::Wait);
        assert_eq!(
            deploy.continue_deploy(&node).await.unwrap(),
            StepOutcome::Complete
        );
    }

    #[test]
    fn test_default_clean_steps_split_by_interface() {
        let state = FakeHardware::shared();
        let deploy = FakeDeploy {
            state: Arc::clone(&state),
        };
        let management = FakeManagement {
            state: Arc::clone(&state),
        };
        assert_eq!(deploy.clean_steps().len(), 1);
        assert_eq!(deploy.clean_steps()[0].name, "erase_devices");
        assert_eq!(management.clean_steps().len(), 1);
        assert_eq!(management.clean_steps()[0].name, "reset_bios");
    }

    #[tokio::test]
    async fn test_vendor_validate_requires_bar() {
        let state = FakeHardware::shared();
        let vendor = FakeVendor {
            state: Arc::clone(&state),
        };
        let err = vendor
            .validate_passthru(None, "first_method", &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bar"));

        assert!(vendor
            .validate_passthru(None, "first_method", &json!({"bar": "baz"}))
            .await
            .is_ok());
    }
}
