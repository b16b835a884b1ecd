//! External request surface
//!
//! The wire-format-agnostic operations an API layer exposes: node CRUD,
//! provisioning verbs, validation, ports, maintenance and vendor passthru.
//! The negotiated protocol version arrives as an explicit argument; older
//! versions disable newer behaviors (initial `enroll` state, interface
//! selections) rather than erroring.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use ferrite_common::models::{
    normalize_mac, validate_name, ApiVersion, InterfaceKind, Node, NodePatch, Port, PowerAction,
    ProvisionState, Verb,
};
use ferrite_common::{Error, Result};
use ferrite_driver::{DriverError, HttpMethod};

use crate::conductor::Conductor;
use crate::passthru::PassthruOutcome;

/// Aggregated validation result for one interface.
///
/// `ok` is `None` when the driver does not implement the interface at all,
/// which is distinct from a failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceValidation {
    pub ok: Option<bool>,
    pub reason: Option<String>,
}

pub struct NodeService {
    conductor: Arc<Conductor>,
}

impl NodeService {
    pub fn new(conductor: Arc<Conductor>) -> Self {
        Self { conductor }
    }

    pub fn conductor(&self) -> &Arc<Conductor> {
        &self.conductor
    }

    /// Enroll a new node.
    ///
    /// Under modern protocol versions the node starts in `enroll` and must
    /// be verified before use; legacy versions drop it straight into
    /// `available`.
    pub async fn create_node(
        &self,
        version: ApiVersion,
        driver: &str,
        name: Option<&str>,
        driver_info: Option<Map<String, Value>>,
        properties: Option<Map<String, Value>>,
    ) -> Result<Node> {
        if !self.conductor.registry().contains(driver) {
            return Err(Error::driver_not_found(driver));
        }

        let initial = if version.supports(ApiVersion::ENROLL_STATE) {
            ProvisionState::Enroll
        } else {
            ProvisionState::Available
        };
        let mut node = Node::new(driver, initial);
        if let Some(name) = name {
            validate_name(name)?;
            node.name = Some(name.to_string());
        }
        if let Some(driver_info) = driver_info {
            node.driver_info = driver_info;
        }
        if let Some(properties) = properties {
            node.properties = properties;
        }

        self.conductor.store().insert_node(&node).await?;
        info!(node = %node.id, driver = %driver, state = %initial, "node created");
        Ok(node)
    }

    /// Look a node up by UUID or logical name.
    pub async fn get_node(&self, id_or_name: &str) -> Result<Node> {
        let store = self.conductor.store();
        let node = match Uuid::parse_str(id_or_name) {
            Ok(id) => store.get_node(id).await?,
            Err(_) => store.get_node_by_name(id_or_name).await?,
        };
        node.ok_or_else(|| Error::node_not_found(id_or_name))
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.conductor.store().list_nodes().await
    }

    /// Apply a partial update under the node's lease.
    ///
    /// Interface selection fields are ignored below the
    /// interface-selection version; on classic-driver nodes they are
    /// forced back to none instead of erroring.
    pub async fn update_node(
        &self,
        version: ApiVersion,
        id_or_name: &str,
        patch: NodePatch,
    ) -> Result<Node> {
        let node = self.get_node(id_or_name).await?;
        self.conductor
            .leases()
            .acquire(node.id, self.conductor.host())?;
        let result = self.apply_patch(version, node.clone(), patch).await;
        self.conductor
            .leases()
            .release(node.id, self.conductor.host());
        result
    }

    async fn apply_patch(
        &self,
        version: ApiVersion,
        mut node: Node,
        patch: NodePatch,
    ) -> Result<Node> {
        let registry = self.conductor.registry();

        if let Some(name) = patch.name {
            validate_name(&name)?;
            node.name = Some(name);
        }
        if let Some(driver) = patch.driver {
            if !registry.contains(&driver) {
                return Err(Error::driver_not_found(&driver));
            }
            if driver != node.driver {
                node.driver = driver;
                // interface selections are meaningless under another driver
                node.interfaces.clear();
            }
        }
        if let Some(driver_info) = patch.driver_info {
            node.driver_info = driver_info;
        }
        if let Some(properties) = patch.properties {
            node.properties = properties;
        }
        if let Some(instance_info) = patch.instance_info {
            node.instance_info = instance_info;
        }
        if let Some(interfaces) = patch.interfaces {
            if version.supports(ApiVersion::INTERFACE_SELECTION) {
                if registry.is_classic(&node.driver) {
                    node.interfaces.clear();
                } else {
                    registry.validate_selection(&node.driver, &interfaces)?;
                    node.interfaces = interfaces;
                }
            }
            // older versions ignore the fields entirely
        }
        if registry.is_classic(&node.driver) {
            node.interfaces.clear();
        }

        node.touch();
        self.conductor.store().update_node(&node).await?;
        Ok(node)
    }

    /// Delete a node. Only stable, unleased, non-active nodes may go.
    pub async fn delete_node(&self, id_or_name: &str) -> Result<()> {
        let node = self.get_node(id_or_name).await?;
        if !node.provision_state.is_stable() || node.provision_state == ProvisionState::Active {
            return Err(Error::InvalidState {
                verb: Verb::Teardown,
                state: node.provision_state,
            });
        }
        self.conductor
            .leases()
            .acquire(node.id, self.conductor.host())?;
        let result = self.conductor.store().delete_node(node.id).await;
        self.conductor
            .leases()
            .release(node.id, self.conductor.host());
        result
    }

    /// Request a provisioning verb. Asynchronous: poll the node's state
    /// and `last_error` for the outcome.
    pub async fn set_provision_state(&self, id_or_name: &str, verb: Verb) -> Result<()> {
        let node = self.get_node(id_or_name).await?;
        self.conductor.submit_provision(node.id, verb).await
    }

    /// Request a power change. Asynchronous.
    pub async fn set_power_state(&self, id_or_name: &str, action: PowerAction) -> Result<()> {
        let node = self.get_node(id_or_name).await?;
        self.conductor.submit_power(node.id, action).await
    }

    pub async fn set_maintenance(
        &self,
        id_or_name: &str,
        on: bool,
        reason: Option<&str>,
    ) -> Result<Node> {
        let mut node = self.get_node(id_or_name).await?;
        node.maintenance = on;
        node.maintenance_reason = if on { reason.map(String::from) } else { None };
        node.touch();
        self.conductor.store().update_node(&node).await?;
        Ok(node)
    }

    /// Validate every interface of a node's driver. Read-only and
    /// idempotent; never mutates the node or the hardware.
    pub async fn validate_node(
        &self,
        id_or_name: &str,
    ) -> Result<BTreeMap<InterfaceKind, InterfaceValidation>> {
        let node = self.get_node(id_or_name).await?;
        let driver = self.conductor.registry().resolve(&node)?;

        let mut results = BTreeMap::new();
        for kind in InterfaceKind::ALL {
            let outcome = match kind {
                InterfaceKind::Power => Some(driver.power.validate(&node).await),
                InterfaceKind::Boot => Some(driver.boot.validate(&node).await),
                InterfaceKind::Deploy => Some(driver.deploy.validate(&node).await),
                InterfaceKind::Management => Some(driver.management.validate(&node).await),
                InterfaceKind::Console => match &driver.console {
                    Some(console) => Some(console.validate(&node).await),
                    None => None,
                },
                InterfaceKind::Raid => match &driver.raid {
                    Some(raid) => Some(raid.validate(&node).await),
                    None => None,
                },
                InterfaceKind::Inspect => match &driver.inspect {
                    Some(inspect) => Some(inspect.validate(&node).await),
                    None => None,
                },
                // vendor parameters are validated per call
                InterfaceKind::Vendor => driver.vendor.as_ref().map(|_| Ok(())),
            };
            let validation = match outcome {
                None => InterfaceValidation {
                    ok: None,
                    reason: Some("not supported".to_string()),
                },
                Some(Ok(())) => InterfaceValidation {
                    ok: Some(true),
                    reason: None,
                },
                Some(Err(DriverError::Unsupported(reason))) => InterfaceValidation {
                    ok: None,
                    reason: Some(reason),
                },
                Some(Err(err)) => InterfaceValidation {
                    ok: Some(false),
                    reason: Some(err.to_string()),
                },
            };
            results.insert(kind, validation);
        }
        Ok(results)
    }

    /// Register a port for a node.
    pub async fn create_port(&self, node_id: Uuid, mac_address: &str) -> Result<Port> {
        let store = self.conductor.store();
        if store.get_node(node_id).await?.is_none() {
            return Err(Error::node_not_found(&node_id.to_string()));
        }
        let port = Port::new(node_id, normalize_mac(mac_address)?);
        store.insert_port(&port).await?;
        Ok(port)
    }

    pub async fn list_ports(&self, node_id: Uuid) -> Result<Vec<Port>> {
        self.conductor.store().list_ports(node_id).await
    }

    pub async fn node_vendor_passthru(
        &self,
        id_or_name: &str,
        method: &str,
        verb: HttpMethod,
        params: Value,
    ) -> Result<PassthruOutcome> {
        let node = self.get_node(id_or_name).await?;
        self.conductor
            .node_vendor_passthru(node.id, method, verb, params)
            .await
    }

    pub async fn driver_vendor_passthru(
        &self,
        driver: &str,
        method: &str,
        verb: HttpMethod,
        params: Value,
    ) -> Result<PassthruOutcome> {
        self.conductor
            .driver_vendor_passthru(driver, method, verb, params)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use ferrite_common::models::InterfaceSelection;
    use ferrite_common::ConductorConfig;
    use ferrite_driver::fake::{
        fake_classic_driver, fake_hardware_type, FakeHardware, POWER_ADDRESS_KEY,
    };
    use ferrite_driver::DriverRegistry;
    use serde_json::json;

    fn service() -> (NodeService, Arc<FakeHardware>) {
        let state = FakeHardware::shared();
        let mut registry = DriverRegistry::new();
        registry.register_hardware_type(fake_hardware_type(&state));
        registry.register_classic(fake_classic_driver(&state));
        let conductor = Conductor::new(
            "conductor-test",
            ConductorConfig::default(),
            Arc::new(registry),
            Arc::new(MemoryStore::new()),
        );
        (NodeService::new(conductor), state)
    }

    #[tokio::test]
    async fn test_create_node_version_gates_initial_state() {
        let (service, _) = service();

        let modern = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();
        assert_eq!(modern.provision_state, ProvisionState::Enroll);

        let legacy = service
            .create_node(ApiVersion(5), "fake-hardware", None, None, None)
            .await
            .unwrap();
        assert_eq!(legacy.provision_state, ProvisionState::Available);
    }

    #[tokio::test]
    async fn test_create_node_unknown_driver() {
        let (service, _) = service();
        assert!(matches!(
            service
                .create_node(ApiVersion::CURRENT, "ipmi", None, None, None)
                .await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_node_rejects_bad_and_duplicate_names() {
        let (service, _) = service();
        assert!(service
            .create_node(ApiVersion::CURRENT, "fake-hardware", Some("bad name"), None, None)
            .await
            .is_err());

        service
            .create_node(ApiVersion::CURRENT, "fake-hardware", Some("web-01"), None, None)
            .await
            .unwrap();
        assert!(service
            .create_node(ApiVersion::CURRENT, "fake-hardware", Some("web-01"), None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_get_node_by_id_or_name() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", Some("web-02"), None, None)
            .await
            .unwrap();

        assert_eq!(service.get_node(&node.id.to_string()).await.unwrap().id, node.id);
        assert_eq!(service.get_node("web-02").await.unwrap().id, node.id);
        assert!(matches!(
            service.get_node("web-99").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_interfaces_ignored_below_version() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();

        let patch = NodePatch {
            interfaces: Some(InterfaceSelection {
                power: Some("fake".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let updated = service
            .update_node(ApiVersion(20), &node.id.to_string(), patch.clone())
            .await
            .unwrap();
        assert!(updated.interfaces.is_empty());

        let updated = service
            .update_node(ApiVersion::CURRENT, &node.id.to_string(), patch)
            .await
            .unwrap();
        assert_eq!(updated.interfaces.power.as_deref(), Some("fake"));
    }

    #[tokio::test]
    async fn test_update_interfaces_forced_none_on_classic_nodes() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake", None, None, None)
            .await
            .unwrap();

        let patch = NodePatch {
            interfaces: Some(InterfaceSelection {
                power: Some("fake".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let updated = service
            .update_node(ApiVersion::CURRENT, &node.id.to_string(), patch)
            .await
            .unwrap();
        assert!(updated.interfaces.is_empty());
    }

    #[tokio::test]
    async fn test_switching_to_classic_driver_clears_interfaces() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();

        let patch = NodePatch {
            interfaces: Some(InterfaceSelection {
                deploy: Some("fake".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        service
            .update_node(ApiVersion::CURRENT, &node.id.to_string(), patch)
            .await
            .unwrap();

        let updated = service
            .update_node(
                ApiVersion::CURRENT,
                &node.id.to_string(),
                NodePatch {
                    driver: Some("fake".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.driver, "fake");
        assert!(updated.interfaces.is_empty());
    }

    #[tokio::test]
    async fn test_update_rejects_unknown_selection() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();

        let patch = NodePatch {
            interfaces: Some(InterfaceSelection {
                power: Some("ipmi".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(service
            .update_node(ApiVersion::CURRENT, &node.id.to_string(), patch)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_validate_node_reports_missing_key_then_ready() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();

        let results = service.validate_node(&node.id.to_string()).await.unwrap();
        let power = &results[&InterfaceKind::Power];
        assert_eq!(power.ok, Some(false));
        assert!(power.reason.as_ref().unwrap().contains(POWER_ADDRESS_KEY));
        // unimplemented interfaces are unsupported, not failed
        assert_eq!(results[&InterfaceKind::Console].ok, None);
        assert_eq!(results[&InterfaceKind::Raid].ok, None);
        assert_eq!(results[&InterfaceKind::Deploy].ok, Some(true));

        let patch = NodePatch {
            driver_info: Some(
                [(POWER_ADDRESS_KEY.to_string(), json!("10.0.0.9"))]
                    .into_iter()
                    .collect(),
            ),
            ..Default::default()
        };
        service
            .update_node(ApiVersion::CURRENT, &node.id.to_string(), patch)
            .await
            .unwrap();

        let results = service.validate_node(&node.id.to_string()).await.unwrap();
        assert_eq!(results[&InterfaceKind::Power].ok, Some(true));
    }

    #[tokio::test]
    async fn test_validate_node_is_idempotent() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();

        let before = service.get_node(&node.id.to_string()).await.unwrap();
        for _ in 0..3 {
            service.validate_node(&node.id.to_string()).await.unwrap();
        }
        let after = service.get_node(&node.id.to_string()).await.unwrap();
        assert_eq!(before.provision_state, after.provision_state);
        assert_eq!(before.updated_at, after.updated_at);
        assert_eq!(before.last_error, after.last_error);
    }

    #[tokio::test]
    async fn test_ports() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();

        let port = service
            .create_port(node.id, "AA-BB-CC-00-11-22")
            .await
            .unwrap();
        assert_eq!(port.mac_address, "aa:bb:cc:00:11:22");
        assert!(service.create_port(node.id, "aa:bb:cc:00:11:22").await.is_err());
        assert!(service.create_port(Uuid::new_v4(), "aa:bb:cc:00:11:33").await.is_err());
        assert_eq!(service.list_ports(node.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_toggle() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion(5), "fake-hardware", None, None, None)
            .await
            .unwrap();
        assert!(node.is_schedulable());

        let node = service
            .set_maintenance(&node.id.to_string(), true, Some("PSU swap"))
            .await
            .unwrap();
        assert!(!node.is_schedulable());
        assert_eq!(node.maintenance_reason.as_deref(), Some("PSU swap"));

        let node = service
            .set_maintenance(&node.id.to_string(), false, None)
            .await
            .unwrap();
        assert!(node.is_schedulable());
        assert!(node.maintenance_reason.is_none());
    }

    #[tokio::test]
    async fn test_delete_node_only_from_stable_states() {
        let (service, _) = service();
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();
        service.delete_node(&node.id.to_string()).await.unwrap();
        assert!(service.get_node(&node.id.to_string()).await.is_err());

        // an active node must be torn down first
        let node = service
            .create_node(ApiVersion::CURRENT, "fake-hardware", None, None, None)
            .await
            .unwrap();
        let mut active = service.get_node(&node.id.to_string()).await.unwrap();
        active.provision_state = ProvisionState::Active;
        service.conductor().store().update_node(&active).await.unwrap();
        assert!(matches!(
            service.delete_node(&node.id.to_string()).await,
            Err(Error::InvalidState { .. })
        ));
    }
}
