//! The conductor: per-node task orchestration
//!
//! `submit_provision` and `submit_power` admit a request synchronously
//! (state machine check, interface validation, lease acquisition) and hand
//! the actual work to a bounded worker pool. Hardware outcomes are only
//! observable by polling the node record: success clears `last_error` and
//! lands on the target state, failure records `last_error` and lands on the
//! matching failed state.
//!
//! While a worker runs it renews the node's lease by heartbeat. A lease
//! whose heartbeat stopped marks a crashed conductor; the takeover scan
//! reclaims such nodes, resuming parked work and failing work that died
//! mid-step.

use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ferrite_common::models::{
    normalize_mac, InterfaceKind, Node, Port, PowerAction, PowerState, ProvisionState, Verb,
};
use ferrite_common::{ConductorConfig, Error, Result};
use ferrite_driver::{BoundDriver, CleanStep, DriverRegistry, StepOutcome};

use crate::events::{EventManager, NodeEvent};
use crate::fsm;
use crate::lease::LeaseTable;
use crate::retry::{self, RetryPolicy};
use crate::steps;
use crate::store::NodeStore;

/// `internal_info` key holding the remaining clean steps while a cleaning
/// sequence is parked or between steps.
const CLEAN_STEPS_KEY: &str = "clean_steps";

/// Work a spawned worker executes under the node's lease.
enum OpKind {
    Verify,
    Clean,
    Deploy,
    ContinueDeploy,
    Teardown,
    Inspect,
    Adopt,
    Power(PowerAction),
    NodePassthru { method: String, params: Value },
}

pub struct Conductor {
    host: String,
    config: ConductorConfig,
    registry: Arc<DriverRegistry>,
    store: Arc<dyn NodeStore>,
    leases: Arc<LeaseTable>,
    events: EventManager,
    retry: RetryPolicy,
    workers: Arc<Semaphore>,
    abort_requested: Mutex<HashSet<Uuid>>,
}

impl Conductor {
    pub fn new(
        host: impl Into<String>,
        config: ConductorConfig,
        registry: Arc<DriverRegistry>,
        store: Arc<dyn NodeStore>,
    ) -> Arc<Self> {
        let leases = Arc::new(LeaseTable::new(config.lease_ttl()));
        let retry = RetryPolicy::from_config(&config);
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));
        Arc::new(Self {
            host: host.into(),
            config,
            registry,
            store,
            leases,
            events: EventManager::new(),
            retry,
            workers,
            abort_requested: Mutex::new(HashSet::new()),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DriverRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    pub fn leases(&self) -> &Arc<LeaseTable> {
        &self.leases
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ------------------------------------------------------------------
    // Submission

    /// Apply a provisioning verb to a node.
    ///
    /// Returns once the transition is admitted: the state has flipped and,
    /// for asynchronous transitions, a worker owns the node's lease. The
    /// caller polls the node for the outcome.
    pub async fn submit_provision(self: &Arc<Self>, node_id: Uuid, verb: Verb) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        if verb == Verb::Abort {
            return self.submit_abort(&node).await;
        }

        let (next, target) = fsm::verb_transition(node.provision_state, verb)?;
        let driver = self.registry.resolve(&node)?;

        // Nothing moves toward `available` or `active` unless every
        // required interface validates.
        if matches!(verb, Verb::Provide | Verb::Deploy | Verb::Rebuild) {
            self.validate_required(&node, &driver).await?;
        }
        if verb == Verb::Inspect && driver.inspect.is_none() {
            return Err(Error::Validation(format!(
                "driver {} does not support inspection",
                node.driver
            )));
        }

        self.leases.acquire(node_id, &self.host)?;
        self.clear_abort(node_id);

        node.last_error = None;
        if let Err(err) = self.persist_transition(&mut node, next, target).await {
            self.leases.release(node_id, &self.host);
            return Err(err);
        }
        info!(node = %node_id, verb = %verb, state = %next, "provision state change accepted");

        if target.is_none() {
            // synchronous flip, e.g. available -> manageable
            self.leases.release(node_id, &self.host);
            return Ok(());
        }

        let kind = match next {
            ProvisionState::Verifying => OpKind::Verify,
            ProvisionState::Cleaning => OpKind::Clean,
            ProvisionState::Deploying => OpKind::Deploy,
            ProvisionState::Deleting => OpKind::Teardown,
            ProvisionState::Inspecting => OpKind::Inspect,
            ProvisionState::Adopting => OpKind::Adopt,
            other => {
                self.leases.release(node_id, &self.host);
                return Err(Error::Internal(format!(
                    "no worker flow for state {other}"
                )));
            }
        };
        self.spawn_operation(node_id, kind);
        Ok(())
    }

    /// Request a power change. Accepted from any provision state as long
    /// as the node is not busy.
    pub async fn submit_power(self: &Arc<Self>, node_id: Uuid, action: PowerAction) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        self.registry.resolve(&node)?;

        self.leases.acquire(node_id, &self.host)?;
        node.target_power_state = Some(action.target_state());
        node.touch();
        if let Err(err) = self.store.update_node(&node).await {
            self.leases.release(node_id, &self.host);
            return Err(err);
        }
        self.spawn_operation(node_id, OpKind::Power(action));
        Ok(())
    }

    /// Resume a deployment parked in `deploy wait` (the out-of-band
    /// completion callback).
    pub async fn continue_deploy(self: &Arc<Self>, node_id: Uuid) -> Result<()> {
        self.resume(node_id, ProvisionState::DeployWait, OpKind::ContinueDeploy)
            .await
    }

    /// Resume a cleaning sequence parked in `clean wait`.
    pub async fn continue_cleaning(self: &Arc<Self>, node_id: Uuid) -> Result<()> {
        self.resume(node_id, ProvisionState::CleanWait, OpKind::Clean)
            .await
    }

    async fn resume(
        self: &Arc<Self>,
        node_id: Uuid,
        expected: ProvisionState,
        kind: OpKind,
    ) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        if node.provision_state != expected {
            return Err(Error::Validation(format!(
                "node {node_id} is in state {}, not {expected}",
                node.provision_state
            )));
        }
        let resumed = fsm::resume_state(expected)
            .ok_or_else(|| Error::Internal(format!("state {expected} is not resumable")))?;

        self.leases.acquire(node_id, &self.host)?;
        let target = node.target_provision_state;
        if let Err(err) = self.persist_transition(&mut node, resumed, target).await {
            self.leases.release(node_id, &self.host);
            return Err(err);
        }
        self.spawn_operation(node_id, kind);
        Ok(())
    }

    /// Abort is itself asynchronous and subject to the lease discipline: a
    /// parked node is failed immediately, a node whose worker is mid-call
    /// gets a flag the step runner polls between steps.
    async fn submit_abort(&self, node: &Node) -> Result<()> {
        let (next, _) = fsm::verb_transition(node.provision_state, Verb::Abort)?;

        match self.leases.acquire(node.id, &self.host) {
            Ok(_) => {
                let mut node = node.clone();
                node.internal_info.remove(CLEAN_STEPS_KEY);
                let abort_reason = format!("{} aborted by request", node.provision_state);
                let result = self
                    .fail_to(
                        &mut node,
                        next,
                        abort_reason,
                    )
                    .await;
                self.leases.release(node.id, &self.host);
                result
            }
            Err(Error::NodeBusy { .. }) => {
                debug!(node = %node.id, "node busy, abort flag set");
                self.abort_requested.lock().unwrap().insert(node.id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn take_abort(&self, node_id: Uuid) -> bool {
        self.abort_requested.lock().unwrap().remove(&node_id)
    }

    fn clear_abort(&self, node_id: Uuid) {
        self.abort_requested.lock().unwrap().remove(&node_id);
    }

    // ------------------------------------------------------------------
    // Worker plumbing

    fn spawn_operation(self: &Arc<Self>, node_id: Uuid, kind: OpKind) {
        let conductor = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = match conductor.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let heartbeat = conductor.spawn_heartbeat(node_id);
            let result = match kind {
                OpKind::Verify => conductor.run_verification(node_id).await,
                OpKind::Clean => conductor.run_cleaning(node_id).await,
                OpKind::Deploy => conductor.run_deploy(node_id).await,
                OpKind::ContinueDeploy => conductor.run_continue_deploy(node_id).await,
                OpKind::Teardown => conductor.run_teardown(node_id).await,
                OpKind::Inspect => conductor.run_inspection(node_id).await,
                OpKind::Adopt => conductor.run_adoption(node_id).await,
                OpKind::Power(action) => conductor.run_power(node_id, action).await,
                OpKind::NodePassthru { method, params } => {
                    conductor.run_node_passthru(node_id, &method, params).await
                }
            };
            heartbeat.abort();
            conductor.leases.release(node_id, &conductor.host);
            if let Err(err) = result {
                error!(node = %node_id, error = %err, "operation worker failed");
            }
        });
    }

    fn spawn_heartbeat(&self, node_id: Uuid) -> JoinHandle<()> {
        let leases = Arc::clone(&self.leases);
        let host = self.host.clone();
        let interval = self.config.heartbeat_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if leases.heartbeat(node_id, &host).is_err() {
                    warn!(node = %node_id, "lease lost, stopping heartbeat");
                    break;
                }
            }
        })
    }

    async fn must_get(&self, node_id: Uuid) -> Result<Node> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::node_not_found(&node_id.to_string()))
    }

    async fn persist_transition(
        &self,
        node: &mut Node,
        to: ProvisionState,
        target: Option<ProvisionState>,
    ) -> Result<()> {
        let from = node.provision_state;
        node.provision_state = to;
        node.target_provision_state = target;
        node.provision_updated_at = chrono::Utc::now();
        node.touch();
        self.store.update_node(node).await?;
        if from != to {
            self.events.publish(NodeEvent::StateChanged {
                node: node.id,
                from,
                to,
            });
        }
        Ok(())
    }

    /// Land on the target state with `last_error` cleared.
    async fn finish_ok(&self, node: &mut Node) -> Result<()> {
        let to = node.target_provision_state.unwrap_or(node.provision_state);
        node.last_error = None;
        info!(node = %node.id, state = %to, "operation complete");
        self.persist_transition(node, to, None).await
    }

    /// Land on the failure state for the current one.
    async fn finish_err(&self, node: &mut Node, error: String) -> Result<()> {
        let to = fsm::fail_state(node.provision_state);
        self.fail_to(node, to, error).await
    }

    async fn fail_to(&self, node: &mut Node, to: ProvisionState, error: String) -> Result<()> {
        warn!(node = %node.id, state = %to, error = %error, "operation failed");
        node.last_error = Some(error.clone());
        self.events.publish(NodeEvent::ProvisionFailed {
            node: node.id,
            state: to,
            error,
        });
        self.persist_transition(node, to, None).await
    }

    async fn validate_required(&self, node: &Node, driver: &BoundDriver) -> Result<()> {
        let mut failures = Vec::new();
        for kind in InterfaceKind::REQUIRED {
            let checked = match kind {
                InterfaceKind::Power => driver.power.validate(node).await,
                InterfaceKind::Boot => driver.boot.validate(node).await,
                InterfaceKind::Deploy => driver.deploy.validate(node).await,
                InterfaceKind::Management => driver.management.validate(node).await,
                _ => Ok(()),
            };
            if let Err(err) = checked {
                failures.push(format!("{kind}: {err}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "node failed interface validation: {}",
                failures.join("; ")
            )))
        }
    }

    // ------------------------------------------------------------------
    // Flows

    async fn run_verification(&self, node_id: Uuid) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;

        let checked = async {
            driver.power.validate(&node).await.map_err(|e| format!("power: {e}"))?;
            driver
                .management
                .validate(&node)
                .await
                .map_err(|e| format!("management: {e}"))?;
            Ok::<(), String>(())
        }
        .await;

        match checked {
            Ok(()) => self.finish_ok(&mut node).await,
            Err(reason) => {
                self.finish_err(&mut node, format!("verification failed: {reason}"))
                    .await
            }
        }
    }

    /// Run (or resume) the cleaning sequence. Remaining steps live in
    /// `internal_info` so a parked or taken-over sequence picks up where
    /// it stopped.
    async fn run_cleaning(&self, node_id: Uuid) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;

        let mut remaining: Vec<CleanStep> = match node.internal_info.get(CLEAN_STEPS_KEY) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| Error::Internal(format!("corrupt clean step record: {e}")))?,
            None => {
                let automated = node.target_provision_state == Some(ProvisionState::Available);
                if automated && !self.config.automated_clean {
                    Vec::new()
                } else {
                    steps::collect_clean_steps(&driver)
                }
            }
        };

        while !remaining.is_empty() {
            if self.take_abort(node_id) {
                node.internal_info.remove(CLEAN_STEPS_KEY);
                return self
                    .finish_err(&mut node, "cleaning aborted by request".to_string())
                    .await;
            }

            let step = remaining.remove(0);
            node.internal_info
                .insert(CLEAN_STEPS_KEY.to_string(), json!(remaining));
            self.store.update_node(&node).await?;

            debug!(node = %node_id, step = %step.name, "executing clean step");
            let outcome = retry::call_driver(&self.retry, &format!("clean_step:{}", step.name), || {
                steps::execute_step(&driver, &node, &step)
            })
            .await;

            match outcome {
                Ok(StepOutcome::Complete) => continue,
                Ok(StepOutcome::Wait) => {
                    let target = node.target_provision_state;
                    info!(node = %node_id, step = %step.name, "clean step continues out of band");
                    return self
                        .persist_transition(&mut node, ProvisionState::CleanWait, target)
                        .await;
                }
                Err(err) => {
                    node.internal_info.remove(CLEAN_STEPS_KEY);
                    return self
                        .finish_err(&mut node, format!("clean step '{}' failed: {err}", step.name))
                        .await;
                }
            }
        }

        node.internal_info.remove(CLEAN_STEPS_KEY);
        self.finish_ok(&mut node).await
    }

    async fn run_deploy(&self, node_id: Uuid) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;

        let outcome = async {
            driver.deploy.validate(&node).await?;
            retry::call_driver(&self.retry, "boot.prepare_ramdisk", || {
                driver.boot.prepare_ramdisk(&node)
            })
            .await?;
            retry::call_driver(&self.retry, "deploy.prepare", || driver.deploy.prepare(&node))
                .await?;
            retry::call_driver(&self.retry, "deploy.deploy", || driver.deploy.deploy(&node)).await
        }
        .await;

        match outcome {
            Ok(StepOutcome::Complete) => self.finish_ok(&mut node).await,
            Ok(StepOutcome::Wait) => {
                let target = node.target_provision_state;
                self.persist_transition(&mut node, ProvisionState::DeployWait, target)
                    .await
            }
            Err(err) => {
                self.finish_err(&mut node, format!("deploy failed: {err}"))
                    .await
            }
        }
    }

    async fn run_continue_deploy(&self, node_id: Uuid) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;

        let outcome = retry::call_driver(&self.retry, "deploy.continue_deploy", || {
            driver.deploy.continue_deploy(&node)
        })
        .await;

        match outcome {
            Ok(StepOutcome::Complete) => self.finish_ok(&mut node).await,
            Ok(StepOutcome::Wait) => {
                let target = node.target_provision_state;
                self.persist_transition(&mut node, ProvisionState::DeployWait, target)
                    .await
            }
            Err(err) => {
                self.finish_err(&mut node, format!("deploy failed: {err}"))
                    .await
            }
        }
    }

    async fn run_teardown(&self, node_id: Uuid) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;

        let torn_down = async {
            retry::call_driver(&self.retry, "deploy.tear_down", || {
                driver.deploy.tear_down(&node)
            })
            .await?;
            retry::call_driver(&self.retry, "power.set_power_state", || {
                driver
                    .power
                    .set_power_state(&node, PowerState::Off)
            })
            .await?;
            retry::call_driver(&self.retry, "deploy.clean_up", || driver.deploy.clean_up(&node))
                .await?;
            retry::call_driver(&self.retry, "boot.clean_up_ramdisk", || {
                driver.boot.clean_up_ramdisk(&node)
            })
            .await
        }
        .await;

        if let Err(err) = torn_down {
            return self
                .finish_err(&mut node, format!("tear down failed: {err}"))
                .await;
        }

        node.instance_info.clear();
        node.power_state = PowerState::Off;

        if self.config.automated_clean {
            // teardown flows into the cleaning sequence before the node
            // returns to the schedulable pool
            let target = node.target_provision_state;
            self.persist_transition(&mut node, ProvisionState::Cleaning, target)
                .await?;
            self.run_cleaning(node_id).await
        } else {
            self.finish_ok(&mut node).await
        }
    }

    async fn run_inspection(&self, node_id: Uuid) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;
        let inspect = match &driver.inspect {
            Some(inspect) => inspect,
            None => {
                return self
                    .finish_err(&mut node, "driver does not support inspection".to_string())
                    .await
            }
        };

        let report = retry::call_driver(&self.retry, "inspect.inspect_hardware", || {
            inspect.inspect_hardware(&node)
        })
        .await;

        if self.take_abort(node_id) {
            return self
                .finish_err(&mut node, "inspection aborted by request".to_string())
                .await;
        }

        match report {
            Ok(report) => {
                for (key, value) in report.properties {
                    node.properties.insert(key, value);
                }
                for mac in report.mac_addresses {
                    let mac = match normalize_mac(&mac) {
                        Ok(mac) => mac,
                        Err(_) => {
                            warn!(node = %node_id, mac = %mac, "inspection reported invalid MAC");
                            continue;
                        }
                    };
                    match self.store.insert_port(&Port::new(node_id, mac)).await {
                        Ok(()) | Err(Error::Validation(_)) => {} // already registered
                        Err(err) => return Err(err),
                    }
                }
                self.finish_ok(&mut node).await
            }
            Err(err) => {
                self.finish_err(&mut node, format!("inspection failed: {err}"))
                    .await
            }
        }
    }

    async fn run_adoption(&self, node_id: Uuid) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;

        let adopted = async {
            driver.power.validate(&node).await?;
            driver.boot.validate(&node).await?;
            retry::call_driver(&self.retry, "deploy.take_over", || {
                driver.deploy.take_over(&node)
            })
            .await
        }
        .await;

        match adopted {
            Ok(()) => self.finish_ok(&mut node).await,
            Err(err) => {
                self.finish_err(&mut node, format!("adoption failed: {err}"))
                    .await
            }
        }
    }

    async fn run_power(&self, node_id: Uuid, action: PowerAction) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;

        let changed = match action {
            PowerAction::PowerOn => {
                retry::call_driver(&self.retry, "power.set_power_state", || {
                    driver
                        .power
                        .set_power_state(&node, PowerState::On)
                })
                .await
            }
            PowerAction::PowerOff => {
                retry::call_driver(&self.retry, "power.set_power_state", || {
                    driver
                        .power
                        .set_power_state(&node, PowerState::Off)
                })
                .await
            }
            PowerAction::Reboot => {
                retry::call_driver(&self.retry, "power.reboot", || driver.power.reboot(&node))
                    .await
            }
        };

        match changed {
            Ok(()) => {
                node.power_state = action.target_state();
                node.target_power_state = None;
                node.last_error = None;
                node.touch();
                self.store.update_node(&node).await?;
                self.events.publish(NodeEvent::PowerStateChanged {
                    node: node_id,
                    state: node.power_state,
                });
                Ok(())
            }
            Err(err) => {
                // the observed power state is left unchanged
                node.target_power_state = None;
                node.last_error = Some(format!("failed to {action} node: {err}"));
                node.touch();
                self.store.update_node(&node).await
            }
        }
    }

    async fn run_node_passthru(&self, node_id: Uuid, method: &str, params: Value) -> Result<()> {
        let mut node = self.must_get(node_id).await?;
        let driver = self.registry.resolve(&node)?;
        let vendor = driver
            .vendor
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("vendor interface for driver {}", node.driver)))?;

        let invoked = retry::call_driver(&self.retry, &format!("vendor.{method}"), || {
            vendor.invoke(Some(&node), method, &params)
        })
        .await;

        if let Err(err) = invoked {
            node.last_error = Some(format!("vendor passthru '{method}' failed: {err}"));
            node.touch();
            self.store.update_node(&node).await?;
        }
        Ok(())
    }

    pub(crate) fn spawn_node_passthru(self: &Arc<Self>, node_id: Uuid, method: String, params: Value) {
        self.spawn_operation(node_id, OpKind::NodePassthru { method, params });
    }

    // ------------------------------------------------------------------
    // Background maintenance

    /// One pass of the power state sync: poll every idle node's power
    /// interface and record what the hardware reports. A node whose power
    /// state cannot be read goes into maintenance rather than error.
    pub async fn run_power_sync_once(&self) -> Result<()> {
        for node in self.store.list_nodes().await? {
            if node.maintenance
                || !node.provision_state.is_stable()
                || node.target_power_state.is_some()
            {
                continue;
            }
            if self.leases.acquire(node.id, &self.host).is_err() {
                continue;
            }
            let result = self.sync_power_state(node).await;
            if let Err(err) = &result {
                warn!(error = %err, "power sync pass failed for a node");
            }
        }
        Ok(())
    }

    async fn sync_power_state(&self, mut node: Node) -> Result<()> {
        let node_id = node.id;
        let result = async {
            let driver = self.registry.resolve(&node)?;
            let observed = retry::call_driver(&self.retry, "power.get_power_state", || {
                driver.power.get_power_state(&node)
            })
            .await;
            match observed {
                Ok(state) if state != node.power_state => {
                    debug!(node = %node_id, state = %state, "power state changed");
                    node.power_state = state;
                    node.touch();
                    self.store.update_node(&node).await?;
                    self.events.publish(NodeEvent::PowerStateChanged {
                        node: node_id,
                        state,
                    });
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(err) => {
                    warn!(node = %node_id, error = %err, "cannot read power state, setting maintenance");
                    node.maintenance = true;
                    node.maintenance_reason =
                        Some(format!("power state could not be retrieved: {err}"));
                    node.touch();
                    self.store.update_node(&node).await
                }
            }
        }
        .await;
        self.leases.release(node_id, &self.host);
        result
    }

    /// One pass of the stale-lease scan: reclaim nodes whose holder
    /// stopped heartbeating. Parked work is resumed, mid-step work is
    /// marked incomplete.
    pub async fn run_takeover_once(self: &Arc<Self>) -> Result<()> {
        for (node_id, previous) in self.leases.stale() {
            if self.leases.acquire(node_id, &self.host).is_err() {
                continue;
            }
            let result = self.recover(node_id, &previous).await;
            self.leases.release(node_id, &self.host);
            if let Err(err) = result {
                warn!(node = %node_id, error = %err, "takeover failed");
            }
        }
        Ok(())
    }

    async fn recover(&self, node_id: Uuid, previous: &str) -> Result<()> {
        let mut node = match self.store.get_node(node_id).await? {
            Some(node) => node,
            None => return Ok(()), // deleted since
        };

        match node.provision_state {
            ProvisionState::DeployWait => {
                info!(node = %node_id, previous, "taking over a waiting deployment");
                let driver = self.registry.resolve(&node)?;
                retry::call_driver(&self.retry, "deploy.take_over", || {
                    driver.deploy.take_over(&node)
                })
                .await
                .map_err(Error::from)
            }
            ProvisionState::CleanWait => {
                // the recorded steps resume when the callback arrives
                info!(node = %node_id, previous, "taking over a waiting cleaning sequence");
                Ok(())
            }
            state if !state.is_stable() => {
                self.finish_err(
                    &mut node,
                    format!("conductor {previous} stopped heartbeating during {state}; operation marked incomplete"),
                )
                .await
            }
            _ => Ok(()),
        }
    }

    /// Spawn the periodic power sync and takeover scans.
    pub fn spawn_background_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if self.config.power_sync_interval_secs > 0 {
            let conductor = Arc::clone(self);
            let interval = std::time::Duration::from_secs(self.config.power_sync_interval_secs);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(err) = conductor.run_power_sync_once().await {
                        warn!(error = %err, "power sync pass failed");
                    }
                }
            }));
        }
        if self.config.takeover_interval_secs > 0 {
            let conductor = Arc::clone(self);
            let interval = std::time::Duration::from_secs(self.config.takeover_interval_secs);
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(err) = conductor.run_takeover_once().await {
                        warn!(error = %err, "takeover pass failed");
                    }
                }
            }));
        }
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use ferrite_driver::fake::{fake_hardware_type, FakeHardware, POWER_ADDRESS_KEY};
    use ferrite_driver::DriverError;
    use std::time::Duration;

    fn test_config() -> ConductorConfig {
        ConductorConfig {
            lease_ttl_secs: 1,
            heartbeat_interval_secs: 10,
            retry_initial_backoff_ms: 1,
            retry_max_backoff_ms: 5,
            ..ConductorConfig::default()
        }
    }

    fn setup(config: ConductorConfig) -> (Arc<Conductor>, Arc<FakeHardware>) {
        let state = FakeHardware::shared();
        let mut registry = ferrite_driver::DriverRegistry::new();
        registry.register_hardware_type(fake_hardware_type(&state));
        let conductor = Conductor::new(
            "conductor-test",
            config,
            Arc::new(registry),
            Arc::new(MemoryStore::new()),
        );
        (conductor, state)
    }

    async fn make_node(
        conductor: &Arc<Conductor>,
        state: ProvisionState,
        with_credentials: bool,
    ) -> Uuid {
        let mut node = Node::new("fake-hardware", state);
        if with_credentials {
            node.driver_info
                .insert(POWER_ADDRESS_KEY.to_string(), json!("10.0.0.7"));
        }
        conductor.store.insert_node(&node).await.unwrap();
        node.id
    }

    async fn wait_for<F>(conductor: &Arc<Conductor>, node_id: Uuid, predicate: F) -> Node
    where
        F: Fn(&Node) -> bool,
    {
        for _ in 0..300 {
            let node = conductor.store.get_node(node_id).await.unwrap().unwrap();
            if predicate(&node) {
                return node;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never reached the expected condition");
    }

    #[tokio::test]
    async fn test_manage_verifies_and_reaches_manageable() {
        let (conductor, _state) = setup(test_config());
        let node_id = make_node(&conductor, ProvisionState::Enroll, true).await;

        conductor.submit_provision(node_id, Verb::Manage).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Manageable
        })
        .await;
        assert!(node.last_error.is_none());
        assert!(node.target_provision_state.is_none());
        assert!(!conductor.leases.is_locked(node_id));
    }

    #[tokio::test]
    async fn test_manage_without_credentials_returns_to_enroll() {
        let (conductor, _state) = setup(test_config());
        let node_id = make_node(&conductor, ProvisionState::Enroll, false).await;

        conductor.submit_provision(node_id, Verb::Manage).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| n.last_error.is_some()).await;
        assert_eq!(node.provision_state, ProvisionState::Enroll);
        assert!(node
            .last_error
            .as_ref()
            .unwrap()
            .contains(POWER_ADDRESS_KEY));
        assert!(node.target_provision_state.is_none());
    }

    #[tokio::test]
    async fn test_provide_runs_clean_steps_in_priority_order() {
        let (conductor, state) = setup(test_config());
        state.set_clean_steps(vec![
            CleanStep::new("third", InterfaceKind::Deploy, 1),
            CleanStep::new("first", InterfaceKind::Deploy, 30),
            CleanStep::new("second", InterfaceKind::Management, 10),
        ]);
        let node_id = make_node(&conductor, ProvisionState::Manageable, true).await;

        conductor.submit_provision(node_id, Verb::Provide).await.unwrap();
        wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Available
        })
        .await;

        let steps: Vec<String> = state
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("clean_step:"))
            .collect();
        assert_eq!(
            steps,
            vec![
                "clean_step:first".to_string(),
                "clean_step:second".to_string(),
                "clean_step:third".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_priority_zero_step_is_skipped() {
        let (conductor, state) = setup(test_config());
        state.set_clean_steps(vec![
            CleanStep::new("first", InterfaceKind::Deploy, 30),
            CleanStep::new("second", InterfaceKind::Deploy, 0),
            CleanStep::new("third", InterfaceKind::Deploy, 1),
        ]);
        let node_id = make_node(&conductor, ProvisionState::Manageable, true).await;

        conductor.submit_provision(node_id, Verb::Provide).await.unwrap();
        wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Available
        })
        .await;

        let calls = state.calls();
        assert!(calls.contains(&"clean_step:first".to_string()));
        assert!(!calls.contains(&"clean_step:second".to_string()));
        assert!(calls.contains(&"clean_step:third".to_string()));
    }

    #[tokio::test]
    async fn test_async_clean_step_parks_then_resumes() {
        let (conductor, state) = setup(test_config());
        state.set_clean_steps(vec![
            CleanStep::new("first", InterfaceKind::Deploy, 30),
            CleanStep::new("second", InterfaceKind::Deploy, 10),
        ]);
        state.set_step_async("first");
        let node_id = make_node(&conductor, ProvisionState::Manageable, true).await;

        conductor.submit_provision(node_id, Verb::Provide).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::CleanWait
        })
        .await;
        // the remaining steps are recorded for the continuation
        assert!(node.internal_info.contains_key(CLEAN_STEPS_KEY));
        wait_for(&conductor, node_id, |n| !conductor.leases.is_locked(n.id)).await;

        conductor.continue_cleaning(node_id).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Available
        })
        .await;
        assert!(!node.internal_info.contains_key(CLEAN_STEPS_KEY));
        assert!(state.calls().contains(&"clean_step:second".to_string()));
    }

    #[tokio::test]
    async fn test_clean_failure_requires_operator_intervention() {
        let (conductor, state) = setup(test_config());
        state.fail_next(
            "clean_step:erase_devices",
            DriverError::Hardware("disk controller fault".into()),
        );
        let node_id = make_node(&conductor, ProvisionState::Manageable, true).await;

        conductor.submit_provision(node_id, Verb::Provide).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::CleanFailed
        })
        .await;
        assert!(node.last_error.as_ref().unwrap().contains("erase_devices"));

        // no automatic retry: provide is illegal until the operator
        // re-manages the node
        let err = conductor
            .submit_provision(node_id, Verb::Provide)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));

        conductor.submit_provision(node_id, Verb::Manage).await.unwrap();
        wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Manageable
        })
        .await;
    }

    #[tokio::test]
    async fn test_deploy_and_teardown_lifecycle() {
        let (conductor, state) = setup(test_config());
        let node_id = make_node(&conductor, ProvisionState::Available, true).await;

        conductor.submit_provision(node_id, Verb::Deploy).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Active
        })
        .await;
        assert!(node.last_error.is_none());

        state.clear_calls();
        conductor
            .submit_provision(node_id, Verb::Teardown)
            .await
            .unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Available
        })
        .await;
        assert!(node.instance_info.is_empty());
        assert_eq!(node.power_state, PowerState::Off);

        let calls = state.calls();
        assert!(calls.contains(&"deploy.tear_down".to_string()));
        // teardown flows through automated cleaning before available
        assert!(calls.contains(&"clean_step:erase_devices".to_string()));
    }

    #[tokio::test]
    async fn test_async_deploy_waits_then_continues() {
        let (conductor, state) = setup(test_config());
        state.set_async_deploy(true);
        let node_id = make_node(&conductor, ProvisionState::Available, true).await;

        conductor.submit_provision(node_id, Verb::Deploy).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::DeployWait
        })
        .await;
        // parked nodes hold no lease and keep their target
        assert_eq!(node.target_provision_state, Some(ProvisionState::Active));
        wait_for(&conductor, node_id, |n| {
            !conductor.leases.is_locked(n.id)
        })
        .await;

        conductor.continue_deploy(node_id).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Active
        })
        .await;
        assert!(node.last_error.is_none());
        assert!(state.calls().contains(&"deploy.continue_deploy".to_string()));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_one_wins() {
        let (conductor, state) = setup(test_config());
        state.set_delay("power.set_power_state", Duration::from_millis(300));
        let node_id = make_node(&conductor, ProvisionState::Available, true).await;

        let a = conductor.submit_power(node_id, PowerAction::PowerOn);
        let b = conductor.submit_power(node_id, PowerAction::PowerOff);
        let (a, b) = tokio::join!(a, b);

        let busy = |r: &Result<()>| matches!(r, Err(Error::NodeBusy { .. }));
        assert!(
            (a.is_ok() && busy(&b)) || (b.is_ok() && busy(&a)),
            "expected exactly one acceptance and one NodeBusy, got {a:?} / {b:?}"
        );
    }

    #[tokio::test]
    async fn test_abort_from_deploy_wait() {
        let (conductor, _state) = setup(test_config());
        let mut node = Node::new("fake-hardware", ProvisionState::DeployWait);
        node.target_provision_state = Some(ProvisionState::Active);
        let node_id = node.id;
        conductor.store.insert_node(&node).await.unwrap();

        conductor.submit_provision(node_id, Verb::Abort).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::DeployFailed
        })
        .await;
        assert!(node.last_error.as_ref().unwrap().contains("aborted"));
        assert!(node.target_provision_state.is_none());
    }

    #[tokio::test]
    async fn test_abort_illegal_from_stable_states() {
        let (conductor, _state) = setup(test_config());
        let node_id = make_node(&conductor, ProvisionState::Available, true).await;

        let err = conductor
            .submit_provision(node_id, Verb::Abort)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                verb: Verb::Abort,
                state: ProvisionState::Available
            }
        ));
    }

    #[tokio::test]
    async fn test_abort_flag_polled_by_running_worker() {
        let (conductor, state) = setup(test_config());
        state.set_delay("inspect.inspect_hardware", Duration::from_millis(200));
        let node_id = make_node(&conductor, ProvisionState::Manageable, true).await;

        conductor.submit_provision(node_id, Verb::Inspect).await.unwrap();
        // the worker holds the lease, so abort can only set the flag
        conductor.submit_provision(node_id, Verb::Abort).await.unwrap();

        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::InspectFailed
        })
        .await;
        assert!(node.last_error.as_ref().unwrap().contains("aborted"));
    }

    #[tokio::test]
    async fn test_takeover_resumes_waiting_deploy() {
        let (conductor, state) = setup(test_config());
        let mut node = Node::new("fake-hardware", ProvisionState::DeployWait);
        node.target_provision_state = Some(ProvisionState::Active);
        let node_id = node.id;
        conductor.store.insert_node(&node).await.unwrap();

        // a conductor that stops heartbeating right after parking the node
        conductor.leases.acquire(node_id, "dead-conductor").unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        conductor.run_takeover_once().await.unwrap();

        let node = conductor.store.get_node(node_id).await.unwrap().unwrap();
        assert_eq!(node.provision_state, ProvisionState::DeployWait);
        assert!(node.last_error.is_none());
        assert!(state.calls().contains(&"deploy.take_over".to_string()));
    }

    #[tokio::test]
    async fn test_takeover_fails_work_that_died_mid_step() {
        let (conductor, _state) = setup(test_config());
        let mut node = Node::new("fake-hardware", ProvisionState::Deploying);
        node.target_provision_state = Some(ProvisionState::Active);
        let node_id = node.id;
        conductor.store.insert_node(&node).await.unwrap();

        conductor.leases.acquire(node_id, "dead-conductor").unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        conductor.run_takeover_once().await.unwrap();

        let node = conductor.store.get_node(node_id).await.unwrap().unwrap();
        assert_eq!(node.provision_state, ProvisionState::DeployFailed);
        assert!(node
            .last_error
            .as_ref()
            .unwrap()
            .contains("stopped heartbeating"));
    }

    #[tokio::test]
    async fn test_power_action_success() {
        let (conductor, _state) = setup(test_config());
        let node_id = make_node(&conductor, ProvisionState::Available, true).await;

        conductor
            .submit_power(node_id, PowerAction::PowerOn)
            .await
            .unwrap();
        let node = wait_for(&conductor, node_id, |n| n.power_state == PowerState::On).await;
        assert!(node.target_power_state.is_none());
        assert!(node.last_error.is_none());
    }

    #[tokio::test]
    async fn test_power_action_failure_leaves_state() {
        let (conductor, state) = setup(test_config());
        state.fail_next(
            "power.set_power_state",
            DriverError::Hardware("relay stuck".into()),
        );
        let node_id = make_node(&conductor, ProvisionState::Available, true).await;

        conductor
            .submit_power(node_id, PowerAction::PowerOn)
            .await
            .unwrap();
        let node = wait_for(&conductor, node_id, |n| n.last_error.is_some()).await;
        assert_eq!(node.power_state, PowerState::Unknown);
        assert!(node.target_power_state.is_none());
        assert!(node.last_error.as_ref().unwrap().contains("power on"));
    }

    #[tokio::test]
    async fn test_transient_power_failure_is_retried() {
        let (conductor, state) = setup(test_config());
        state.fail_next(
            "power.set_power_state",
            DriverError::Transient("BMC busy".into()),
        );
        let node_id = make_node(&conductor, ProvisionState::Available, true).await;

        conductor
            .submit_power(node_id, PowerAction::PowerOff)
            .await
            .unwrap();
        let node = wait_for(&conductor, node_id, |n| n.power_state == PowerState::Off).await;
        assert!(node.last_error.is_none());
    }

    #[tokio::test]
    async fn test_power_sync_observes_and_sets_maintenance() {
        let (conductor, state) = setup(test_config());
        let node_id = make_node(&conductor, ProvisionState::Available, true).await;

        conductor.run_power_sync_once().await.unwrap();
        let node = conductor.store.get_node(node_id).await.unwrap().unwrap();
        assert_eq!(node.power_state, PowerState::Off);
        assert!(!node.maintenance);

        state.fail_next(
            "power.get_power_state",
            DriverError::Hardware("BMC dead".into()),
        );
        conductor.run_power_sync_once().await.unwrap();
        let node = conductor.store.get_node(node_id).await.unwrap().unwrap();
        assert!(node.maintenance);
        assert!(node
            .maintenance_reason
            .as_ref()
            .unwrap()
            .contains("power state"));
        // the last observation is preserved
        assert_eq!(node.power_state, PowerState::Off);
    }

    #[tokio::test]
    async fn test_inspection_merges_properties_and_ports() {
        let (conductor, state) = setup(test_config());
        let mut properties = serde_json::Map::new();
        properties.insert("cpus".to_string(), json!(64));
        properties.insert("memory_mb".to_string(), json!(262144));
        state.set_inspection(ferrite_driver::InspectionReport {
            properties,
            mac_addresses: vec!["52:54:00:AA:BB:01".to_string(), "not-a-mac".to_string()],
        });
        let node_id = make_node(&conductor, ProvisionState::Manageable, true).await;

        conductor.submit_provision(node_id, Verb::Inspect).await.unwrap();
        let node = wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Manageable && n.properties.contains_key("cpus")
        })
        .await;
        assert_eq!(node.properties["cpus"], json!(64));
        assert_eq!(node.properties["memory_mb"], json!(262144));

        // the bogus MAC is skipped, the valid one becomes a port
        let ports = conductor.store.list_ports(node_id).await.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].mac_address, "52:54:00:aa:bb:01");
    }

    #[tokio::test]
    async fn test_events_published_on_transitions() {
        let (conductor, _state) = setup(test_config());
        let node_id = make_node(&conductor, ProvisionState::Enroll, true).await;
        let mut events = conductor.subscribe();

        conductor.submit_provision(node_id, Verb::Manage).await.unwrap();
        wait_for(&conductor, node_id, |n| {
            n.provision_state == ProvisionState::Manageable
        })
        .await;

        let mut saw_verifying = false;
        let mut saw_manageable = false;
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::StateChanged { to, .. } = event {
                saw_verifying |= to == ProvisionState::Verifying;
                saw_manageable |= to == ProvisionState::Manageable;
            }
        }
        assert!(saw_verifying && saw_manageable);
    }
}
