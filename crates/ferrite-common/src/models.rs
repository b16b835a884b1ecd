//! Core data model: nodes, ports, states and verbs
//!
//! A `Node` is the record for one managed physical machine. Its
//! `provision_state` tracks the machine's position in the deployment
//! lifecycle; `target_provision_state` is set only while an asynchronous
//! transition is in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Provision lifecycle state of a node.
///
/// Stable states are rest points that hold no lease; `*Wait` states are
/// parked on an out-of-band callback; the remaining transient states have a
/// worker actively driving them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProvisionState {
    #[serde(rename = "enroll")]
    Enroll,
    #[serde(rename = "verifying")]
    Verifying,
    #[serde(rename = "manageable")]
    Manageable,
    #[serde(rename = "cleaning")]
    Cleaning,
    #[serde(rename = "clean wait")]
    CleanWait,
    #[serde(rename = "clean failed")]
    CleanFailed,
    #[serde(rename = "available")]
    Available,
    #[serde(rename = "deploying")]
    Deploying,
    #[serde(rename = "deploy wait")]
    DeployWait,
    #[serde(rename = "deploy failed")]
    DeployFailed,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "deleting")]
    Deleting,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "inspecting")]
    Inspecting,
    #[serde(rename = "inspect failed")]
    InspectFailed,
    #[serde(rename = "adopting")]
    Adopting,
    #[serde(rename = "adopt failed")]
    AdoptFailed,
}

impl ProvisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionState::Enroll => "enroll",
            ProvisionState::Verifying => "verifying",
            ProvisionState::Manageable => "manageable",
            ProvisionState::Cleaning => "cleaning",
            ProvisionState::CleanWait => "clean wait",
            ProvisionState::CleanFailed => "clean failed",
            ProvisionState::Available => "available",
            ProvisionState::Deploying => "deploying",
            ProvisionState::DeployWait => "deploy wait",
            ProvisionState::DeployFailed => "deploy failed",
            ProvisionState::Active => "active",
            ProvisionState::Deleting => "deleting",
            ProvisionState::Error => "error",
            ProvisionState::Inspecting => "inspecting",
            ProvisionState::InspectFailed => "inspect failed",
            ProvisionState::Adopting => "adopting",
            ProvisionState::AdoptFailed => "adopt failed",
        }
    }

    /// Rest points of the lifecycle. No lease is held and no worker is
    /// driving the node while it sits in one of these.
    pub fn is_stable(&self) -> bool {
        matches!(
            self,
            ProvisionState::Enroll
                | ProvisionState::Manageable
                | ProvisionState::Available
                | ProvisionState::Active
                | ProvisionState::Error
                | ProvisionState::CleanFailed
                | ProvisionState::DeployFailed
                | ProvisionState::InspectFailed
                | ProvisionState::AdoptFailed
        )
    }

    /// States parked on an out-of-band completion callback.
    pub fn is_wait(&self) -> bool {
        matches!(self, ProvisionState::CleanWait | ProvisionState::DeployWait)
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ProvisionState::CleanFailed
                | ProvisionState::DeployFailed
                | ProvisionState::InspectFailed
                | ProvisionState::AdoptFailed
                | ProvisionState::Error
        )
    }

    /// Only `available` and `active` are ever exposed to the scheduler,
    /// and then only when the node is not in maintenance.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, ProvisionState::Available | ProvisionState::Active)
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verbs accepted by `set_provision_state`.
///
/// The wire names follow the external surface: `Deploy` travels as
/// `active` and `Teardown` as `deleted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    #[serde(rename = "manage")]
    Manage,
    #[serde(rename = "provide")]
    Provide,
    #[serde(rename = "active")]
    Deploy,
    #[serde(rename = "rebuild")]
    Rebuild,
    #[serde(rename = "deleted")]
    Teardown,
    #[serde(rename = "clean")]
    Clean,
    #[serde(rename = "inspect")]
    Inspect,
    #[serde(rename = "abort")]
    Abort,
    #[serde(rename = "adopt")]
    Adopt,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Manage => "manage",
            Verb::Provide => "provide",
            Verb::Deploy => "active",
            Verb::Rebuild => "rebuild",
            Verb::Teardown => "deleted",
            Verb::Clean => "clean",
            Verb::Inspect => "inspect",
            Verb::Abort => "abort",
            Verb::Adopt => "adopt",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "manage" => Ok(Verb::Manage),
            "provide" => Ok(Verb::Provide),
            "active" => Ok(Verb::Deploy),
            "rebuild" => Ok(Verb::Rebuild),
            "deleted" => Ok(Verb::Teardown),
            "clean" => Ok(Verb::Clean),
            "inspect" => Ok(Verb::Inspect),
            "abort" => Ok(Verb::Abort),
            "adopt" => Ok(Verb::Adopt),
            other => Err(Error::Validation(format!("unknown verb '{other}'"))),
        }
    }
}

/// Last observed power state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    #[serde(rename = "power on")]
    On,
    #[serde(rename = "power off")]
    Off,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "unknown")]
    Unknown,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::On => "power on",
            PowerState::Off => "power off",
            PowerState::Error => "error",
            PowerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Requested power change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerAction {
    #[serde(rename = "power on")]
    PowerOn,
    #[serde(rename = "power off")]
    PowerOff,
    #[serde(rename = "rebooting")]
    Reboot,
}

impl PowerAction {
    /// The power state the node should report once the action succeeds.
    pub fn target_state(&self) -> PowerState {
        match self {
            PowerAction::PowerOn | PowerAction::Reboot => PowerState::On,
            PowerAction::PowerOff => PowerState::Off,
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerAction::PowerOn => "power on",
            PowerAction::PowerOff => "power off",
            PowerAction::Reboot => "rebooting",
        };
        f.write_str(s)
    }
}

/// The capability slots a driver fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceKind {
    Power,
    Boot,
    Deploy,
    Management,
    Console,
    Raid,
    Inspect,
    Vendor,
}

impl InterfaceKind {
    pub const ALL: [InterfaceKind; 8] = [
        InterfaceKind::Power,
        InterfaceKind::Boot,
        InterfaceKind::Deploy,
        InterfaceKind::Management,
        InterfaceKind::Console,
        InterfaceKind::Raid,
        InterfaceKind::Inspect,
        InterfaceKind::Vendor,
    ];

    /// Interfaces a node must be able to validate before it can move
    /// toward `available`.
    pub const REQUIRED: [InterfaceKind; 4] = [
        InterfaceKind::Power,
        InterfaceKind::Boot,
        InterfaceKind::Deploy,
        InterfaceKind::Management,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::Power => "power",
            InterfaceKind::Boot => "boot",
            InterfaceKind::Deploy => "deploy",
            InterfaceKind::Management => "management",
            InterfaceKind::Console => "console",
            InterfaceKind::Raid => "raid",
            InterfaceKind::Inspect => "inspect",
            InterfaceKind::Vendor => "vendor",
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node choice of concrete implementation for each capability.
///
/// Hardware-type nodes carry one selection per capability (empty slots fall
/// back to the hardware type's default). Classic-driver nodes must keep
/// every slot `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSelection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub console: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inspect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

impl InterfaceSelection {
    pub fn get(&self, kind: InterfaceKind) -> Option<&str> {
        let slot = match kind {
            InterfaceKind::Power => &self.power,
            InterfaceKind::Boot => &self.boot,
            InterfaceKind::Deploy => &self.deploy,
            InterfaceKind::Management => &self.management,
            InterfaceKind::Console => &self.console,
            InterfaceKind::Raid => &self.raid,
            InterfaceKind::Inspect => &self.inspect,
            InterfaceKind::Vendor => &self.vendor,
        };
        slot.as_deref()
    }

    pub fn set(&mut self, kind: InterfaceKind, value: Option<String>) {
        let slot = match kind {
            InterfaceKind::Power => &mut self.power,
            InterfaceKind::Boot => &mut self.boot,
            InterfaceKind::Deploy => &mut self.deploy,
            InterfaceKind::Management => &mut self.management,
            InterfaceKind::Console => &mut self.console,
            InterfaceKind::Raid => &mut self.raid,
            InterfaceKind::Inspect => &mut self.inspect,
            InterfaceKind::Vendor => &mut self.vendor,
        };
        *slot = value;
    }

    pub fn clear(&mut self) {
        *self = InterfaceSelection::default();
    }

    pub fn is_empty(&self) -> bool {
        *self == InterfaceSelection::default()
    }
}

/// A managed physical machine record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub driver: String,
    #[serde(default)]
    pub interfaces: InterfaceSelection,
    #[serde(default)]
    pub driver_info: Map<String, Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub instance_info: Map<String, Value>,
    /// Conductor-owned scratch space, e.g. the remaining clean steps while
    /// a node is parked in `clean wait`.
    #[serde(default)]
    pub internal_info: Map<String, Value>,
    pub provision_state: ProvisionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_provision_state: Option<ProvisionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub power_state: PowerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_power_state: Option<PowerState>,
    #[serde(default)]
    pub maintenance: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maintenance_reason: Option<String>,
    pub provision_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    pub fn new(driver: impl Into<String>, initial_state: ProvisionState) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: None,
            driver: driver.into(),
            interfaces: InterfaceSelection::default(),
            driver_info: Map::new(),
            properties: Map::new(),
            instance_info: Map::new(),
            internal_info: Map::new(),
            provision_state: initial_state,
            target_provision_state: None,
            last_error: None,
            power_state: PowerState::Unknown,
            target_power_state: None,
            maintenance: false,
            maintenance_reason: None,
            provision_updated_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Whether the scheduler may pick this node up.
    pub fn is_schedulable(&self) -> bool {
        !self.maintenance && self.provision_state.is_schedulable()
    }

    /// Free-form capability tags from `properties.capabilities`.
    ///
    /// Tags are preserved verbatim; the only parsing is the syntactic
    /// `key:value` split. Both the mapping form and the comma separated
    /// `"key:value,key:value"` string form are accepted.
    pub fn capabilities(&self) -> Vec<(String, String)> {
        self.properties
            .get("capabilities")
            .map(parse_capabilities)
            .unwrap_or_default()
    }
}

/// Parse the free-form capability tags.
pub fn parse_capabilities(value: &Value) -> Vec<(String, String)> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect(),
        Value::String(s) => s
            .split(',')
            .filter_map(|pair| {
                let (k, v) = pair.split_once(':')?;
                let k = k.trim();
                let v = v.trim();
                if k.is_empty() || v.is_empty() {
                    None
                } else {
                    Some((k.to_string(), v.to_string()))
                }
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Partial administrative update to a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_info: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_info: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<InterfaceSelection>,
}

/// A network port attached to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: Uuid,
    pub node_id: Uuid,
    pub mac_address: String,
    pub created_at: DateTime<Utc>,
}

impl Port {
    pub fn new(node_id: Uuid, mac_address: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id,
            mac_address: mac_address.into(),
            created_at: Utc::now(),
        }
    }
}

/// Negotiated protocol version for the request surface.
///
/// Older negotiated versions disable newer behaviors entirely rather than
/// erroring: nodes enroll straight into `available` below
/// [`ApiVersion::ENROLL_STATE`], and interface selection fields are ignored
/// below [`ApiVersion::INTERFACE_SELECTION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiVersion(pub u32);

impl ApiVersion {
    pub const MIN: ApiVersion = ApiVersion(1);
    /// First version where newly created nodes start in `enroll`.
    pub const ENROLL_STATE: ApiVersion = ApiVersion(11);
    /// First version where per-capability interface selections exist.
    pub const INTERFACE_SELECTION: ApiVersion = ApiVersion(31);
    pub const CURRENT: ApiVersion = ApiVersion(31);

    pub fn supports(&self, feature: ApiVersion) -> bool {
        *self >= feature
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "1.{}", self.0)
    }
}

/// Check that a logical node name is hostname-legal.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::Validation(format!(
            "name '{name}' must be between 1 and 255 characters"
        )));
    }
    for label in name.split('.') {
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !ok {
            return Err(Error::Validation(format!(
                "name '{name}' is not a valid hostname"
            )));
        }
    }
    Ok(())
}

/// Normalize a MAC address to lowercase colon-separated form.
pub fn normalize_mac(mac: &str) -> Result<String> {
    let cleaned = mac.to_ascii_lowercase().replace('-', ":");
    let octets: Vec<&str> = cleaned.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(Error::Validation(format!(
            "'{mac}' is not a valid MAC address"
        )));
    }
    Ok(octets.join(":"))
}
