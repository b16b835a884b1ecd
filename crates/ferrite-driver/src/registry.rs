//! Driver composition and lookup
//!
//! The registry is built once at startup from the enabled-driver
//! configuration and is read-only afterwards. Interface resolution happens
//! when a node is bound, not per call.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use ferrite_common::models::{InterfaceKind, InterfaceSelection, Node};
use ferrite_common::{Error, Result};

use crate::fake;
use crate::traits::{
    BootInterface, ConsoleInterface, DeployInterface, InspectInterface, ManagementInterface,
    PowerInterface, RaidInterface, VendorInterface,
};

/// One capability slot of a hardware type: named implementations plus the
/// default (the first one registered).
struct Slot<T: ?Sized> {
    impls: HashMap<String, Arc<T>>,
    default: Option<String>,
}

impl<T: ?Sized> Slot<T> {
    fn new() -> Self {
        Self {
            impls: HashMap::new(),
            default: None,
        }
    }

    fn register(&mut self, name: &str, implementation: Arc<T>) {
        if self.default.is_none() {
            self.default = Some(name.to_string());
        }
        self.impls.insert(name.to_string(), implementation);
    }

    /// Resolve a node's selection (or the default) to an implementation.
    /// An explicit selection that names nothing registered is an error;
    /// an empty slot resolves to `None`.
    fn resolve(
        &self,
        selected: Option<&str>,
        kind: InterfaceKind,
        hardware_type: &str,
    ) -> Result<Option<Arc<T>>> {
        let name = match selected.or(self.default.as_deref()) {
            Some(name) => name,
            None => return Ok(None),
        };
        match self.impls.get(name) {
            Some(implementation) => Ok(Some(Arc::clone(implementation))),
            None => Err(Error::Validation(format!(
                "hardware type {hardware_type} has no {kind} implementation '{name}'"
            ))),
        }
    }
}

/// A composable driver: interchangeable implementations per capability.
pub struct HardwareType {
    name: String,
    power: Slot<dyn PowerInterface>,
    boot: Slot<dyn BootInterface>,
    deploy: Slot<dyn DeployInterface>,
    management: Slot<dyn ManagementInterface>,
    console: Slot<dyn ConsoleInterface>,
    raid: Slot<dyn RaidInterface>,
    inspect: Slot<dyn InspectInterface>,
    vendor: Slot<dyn VendorInterface>,
}

impl HardwareType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            power: Slot::new(),
            boot: Slot::new(),
            deploy: Slot::new(),
            management: Slot::new(),
            console: Slot::new(),
            raid: Slot::new(),
            inspect: Slot::new(),
            vendor: Slot::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_power(mut self, name: &str, i: Arc<dyn PowerInterface>) -> Self {
        self.power.register(name, i);
        self
    }

    pub fn with_boot(mut self, name: &str, i: Arc<dyn BootInterface>) -> Self {
        self.boot.register(name, i);
        self
    }

    pub fn with_deploy(mut self, name: &str, i: Arc<dyn DeployInterface>) -> Self {
        self.deploy.register(name, i);
        self
    }

    pub fn with_management(mut self, name: &str, i: Arc<dyn ManagementInterface>) -> Self {
        self.management.register(name, i);
        self
    }

    pub fn with_console(mut self, name: &str, i: Arc<dyn ConsoleInterface>) -> Self {
        self.console.register(name, i);
        self
    }

    pub fn with_raid(mut self, name: &str, i: Arc<dyn RaidInterface>) -> Self {
        self.raid.register(name, i);
        self
    }

    pub fn with_inspect(mut self, name: &str, i: Arc<dyn InspectInterface>) -> Self {
        self.inspect.register(name, i);
        self
    }

    pub fn with_vendor(mut self, name: &str, i: Arc<dyn VendorInterface>) -> Self {
        self.vendor.register(name, i);
        self
    }

    /// Does the slot for `kind` know an implementation called `name`?
    pub fn has_implementation(&self, kind: InterfaceKind, name: &str) -> bool {
        match kind {
            InterfaceKind::Power => self.power.impls.contains_key(name),
            InterfaceKind::Boot => self.boot.impls.contains_key(name),
            InterfaceKind::Deploy => self.deploy.impls.contains_key(name),
            InterfaceKind::Management => self.management.impls.contains_key(name),
            InterfaceKind::Console => self.console.impls.contains_key(name),
            InterfaceKind::Raid => self.raid.impls.contains_key(name),
            InterfaceKind::Inspect => self.inspect.impls.contains_key(name),
            InterfaceKind::Vendor => self.vendor.impls.contains_key(name),
        }
    }

    fn bind(&self, selection: &InterfaceSelection) -> Result<BoundDriver> {
        Ok(BoundDriver {
            driver: self.name.clone(),
            power: required(
                &self.name,
                InterfaceKind::Power,
                self.power.resolve(
                    selection.get(InterfaceKind::Power),
                    InterfaceKind::Power,
                    &self.name,
                )?,
            )?,
            boot: required(
                &self.name,
                InterfaceKind::Boot,
                self.boot.resolve(
                    selection.get(InterfaceKind::Boot),
                    InterfaceKind::Boot,
                    &self.name,
                )?,
            )?,
            deploy: required(
                &self.name,
                InterfaceKind::Deploy,
                self.deploy.resolve(
                    selection.get(InterfaceKind::Deploy),
                    InterfaceKind::Deploy,
                    &self.name,
                )?,
            )?,
            management: required(
                &self.name,
                InterfaceKind::Management,
                self.management.resolve(
                    selection.get(InterfaceKind::Management),
                    InterfaceKind::Management,
                    &self.name,
                )?,
            )?,
            console: self.console.resolve(
                selection.get(InterfaceKind::Console),
                InterfaceKind::Console,
                &self.name,
            )?,
            raid: self.raid.resolve(
                selection.get(InterfaceKind::Raid),
                InterfaceKind::Raid,
                &self.name,
            )?,
            inspect: self.inspect.resolve(
                selection.get(InterfaceKind::Inspect),
                InterfaceKind::Inspect,
                &self.name,
            )?,
            vendor: self.vendor.resolve(
                selection.get(InterfaceKind::Vendor),
                InterfaceKind::Vendor,
                &self.name,
            )?,
        })
    }
}

/// A required capability slot resolved to nothing is a configuration error.
fn required<T: ?Sized>(
    hardware_type: &str,
    kind: InterfaceKind,
    value: Option<Arc<T>>,
) -> Result<Arc<T>> {
    value.ok_or_else(|| {
        Error::Validation(format!(
            "hardware type {hardware_type} has no {kind} implementation"
        ))
    })
}

/// A fixed-composition driver. Nodes using one carry no interface
/// selections.
pub struct ClassicDriver {
    pub name: String,
    pub power: Arc<dyn PowerInterface>,
    pub boot: Arc<dyn BootInterface>,
    pub deploy: Arc<dyn DeployInterface>,
    pub management: Arc<dyn ManagementInterface>,
    pub console: Option<Arc<dyn ConsoleInterface>>,
    pub raid: Option<Arc<dyn RaidInterface>>,
    pub inspect: Option<Arc<dyn InspectInterface>>,
    pub vendor: Option<Arc<dyn VendorInterface>>,
}

impl ClassicDriver {
    fn bind(&self) -> BoundDriver {
        BoundDriver {
            driver: self.name.clone(),
            power: Arc::clone(&self.power),
            boot: Arc::clone(&self.boot),
            deploy: Arc::clone(&self.deploy),
            management: Arc::clone(&self.management),
            console: self.console.clone(),
            raid: self.raid.clone(),
            inspect: self.inspect.clone(),
            vendor: self.vendor.clone(),
        }
    }
}

/// The concrete interface set resolved for one node.
///
/// Power, boot, deploy and management are required capabilities; the rest
/// may be absent, which validation reports as "unsupported".
#[derive(Clone)]
pub struct BoundDriver {
    pub driver: String,
    pub power: Arc<dyn PowerInterface>,
    pub boot: Arc<dyn BootInterface>,
    pub deploy: Arc<dyn DeployInterface>,
    pub management: Arc<dyn ManagementInterface>,
    pub console: Option<Arc<dyn ConsoleInterface>>,
    pub raid: Option<Arc<dyn RaidInterface>>,
    pub inspect: Option<Arc<dyn InspectInterface>>,
    pub vendor: Option<Arc<dyn VendorInterface>>,
}

/// Name to driver composition lookup.
pub struct DriverRegistry {
    hardware_types: HashMap<String, Arc<HardwareType>>,
    classic: HashMap<String, Arc<ClassicDriver>>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            hardware_types: HashMap::new(),
            classic: HashMap::new(),
        }
    }

    pub fn register_hardware_type(&mut self, hardware_type: HardwareType) {
        debug!(driver = %hardware_type.name, "registered hardware type");
        self.hardware_types
            .insert(hardware_type.name.clone(), Arc::new(hardware_type));
    }

    pub fn register_classic(&mut self, driver: ClassicDriver) {
        debug!(driver = %driver.name, "registered classic driver");
        self.classic.insert(driver.name.clone(), Arc::new(driver));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hardware_types.contains_key(name) || self.classic.contains_key(name)
    }

    /// Classic drivers have fixed interfaces; their nodes must keep all
    /// interface selections unset.
    pub fn is_classic(&self, name: &str) -> bool {
        self.classic.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .hardware_types
            .keys()
            .chain(self.classic.keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Resolve the concrete interface set for a node.
    pub fn resolve(&self, node: &Node) -> Result<BoundDriver> {
        if let Some(hardware_type) = self.hardware_types.get(&node.driver) {
            return hardware_type.bind(&node.interfaces);
        }
        if let Some(classic) = self.classic.get(&node.driver) {
            return Ok(classic.bind());
        }
        Err(Error::driver_not_found(&node.driver))
    }

    /// The vendor interface for driver-scoped passthru calls (the
    /// hardware type's default implementation, or the classic bundle's).
    pub fn vendor(&self, driver: &str) -> Result<Arc<dyn VendorInterface>> {
        let vendor = if let Some(hardware_type) = self.hardware_types.get(driver) {
            hardware_type.vendor.resolve(None, InterfaceKind::Vendor, driver)?
        } else if let Some(classic) = self.classic.get(driver) {
            classic.vendor.clone()
        } else {
            return Err(Error::driver_not_found(driver));
        };
        vendor.ok_or_else(|| Error::NotFound(format!("vendor interface for driver {driver}")))
    }

    /// Check that every implementation a selection names exists for the
    /// given hardware type.
    pub fn validate_selection(&self, driver: &str, selection: &InterfaceSelection) -> Result<()> {
        let hardware_type = self
            .hardware_types
            .get(driver)
            .ok_or_else(|| Error::driver_not_found(driver))?;
        for kind in InterfaceKind::ALL {
            if let Some(name) = selection.get(kind) {
                if !hardware_type.has_implementation(kind, name) {
                    return Err(Error::Validation(format!(
                        "hardware type {driver} has no {kind} implementation '{name}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Build a registry from the enabled-driver names in the configuration.
///
/// Concrete hardware drivers are plugged in externally; this in-tree build
/// knows the fake compositions used for development and testing.
pub fn build_enabled(names: &[String]) -> Result<Arc<DriverRegistry>> {
    let mut registry = DriverRegistry::new();
    let state = fake::FakeHardware::shared();
    for name in names {
        match name.as_str() {
            "fake-hardware" => registry.register_hardware_type(fake::fake_hardware_type(&state)),
            "fake" => registry.register_classic(fake::fake_classic_driver(&state)),
            other => return Err(Error::driver_not_found(other)),
        }
    }
    Ok(Arc::new(registry))
}
