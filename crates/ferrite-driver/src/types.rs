//! Common types shared by the capability interfaces

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use ferrite_common::models::InterfaceKind;
use ferrite_common::{Error, Result};

/// Boot device selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    /// Boot from network (PXE)
    Pxe,
    /// Boot from local disk
    Disk,
    /// Boot from CD/DVD
    Cdrom,
    /// Boot into BIOS setup
    Bios,
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BootDevice::Pxe => "pxe",
            BootDevice::Disk => "disk",
            BootDevice::Cdrom => "cdrom",
            BootDevice::Bios => "bios",
        };
        f.write_str(s)
    }
}

/// Result of a driver action that may complete out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The work finished synchronously.
    Complete,
    /// The work continues out of band; a completion callback resumes it.
    Wait,
}

/// One named step of a cleaning sequence.
///
/// Steps run in descending priority order; priority 0 disables a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanStep {
    pub name: String,
    /// Which capability executes the step.
    pub interface: InterfaceKind,
    pub priority: u32,
}

impl CleanStep {
    pub fn new(name: impl Into<String>, interface: InterfaceKind, priority: u32) -> Self {
        Self {
            name: name.into(),
            interface,
            priority,
        }
    }
}

/// What hardware inspection discovered about a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectionReport {
    /// Hardware properties to merge into the node record.
    pub properties: Map<String, Value>,
    /// MAC addresses of discovered NICs; ports are created for them.
    pub mac_addresses: Vec<String>,
}

/// Scope a vendor passthru method is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthruScope {
    /// Addressed by node id; the handler receives the node's full context.
    Node,
    /// Addressed by driver name; no node involved.
    Driver,
}

/// HTTP-style verb a passthru method accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            other => Err(Error::Validation(format!("unknown HTTP method '{other}'"))),
        }
    }
}

/// Descriptor of one vendor passthru method.
#[derive(Debug, Clone)]
pub struct PassthruMethod {
    /// Dispatch name. Defaults to the handler's identifier but may be
    /// overridden at registration.
    pub name: String,
    pub description: String,
    /// Verbs the method accepts.
    pub http_methods: Vec<HttpMethod>,
    /// Asynchronous methods are handed to a worker and the caller polls;
    /// synchronous ones return their result inline. Slow or flaky
    /// hardware calls must not be registered synchronous.
    pub is_async: bool,
}

impl PassthruMethod {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            http_methods: vec![HttpMethod::Post],
            is_async: true,
        }
    }

    pub fn with_http_methods(mut self, methods: Vec<HttpMethod>) -> Self {
        self.http_methods = methods;
        self
    }

    /// Mark the method synchronous (result returned inline).
    pub fn synchronous(mut self) -> Self {
        self.is_async = false;
        self
    }

    pub fn allows(&self, verb: HttpMethod) -> bool {
        self.http_methods.contains(&verb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_device_display() {
        assert_eq!(BootDevice::Pxe.to_string(), "pxe");
        assert_eq!(BootDevice::Bios.to_string(), "bios");
    }

    #[test]
    fn test_http_method_parse() {
        assert_eq!("post".parse::<HttpMethod>().unwrap(), HttpMethod::Post);
        assert_eq!("GET".parse::<HttpMethod>().unwrap(), HttpMethod::Get);
        assert!("FETCH".parse::<HttpMethod>().is_err());
    }

    #[test]
    fn test_passthru_method_defaults() {
        let method = PassthruMethod::new("bios_settings", "Read BIOS settings");
        assert!(method.is_async);
        assert!(method.allows(HttpMethod::Post));
        assert!(!method.allows(HttpMethod::Get));

        let method = method
            .with_http_methods(vec![HttpMethod::Get])
            .synchronous();
        assert!(!method.is_async);
        assert!(method.allows(HttpMethod::Get));
    }

    #[test]
    fn test_clean_step_serde_round_trip() {
        let step = CleanStep::new("erase_devices", InterfaceKind::Deploy, 10);
        let json = serde_json::to_value(&step).unwrap();
        let back: CleanStep = serde_json::from_value(json).unwrap();
        assert_eq!(back, step);
    }
}
