//! Conductor configuration
//!
//! Loaded from a TOML file with every field defaulted, so an empty file (or
//! no file at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Tunables for the task orchestrator and its driver calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Maximum number of node operations executing at once.
    pub workers: usize,

    /// Lease lifetime without a heartbeat before another conductor may
    /// take the node over.
    pub lease_ttl_secs: u64,

    /// How often a worker renews its lease while an operation runs.
    pub heartbeat_interval_secs: u64,

    /// Upper bound on a single call into a driver interface.
    pub driver_call_timeout_secs: u64,

    /// Attempts for transient driver failures (1 = no retry).
    pub max_retry_attempts: u32,

    /// First retry delay; later delays grow exponentially.
    pub retry_initial_backoff_ms: u64,

    /// Ceiling on the retry delay.
    pub retry_max_backoff_ms: u64,

    /// Interval of the periodic power state sync. 0 disables it.
    pub power_sync_interval_secs: u64,

    /// Interval of the stale-lease takeover scan. 0 disables it.
    pub takeover_interval_secs: u64,

    /// Run the cleaning step sequence between teardown/provide and
    /// `available`. Disabling it collapses cleaning to a no-op.
    pub automated_clean: bool,

    /// Driver and hardware type names to register at startup.
    pub enabled_drivers: Vec<String>,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            lease_ttl_secs: 60,
            heartbeat_interval_secs: 10,
            driver_call_timeout_secs: 60,
            max_retry_attempts: 3,
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 10_000,
            power_sync_interval_secs: 60,
            takeover_interval_secs: 30,
            automated_clean: true,
            enabled_drivers: vec!["fake-hardware".to_string()],
        }
    }
}

impl ConductorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Validation(format!("invalid configuration: {e}")))
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn driver_call_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_call_timeout_secs)
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }
}
