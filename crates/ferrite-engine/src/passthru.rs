//! Vendor passthru dispatch
//!
//! Routes driver-defined custom operations to the owning vendor interface.
//! Dispatch resolves (scope, method name, verb) and always runs the
//! handler's own parameter validation before any hardware action.
//! Synchronous methods return their result inline; asynchronous ones are
//! handed to a worker (under the node's lease for node-scoped calls) and
//! the caller polls the node for failures.

use serde_json::Value;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use ferrite_common::{Error, Result};
use ferrite_driver::{HttpMethod, PassthruMethod, PassthruScope};

use crate::conductor::Conductor;

/// Outcome of a dispatched passthru call.
#[derive(Debug, Clone, PartialEq)]
pub enum PassthruOutcome {
    /// Synchronous method; the handler's result.
    Complete(Value),
    /// Asynchronous method; poll the node's `last_error` for failures.
    Accepted,
}

fn find_method<'a>(
    methods: &'a [PassthruMethod],
    name: &str,
    verb: HttpMethod,
) -> Result<&'a PassthruMethod> {
    let method = methods
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| Error::NotFound(format!("passthru method {name}")))?;
    if !method.allows(verb) {
        return Err(Error::MethodNotAllowed {
            method: name.to_string(),
            verb: verb.to_string(),
        });
    }
    Ok(method)
}

impl Conductor {
    /// Dispatch a node-scoped vendor passthru call.
    pub async fn node_vendor_passthru(
        self: &Arc<Self>,
        node_id: Uuid,
        method: &str,
        verb: HttpMethod,
        params: Value,
    ) -> Result<PassthruOutcome> {
        let node = self
            .store()
            .get_node(node_id)
            .await?
            .ok_or_else(|| Error::node_not_found(&node_id.to_string()))?;
        let driver = self.registry().resolve(&node)?;
        let vendor = driver
            .vendor
            .clone()
            .ok_or_else(|| Error::NotFound(format!("vendor interface for driver {}", node.driver)))?;

        let methods = vendor.methods(PassthruScope::Node);
        let descriptor = find_method(&methods, method, verb)?;

        // parameter problems surface before any hardware action
        vendor
            .validate_passthru(Some(&node), method, &params)
            .await
            .map_err(Error::from)?;

        if descriptor.is_async {
            self.leases().acquire(node_id, self.host())?;
            self.spawn_node_passthru(node_id, method.to_string(), params);
            Ok(PassthruOutcome::Accepted)
        } else {
            let result = vendor
                .invoke(Some(&node), method, &params)
                .await
                .map_err(Error::from)?;
            Ok(PassthruOutcome::Complete(result))
        }
    }

    /// Dispatch a driver-scoped vendor passthru call. No node is involved
    /// and no lease is taken.
    pub async fn driver_vendor_passthru(
        self: &Arc<Self>,
        driver: &str,
        method: &str,
        verb: HttpMethod,
        params: Value,
    ) -> Result<PassthruOutcome> {
        let vendor = self.registry().vendor(driver)?;
        let methods = vendor.methods(PassthruScope::Driver);
        let descriptor = find_method(&methods, method, verb)?;

        vendor
            .validate_passthru(None, method, &params)
            .await
            .map_err(Error::from)?;

        if descriptor.is_async {
            let method = method.to_string();
            let driver = driver.to_string();
            let policy = self.retry_policy().clone();
            tokio::spawn(async move {
                let invoked = crate::retry::call_driver(&policy, &format!("vendor.{method}"), || {
                    vendor.invoke(None, &method, &params)
                })
                .await;
                if let Err(err) = invoked {
                    error!(driver = %driver, method = %method, error = %err, "driver passthru failed");
                }
            });
            Ok(PassthruOutcome::Accepted)
        } else {
            let result = vendor
                .invoke(None, method, &params)
                .await
                .map_err(Error::from)?;
            Ok(PassthruOutcome::Complete(result))
        }
    }
}
