//! Cleaning step collection and ordering
//!
//! Steps are gathered from every step-providing interface of the node's
//! driver, then run in descending priority order. A priority of 0 disables
//! a step entirely.

use ferrite_common::models::{InterfaceKind, Node};
use ferrite_driver::{BoundDriver, CleanStep, DriverError, DriverResult, StepOutcome};

/// All enabled clean steps for a driver, highest priority first.
pub fn collect_clean_steps(driver: &BoundDriver) -> Vec<CleanStep> {
    let mut steps = driver.deploy.clean_steps();
    steps.extend(driver.management.clean_steps());
    if let Some(raid) = &driver.raid {
        steps.extend(raid.clean_steps());
    }
    steps.retain(|s| s.priority > 0);
    steps.sort_by(|a, b| b.priority.cmp(&a.priority));
    steps
}

/// Run one step on the interface that owns it.
pub async fn execute_step(
    driver: &BoundDriver,
    node: &Node,
    step: &CleanStep,
) -> DriverResult<StepOutcome> {
    match step.interface {
        InterfaceKind::Deploy => driver.deploy.execute_clean_step(node, step).await,
        InterfaceKind::Management => driver.management.execute_clean_step(node, step).await,
        InterfaceKind::Raid => match &driver.raid {
            Some(raid) => raid.execute_clean_step(node, step).await,
            None => Err(DriverError::Unsupported(
                "driver has no raid interface".to_string(),
            )),
        },
        other => Err(DriverError::Unsupported(format!(
            "{other} interface does not provide clean steps"
        ))),
    }
}
