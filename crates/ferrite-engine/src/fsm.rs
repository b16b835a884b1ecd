//! Provision state machine
//!
//! The transition table is the single authority on which verbs are legal
//! in which states and where failures land. Verb transitions return the
//! state the node flips to immediately plus the target it should reach
//! once the asynchronous work completes; a `None` target means the flip is
//! the whole transition.

use ferrite_common::models::{ProvisionState, Verb};
use ferrite_common::Result;

/// Apply a verb to a state.
///
/// Returns `(next, target)`: the node moves to `next` right away and, when
/// `target` is set, a worker drives it toward `target` in the background.
pub fn verb_transition(
    state: ProvisionState,
    verb: Verb,
) -> Result<(ProvisionState, Option<ProvisionState>)> {
    use ProvisionState::*;

    let transition = match (state, verb) {
        // Enrollment and operator recovery both funnel through verification.
        (Enroll, Verb::Manage) => (Verifying, Some(Manageable)),
        (CleanFailed, Verb::Manage) => (Verifying, Some(Manageable)),
        (InspectFailed, Verb::Manage) => (Verifying, Some(Manageable)),
        (AdoptFailed, Verb::Manage) => (Verifying, Some(Manageable)),

        // Pull a node back out of the schedulable pool.
        (Available, Verb::Manage) => (Manageable, None),

        (Manageable, Verb::Provide) => (Cleaning, Some(Available)),
        (Manageable, Verb::Clean) => (Cleaning, Some(Manageable)),

        (Manageable, Verb::Inspect) => (Inspecting, Some(Manageable)),
        (InspectFailed, Verb::Inspect) => (Inspecting, Some(Manageable)),

        (Manageable, Verb::Adopt) => (Adopting, Some(Active)),
        (AdoptFailed, Verb::Adopt) => (Adopting, Some(Active)),

        (Available, Verb::Deploy) => (Deploying, Some(Active)),
        (DeployFailed, Verb::Deploy) => (Deploying, Some(Active)),
        (DeployFailed, Verb::Rebuild) => (Deploying, Some(Active)),
        (Active, Verb::Rebuild) => (Deploying, Some(Active)),
        (Error, Verb::Rebuild) => (Deploying, Some(Active)),

        (Active, Verb::Teardown) => (Deleting, Some(Available)),
        (DeployWait, Verb::Teardown) => (Deleting, Some(Available)),
        (DeployFailed, Verb::Teardown) => (Deleting, Some(Available)),
        (Error, Verb::Teardown) => (Deleting, Some(Available)),

        (CleanWait, Verb::Abort) => (CleanFailed, None),
        (DeployWait, Verb::Abort) => (DeployFailed, None),
        (Inspecting, Verb::Abort) => (InspectFailed, None),

        _ => return Err(ferrite_common::Error::InvalidState { verb, state }),
    };
    Ok(transition)
}

/// Where a failure in `state` lands the node.
pub fn fail_state(state: ProvisionState) -> ProvisionState {
    use ProvisionState::*;
    match state {
        Verifying => Enroll,
        Cleaning | CleanWait => CleanFailed,
        Deploying | DeployWait => DeployFailed,
        Inspecting => InspectFailed,
        Adopting => AdoptFailed,
        _ => Error,
    }
}

/// The parked state for work that continues out of band.
pub fn wait_state(state: ProvisionState) -> Option<ProvisionState> {
    match state {
        ProvisionState::Cleaning => Some(ProvisionState::CleanWait),
        ProvisionState::Deploying => Some(ProvisionState::DeployWait),
        _ => None,
    }
}

/// The active state a parked node resumes into.
pub fn resume_state(state: ProvisionState) -> Option<ProvisionState> {
    match state {
        ProvisionState::CleanWait => Some(ProvisionState::Cleaning),
        ProvisionState::DeployWait => Some(ProvisionState::Deploying),
        _ => None,
    }
}
