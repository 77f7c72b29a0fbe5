//! Device selection strategy traits.
//!
//! A [`RolloutDeviceSelector`] walks one fleet through the steps of its
//! strategy; a [`Selection`] is bound to the step the fleet is currently on.
//! Both are rebuilt from the store on every reconciliation pass.

use fleetroll_state::{Device, DeviceSelectionStrategy, Fleet, StateStore};

use crate::batch_sequence::BatchSequenceSelector;
use crate::error::RolloutResult;

/// Walks a fleet through the ordered steps of a rollout.
pub trait RolloutDeviceSelector {
    /// Whether the fleet's template version differs from the one being deployed.
    fn is_rollout_new(&self) -> bool;

    /// Record the fleet's template version as the one being deployed.
    fn on_new_rollout(&self) -> RolloutResult<()>;

    /// Whether [`advance`](Self::advance) may still move to another step.
    fn has_more_selections(&self) -> RolloutResult<bool>;

    /// The step the fleet is currently on.
    fn current_selection(&self) -> RolloutResult<Box<dyn Selection>>;

    /// Leave the current step and select the devices of the next one.
    fn advance(&self) -> RolloutResult<()>;

    /// Return to the not-started position with manual approval.
    fn reset(&self) -> RolloutResult<()>;

    /// Clear the rollout flag on every device of the fleet.
    fn unmark_rollout_selection(&self) -> RolloutResult<()>;
}

/// The devices of one rollout step and its approval and completion gates.
pub trait Selection {
    /// Fleet devices currently selected for rollout.
    fn devices(&self) -> RolloutResult<Vec<Device>>;

    fn is_approved(&self) -> bool;

    fn approve(&self) -> RolloutResult<()>;

    /// True once every selected device targets the deploying template version.
    fn is_rolled_out(&self) -> RolloutResult<bool>;

    /// True when approval is automatic and the previous step succeeded often
    /// enough.
    fn may_approve_automatically(&self) -> RolloutResult<bool>;

    /// True when every relevant selected device reached a terminal state.
    fn is_complete(&self) -> RolloutResult<bool>;

    /// Persist the success percentage of this step.
    fn set_success_percentage(&self) -> RolloutResult<()>;
}

/// Build the selector for a fleet's device selection strategy.
pub fn new_rollout_device_selector(
    strategy: &DeviceSelectionStrategy,
    store: StateStore,
    org_id: &str,
    fleet: &Fleet,
    template_version: &str,
) -> Box<dyn RolloutDeviceSelector> {
    match strategy {
        DeviceSelectionStrategy::BatchSequence(sequence) => Box::new(BatchSequenceSelector::new(
            sequence.clone(),
            store,
            org_id,
            fleet,
            template_version,
        )),
    }
}
