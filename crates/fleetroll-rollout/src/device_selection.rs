//! Device selection reconciler: walks every fleet through its batches.
//!
//! One pass visits each fleet whose rollout policy has a device selection
//! strategy and a template version annotation. A fleet whose template version
//! changed starts over from the not-started position. It then moves forward
//! as far as its gates allow:
//!
//! 1. a batch whose devices don't target the new version yet waits for
//!    approval (manual, or automatic once the previous batch succeeded often
//!    enough); approved batches are announced to downstream controllers
//! 2. an incomplete batch stops the walk
//! 3. a complete batch records its success percentage and the fleet advances
//!
//! Errors of one fleet never stop the others; they are joined and logged once
//! per pass.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use fleetroll_state::{Fleet, NULL_ORG_ID, StateStore};

use crate::error::{ReconcileErrors, RolloutResult};
use crate::notifier::CallbackManager;
use crate::periodic::Reconciler;
use crate::selector::new_rollout_device_selector;
use crate::state::FLEET_ANNOTATION_TEMPLATE_VERSION;

/// Default period between two device selection passes.
pub const ROLLOUT_DEVICE_SELECTION_INTERVAL: Duration = Duration::from_secs(120);

pub struct DeviceSelectionReconciler {
    store: StateStore,
    org_id: String,
    callbacks: Arc<dyn CallbackManager>,
}

impl DeviceSelectionReconciler {
    pub fn new(store: StateStore, callbacks: Arc<dyn CallbackManager>) -> Self {
        Self {
            store,
            org_id: NULL_ORG_ID.to_string(),
            callbacks,
        }
    }

    /// Reconcile the fleets of another organization.
    pub fn with_org_id(mut self, org_id: &str) -> Self {
        self.org_id = org_id.to_string();
        self
    }

    /// Run one pass over every fleet with a device selection policy.
    pub fn reconcile(&self) -> Result<(), ReconcileErrors> {
        let fleets = match self.store.list_rollout_device_selection_fleets(&self.org_id) {
            Ok(fleets) => fleets,
            Err(e) => {
                error!(org_id = %self.org_id, error = %e, "failed to list rollout fleets");
                return Err(ReconcileErrors {
                    errors: vec![e.into()],
                });
            }
        };

        let mut errors = Vec::new();
        for fleet in &fleets {
            if let Err(e) = self.reconcile_fleet(fleet) {
                errors.push(e.for_fleet(fleet.name()));
            }
        }
        debug!(fleets = fleets.len(), failed = errors.len(), "device selection pass finished");

        let result = ReconcileErrors::check(errors);
        if let Err(e) = &result {
            error!(error = %e, "device selection reconciliation errors");
        }
        result
    }

    fn reconcile_fleet(&self, fleet: &Fleet) -> RolloutResult<()> {
        let Some(strategy) = fleet
            .spec
            .rollout_policy
            .as_ref()
            .and_then(|p| p.device_selection.as_ref())
        else {
            return Ok(());
        };
        let Some(template_version) = fleet.annotation(FLEET_ANNOTATION_TEMPLATE_VERSION) else {
            return Ok(());
        };

        let selector = new_rollout_device_selector(
            strategy,
            self.store.clone(),
            &self.org_id,
            fleet,
            template_version,
        );
        if selector.is_rollout_new() {
            selector.on_new_rollout()?;
            selector.reset()?;
        }

        let mut selection = selector.current_selection()?;
        loop {
            if !selection.is_rolled_out()? {
                if !selection.is_approved() {
                    if !selection.may_approve_automatically()? {
                        debug!(fleet = %fleet.name(), "batch waiting for approval");
                        break;
                    }
                    selection.approve()?;
                    info!(fleet = %fleet.name(), "batch approved automatically");
                }
                self.callbacks
                    .fleet_rollout_selection_updated(&self.org_id, fleet);
            }
            if !selection.is_complete()? {
                break;
            }
            selection.set_success_percentage()?;
            if !selector.has_more_selections()? {
                break;
            }
            selector.advance()?;
            selection = selector.current_selection()?;
        }
        Ok(())
    }
}

impl Reconciler for DeviceSelectionReconciler {
    fn name(&self) -> &str {
        "device-selection"
    }

    fn reconcile(&self) -> Result<(), ReconcileErrors> {
        DeviceSelectionReconciler::reconcile(self)
    }
}
