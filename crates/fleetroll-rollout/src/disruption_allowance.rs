//! Disruption allowance reconciler: caps concurrent device updates.
//!
//! Online devices of a fleet are grouped by the values of the allowance's
//! `group_by` label keys. A device is busy while its rendered version
//! annotation differs from the version its agent applied. Per group, the
//! number of devices that may start rendering now is
//! `min(max_unavailable - busy, available - min_available)` over whichever
//! bounds are configured; that many devices that target the fleet's template
//! version but haven't rendered it yet are told their source changed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use fleetroll_state::{
    DEVICE_ANNOTATION_RENDERED_TEMPLATE_VERSION, DEVICE_ANNOTATION_TEMPLATE_VERSION,
    DevicePredicate, DisruptionAllowance, Fleet, LabelGroup, ListParams, MatchExpression,
    MatchOperator, NULL_ORG_ID, StateStore,
};

use crate::error::{ReconcileErrors, RolloutError, RolloutResult};
use crate::notifier::CallbackManager;
use crate::periodic::Reconciler;
use crate::state::FLEET_ANNOTATION_TEMPLATE_VERSION;

/// Default period between two disruption allowance passes.
pub const DISRUPTION_ALLOWANCE_INTERVAL: Duration = Duration::from_secs(120);

/// Online and busy device counts of one label group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCounts {
    pub group: LabelGroup,
    pub total: i64,
    pub busy: i64,
}

impl GroupCounts {
    pub fn available(&self) -> i64 {
        self.total - self.busy
    }
}

/// Join total and busy counts per group. Groups absent from `busy` have no
/// busy devices.
pub fn merge_group_counts(
    total: BTreeMap<LabelGroup, i64>,
    busy: &BTreeMap<LabelGroup, i64>,
) -> Vec<GroupCounts> {
    total
        .into_iter()
        .map(|(group, total)| {
            let busy = busy.get(&group).copied().unwrap_or(0);
            GroupCounts { group, total, busy }
        })
        .collect()
}

/// Devices of the group that may start rendering now. Zero or negative means
/// none.
pub fn num_to_render(allowance: &DisruptionAllowance, counts: &GroupCounts) -> RolloutResult<i64> {
    let bounds = [
        allowance.max_unavailable.map(|max| max - counts.busy),
        allowance.min_available.map(|min| counts.available() - min),
    ];
    bounds.into_iter().flatten().min().ok_or_else(|| {
        RolloutError::InvalidDisruptionAllowance(
            "neither max_unavailable nor min_available is set".to_string(),
        )
    })
}

pub struct DisruptionAllowanceReconciler {
    store: StateStore,
    org_id: String,
    callbacks: Arc<dyn CallbackManager>,
}

impl DisruptionAllowanceReconciler {
    pub fn new(store: StateStore, callbacks: Arc<dyn CallbackManager>) -> Self {
        Self {
            store,
            org_id: NULL_ORG_ID.to_string(),
            callbacks,
        }
    }

    pub fn with_org_id(mut self, org_id: &str) -> Self {
        self.org_id = org_id.to_string();
        self
    }

    /// Run one pass over every fleet with a disruption allowance.
    pub fn reconcile(&self) -> Result<(), ReconcileErrors> {
        let fleets = match self.store.list_disruption_allowance_fleets(&self.org_id) {
            Ok(fleets) => fleets,
            Err(e) => {
                error!(org_id = %self.org_id, error = %e, "failed to list disruption allowance fleets");
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

        let result = ReconcileErrors::check(errors);
        if let Err(e) = &result {
            error!(error = %e, "failed reconciling disruption allowance");
        }
        result
    }

    fn reconcile_fleet(&self, fleet: &Fleet) -> RolloutResult<()> {
        let Some(allowance) = fleet
            .spec
            .rollout_policy
            .as_ref()
            .and_then(|p| p.disruption_allowance.as_ref())
        else {
            return Ok(());
        };
        let Some(template_version) = fleet.annotation(FLEET_ANNOTATION_TEMPLATE_VERSION) else {
            return Ok(());
        };
        if allowance.max_unavailable.is_none() && allowance.min_available.is_none() {
            return Err(RolloutError::InvalidDisruptionAllowance(
                "neither max_unavailable nor min_available is set".to_string(),
            ));
        }

        for counts in self.fleet_counts(fleet, &allowance.group_by)? {
            let n = num_to_render(allowance, &counts)?;
            debug!(
                fleet = %fleet.name(),
                group = ?counts.group,
                total = counts.total,
                busy = counts.busy,
                num_to_render = n,
                "disruption allowance"
            );
            if n > 0 {
                self.render_group_devices(fleet, template_version, &counts.group, n as usize)?;
            }
        }
        Ok(())
    }

    fn fleet_counts(&self, fleet: &Fleet, group_by: &[String]) -> RolloutResult<Vec<GroupCounts>> {
        let params = ListParams::owned_by_fleet(fleet.name());
        let total = self.store.count_devices_by_labels(
            &self.org_id,
            &params,
            group_by,
            &[DevicePredicate::Online],
        )?;
        let busy = self.store.count_devices_by_labels(
            &self.org_id,
            &params,
            group_by,
            &[DevicePredicate::RenderedVersionMismatch, DevicePredicate::Online],
        )?;
        Ok(merge_group_counts(total, &busy))
    }

    /// Notify up to `limit` devices of the group that target the template
    /// version but haven't rendered it yet.
    fn render_group_devices(
        &self,
        fleet: &Fleet,
        template_version: &str,
        group: &LabelGroup,
        limit: usize,
    ) -> RolloutResult<()> {
        let params = ListParams {
            label_match_expressions: group_match_expressions(group),
            annotation_match_expressions: vec![
                MatchExpression::new(
                    DEVICE_ANNOTATION_TEMPLATE_VERSION,
                    MatchOperator::In,
                    &[template_version],
                ),
                MatchExpression::new(
                    DEVICE_ANNOTATION_RENDERED_TEMPLATE_VERSION,
                    MatchOperator::NotIn,
                    &[template_version],
                ),
            ],
            limit: Some(limit),
            ..ListParams::owned_by_fleet(fleet.name())
        };
        let devices = self.store.list_devices(&self.org_id, &params)?;
        if !devices.is_empty() {
            info!(fleet = %fleet.name(), group = ?group, count = devices.len(), "devices released for rendering");
        }
        for device in &devices {
            self.callbacks
                .device_source_updated(&self.org_id, device.name());
        }
        Ok(())
    }
}

/// A missing group value selects devices that don't carry the label.
fn group_match_expressions(group: &LabelGroup) -> Vec<MatchExpression> {
    group
        .iter()
        .map(|(key, value)| match value {
            Some(v) => MatchExpression::new(key, MatchOperator::In, &[v.as_str()]),
            None => MatchExpression::new(key, MatchOperator::DoesNotExist, &[]),
        })
        .collect()
}

impl Reconciler for DisruptionAllowanceReconciler {
    fn name(&self) -> &str {
        "disruption-allowance"
    }

    fn reconcile(&self) -> Result<(), ReconcileErrors> {
        DisruptionAllowanceReconciler::reconcile(self)
    }
}
