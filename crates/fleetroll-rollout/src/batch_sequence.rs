//! Batch sequence strategy.
//!
//! The fleet walks an ordered list of batches. The batch index lives in the
//! `batchNumber` fleet annotation: `-1` before the first batch, `len` once
//! every batch was processed. Entering a batch flags up to its limit of
//! not-yet-rolled-out devices matching its selector as selected for rollout;
//! leaving it clears every flag of the fleet.

use fleetroll_state::{
    Batch, BatchLimit, BatchSequence, CompletionCount, DEVICE_ANNOTATION_TEMPLATE_VERSION,
    Device, DeviceSummaryStatus, Fleet, ListParams, MatchExpression, MatchOperator, Percentage,
    StateStore, UpdatingReason,
};
use tracing::{debug, info};

use crate::error::{RolloutError, RolloutResult};
use crate::selector::{RolloutDeviceSelector, Selection};
use crate::state::{
    ApprovalMethod, BATCH_NOT_STARTED, FLEET_ANNOTATION_DEPLOYING_TEMPLATE_VERSION, RolloutState,
    RolloutStateStore, RolloutUpdate,
};

/// Success percentage a batch must reach for the next one to be approved
/// automatically, when neither the batch nor the fleet configures one.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 90;

pub struct BatchSequenceSelector {
    sequence: Vec<Batch>,
    store: StateStore,
    org_id: String,
    fleet: Fleet,
    template_version: String,
}

impl BatchSequenceSelector {
    pub fn new(
        sequence: BatchSequence,
        store: StateStore,
        org_id: &str,
        fleet: &Fleet,
        template_version: &str,
    ) -> Self {
        Self {
            sequence: sequence.sequence,
            store,
            org_id: org_id.to_string(),
            fleet: fleet.clone(),
            template_version: template_version.to_string(),
        }
    }

    fn len(&self) -> i64 {
        self.sequence.len() as i64
    }

    fn fleet_name(&self) -> &str {
        self.fleet.name()
    }

    fn state(&self) -> RolloutResult<RolloutState> {
        self.store.rollout_state(&self.org_id, self.fleet_name())
    }

    fn update(&self, updates: &[RolloutUpdate]) -> RolloutResult<()> {
        self.store
            .update_rollout_state(&self.org_id, self.fleet_name(), updates)
    }

    /// Selection bound to `batch_number`; out-of-range numbers that are still
    /// valid positions (`-1` and `len`) get an empty batch.
    fn selection_at(&self, batch_number: i64) -> RolloutResult<BatchSelection> {
        if batch_number < BATCH_NOT_STARTED || batch_number > self.len() {
            return Err(RolloutError::BatchOutOfBounds(batch_number));
        }
        let state = self.state()?;
        let batch = usize::try_from(batch_number)
            .ok()
            .and_then(|i| self.sequence.get(i))
            .cloned();
        Ok(BatchSelection {
            batch,
            batch_number,
            store: self.store.clone(),
            org_id: self.org_id.clone(),
            fleet_name: self.fleet_name().to_string(),
            template_version: self.template_version.clone(),
            fleet_success_threshold: self
                .fleet
                .spec
                .rollout_policy
                .as_ref()
                .and_then(|p| p.success_threshold),
            state,
        })
    }
}

impl RolloutDeviceSelector for BatchSequenceSelector {
    fn is_rollout_new(&self) -> bool {
        self.fleet.annotation(FLEET_ANNOTATION_DEPLOYING_TEMPLATE_VERSION)
            != Some(self.template_version.as_str())
    }

    fn on_new_rollout(&self) -> RolloutResult<()> {
        info!(
            fleet = %self.fleet_name(),
            template_version = %self.template_version,
            "new rollout"
        );
        self.update(&[RolloutUpdate::DeployingTemplateVersion(
            self.template_version.clone(),
        )])
    }

    fn has_more_selections(&self) -> RolloutResult<bool> {
        Ok(self.state()?.batch_number < self.len())
    }

    fn current_selection(&self) -> RolloutResult<Box<dyn Selection>> {
        let batch_number = self.state()?.batch_number;
        Ok(Box::new(self.selection_at(batch_number)?))
    }

    fn advance(&self) -> RolloutResult<()> {
        let current = self.state()?.batch_number;
        self.selection_at(current)?.unmark()?;

        let next = current + 1;
        if next > self.len() {
            return Err(RolloutError::BatchOverflow {
                next,
                len: self.len(),
            });
        }
        let selection = self.selection_at(next)?;
        self.update(&[RolloutUpdate::BatchNumber(next)])?;
        let marked = selection.mark()?;
        self.update(&[RolloutUpdate::Approved(false)])?;

        info!(fleet = %self.fleet_name(), batch = next, marked, "advanced to next batch");
        Ok(())
    }

    fn reset(&self) -> RolloutResult<()> {
        self.unmark_rollout_selection()?;
        self.update(&[
            RolloutUpdate::ApprovalMethod(ApprovalMethod::Manual),
            RolloutUpdate::Approved(false),
            RolloutUpdate::BatchNumber(BATCH_NOT_STARTED),
        ])?;
        debug!(fleet = %self.fleet_name(), "rollout reset");
        Ok(())
    }

    fn unmark_rollout_selection(&self) -> RolloutResult<()> {
        self.store
            .unmark_rollout_selection(&self.org_id, self.fleet_name())?;
        Ok(())
    }
}

/// The devices of one batch. `batch` is `None` before the first batch and
/// after the last one.
pub struct BatchSelection {
    batch: Option<Batch>,
    batch_number: i64,
    store: StateStore,
    org_id: String,
    fleet_name: String,
    template_version: String,
    fleet_success_threshold: Option<Percentage>,
    /// Rollout state as it was when the selection was built.
    state: RolloutState,
}

impl BatchSelection {
    pub fn batch_number(&self) -> i64 {
        self.batch_number
    }

    pub fn batch(&self) -> Option<&Batch> {
        self.batch.as_ref()
    }

    fn owned(&self) -> ListParams {
        ListParams::owned_by_fleet(&self.fleet_name)
    }

    /// Fleet devices matching the batch selector.
    fn batch_params(&self) -> ListParams {
        match self.batch.as_ref().and_then(|b| b.selector.as_ref()) {
            Some(selector) => self.owned().with_selector(selector),
            None => self.owned(),
        }
    }

    fn target_version(&self, operator: MatchOperator) -> MatchExpression {
        MatchExpression::new(
            DEVICE_ANNOTATION_TEMPLATE_VERSION,
            operator,
            &[self.template_version.as_str()],
        )
    }

    fn success_threshold(&self) -> u32 {
        self.batch
            .as_ref()
            .and_then(|b| b.success_threshold)
            .or(self.fleet_success_threshold)
            .map(Percentage::value)
            .unwrap_or(DEFAULT_SUCCESS_THRESHOLD)
    }

    fn completion_totals(&self) -> RolloutResult<CompletionTotals> {
        let counts = self
            .store
            .completion_counts(&self.org_id, &fleetroll_state::fleet_owner(&self.fleet_name))?;
        Ok(CompletionTotals::from_counts(&counts, &self.template_version))
    }

    /// Number of devices this batch may still select, `None` for no limit.
    fn calculate_limit(&self) -> RolloutResult<Option<i64>> {
        let Some(limit) = self.batch.as_ref().and_then(|b| b.limit) else {
            return Ok(None);
        };
        let (total, rolled_out) = match limit {
            BatchLimit::Absolute(_) => (0, 0),
            BatchLimit::Percentage(_) => {
                let params = self.batch_params();
                let total = self.store.count_devices(&self.org_id, &params)?;
                let rolled_out = self.store.count_devices(
                    &self.org_id,
                    &ListParams {
                        annotation_match_expressions: vec![self.target_version(MatchOperator::In)],
                        ..params
                    },
                )?;
                (total, rolled_out)
            }
        };
        Ok(Some(resolve_limit(&limit, total, rolled_out)))
    }

    /// Flag the batch's not-yet-rolled-out devices, up to its limit.
    pub(crate) fn mark(&self) -> RolloutResult<usize> {
        if self.batch.is_none() {
            return Ok(0);
        }
        let limit = match self.calculate_limit()? {
            Some(n) if n <= 0 => {
                debug!(fleet = %self.fleet_name, batch = self.batch_number, "batch limit already reached");
                return Ok(0);
            }
            Some(n) => Some(n as usize),
            None => None,
        };
        let params = ListParams {
            annotation_match_expressions: vec![self.target_version(MatchOperator::NotIn)],
            ..self.batch_params()
        };
        Ok(self.store.mark_rollout_selection(&self.org_id, &params, limit)?)
    }

    pub(crate) fn unmark(&self) -> RolloutResult<usize> {
        Ok(self
            .store
            .unmark_rollout_selection(&self.org_id, &self.fleet_name)?)
    }
}

impl Selection for BatchSelection {
    fn devices(&self) -> RolloutResult<Vec<Device>> {
        let params = ListParams {
            selected_for_rollout: Some(true),
            ..self.owned()
        };
        Ok(self.store.list_devices(&self.org_id, &params)?)
    }

    fn is_approved(&self) -> bool {
        self.state.approved
    }

    fn approve(&self) -> RolloutResult<()> {
        self.store.update_rollout_state(
            &self.org_id,
            &self.fleet_name,
            &[RolloutUpdate::Approved(true)],
        )
    }

    fn is_rolled_out(&self) -> RolloutResult<bool> {
        let params = ListParams {
            selected_for_rollout: Some(true),
            annotation_match_expressions: vec![self.target_version(MatchOperator::NotIn)],
            ..self.owned()
        };
        Ok(self.store.count_devices(&self.org_id, &params)? == 0)
    }

    fn may_approve_automatically(&self) -> RolloutResult<bool> {
        if self.state.approval_method != ApprovalMethod::Automatic {
            return Ok(false);
        }
        Ok(self
            .state
            .last_batch_success_percentage
            .is_some_and(|last| last >= i64::from(self.success_threshold())))
    }

    fn is_complete(&self) -> RolloutResult<bool> {
        if self.batch.is_none() {
            return Ok(true);
        }
        let totals = self.completion_totals()?;
        Ok(totals.relevant == totals.finished)
    }

    fn set_success_percentage(&self) -> RolloutResult<()> {
        if self.batch.is_none() {
            return Ok(());
        }
        let Some(percentage) = self.completion_totals()?.success_percentage() else {
            return Ok(());
        };
        debug!(fleet = %self.fleet_name, batch = self.batch_number, percentage, "batch success recorded");
        self.store.update_rollout_state(
            &self.org_id,
            &self.fleet_name,
            &[RolloutUpdate::LastBatchSuccessPercentage(percentage)],
        )
    }
}

/// Resolve a batch limit to a device count. A percentage applies to the
/// `total` devices the batch selector matches, minus the ones already
/// rolled out; the result may be zero or negative.
pub fn resolve_limit(limit: &BatchLimit, total: i64, rolled_out: i64) -> i64 {
    match limit {
        BatchLimit::Absolute(n) => *n,
        BatchLimit::Percentage(p) => {
            (total as f64 * f64::from(p.value()) / 100.0).round() as i64 - rolled_out
        }
    }
}

/// Completion tallies over the selected devices of a fleet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CompletionTotals {
    /// Devices that count toward completion at all.
    relevant: i64,
    /// Relevant devices in a terminal state.
    finished: i64,
    successful: i64,
}

impl CompletionTotals {
    fn from_counts(counts: &[CompletionCount], template_version: &str) -> Self {
        let mut totals = Self::default();
        for c in counts {
            let succeeded = c.rendered_template_version.as_deref() == Some(template_version)
                && c.same_rendered_version;
            let reporting = c.summary_status != DeviceSummaryStatus::Unknown;
            let in_update = c.updating_reason.is_some_and(UpdatingReason::is_in_update);
            if succeeded || reporting || in_update {
                totals.relevant += c.count;
            }
            if succeeded || (reporting && c.updating_reason == Some(UpdatingReason::Error)) {
                totals.finished += c.count;
            }
            if succeeded {
                totals.successful += c.count;
            }
        }
        totals
    }

    fn success_percentage(&self) -> Option<i64> {
        (self.relevant > 0).then(|| self.successful * 100 / self.relevant)
    }
}
