//! Typed rollout state persisted as fleet annotations.
//!
//! The fleet's annotation bag is the only durable rollout state. This module
//! owns the mapping between annotation keys and [`RolloutState`]; the rest of
//! the crate reads and writes rollout state exclusively through
//! [`RolloutStateStore`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use fleetroll_state::{Fleet, StateStore};

use crate::error::{RolloutError, RolloutResult};

/// Template version the fleet currently wants its devices to run.
pub const FLEET_ANNOTATION_TEMPLATE_VERSION: &str = "fleet-controller/templateVersion";
/// Template version the rollout is currently walking the batches for.
pub const FLEET_ANNOTATION_DEPLOYING_TEMPLATE_VERSION: &str =
    "fleet-controller/deployingTemplateVersion";
pub const FLEET_ANNOTATION_BATCH_NUMBER: &str = "fleet-controller/batchNumber";
pub const FLEET_ANNOTATION_ROLLOUT_APPROVED: &str = "fleet-controller/rolloutApproved";
pub const FLEET_ANNOTATION_ROLLOUT_APPROVAL_METHOD: &str =
    "fleet-controller/rolloutApprovalMethod";
pub const FLEET_ANNOTATION_LAST_BATCH_SUCCESS_PERCENTAGE: &str =
    "fleet-controller/lastBatchSuccessPercentage";

/// Batch number of a rollout that has not started yet.
pub const BATCH_NOT_STARTED: i64 = -1;

/// How a batch gets approved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMethod {
    /// An operator must approve every batch.
    #[default]
    Manual,
    /// A batch approves itself once the previous one succeeded often enough.
    Automatic,
}

impl ApprovalMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
        }
    }

    /// Anything other than `automatic` is treated as manual.
    fn from_annotation(value: &str) -> Self {
        if value == "automatic" {
            Self::Automatic
        } else {
            Self::Manual
        }
    }
}

impl FromStr for ApprovalMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "automatic" => Ok(Self::Automatic),
            other => Err(format!("unknown approval method {other:?}")),
        }
    }
}

impl fmt::Display for ApprovalMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rollout state of one fleet, as decoded from its annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolloutState {
    pub template_version: Option<String>,
    pub deploying_template_version: Option<String>,
    /// `-1` before the first batch, `len(sequence)` once exhausted.
    pub batch_number: i64,
    pub approved: bool,
    pub approval_method: ApprovalMethod,
    pub last_batch_success_percentage: Option<i64>,
}

impl Default for RolloutState {
    fn default() -> Self {
        Self {
            template_version: None,
            deploying_template_version: None,
            batch_number: BATCH_NOT_STARTED,
            approved: false,
            approval_method: ApprovalMethod::Manual,
            last_batch_success_percentage: None,
        }
    }
}

impl RolloutState {
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> RolloutResult<Self> {
        let get = |key: &str| annotations.get(key).cloned();
        Ok(Self {
            template_version: get(FLEET_ANNOTATION_TEMPLATE_VERSION),
            deploying_template_version: get(FLEET_ANNOTATION_DEPLOYING_TEMPLATE_VERSION),
            batch_number: parse_int(annotations, FLEET_ANNOTATION_BATCH_NUMBER)?
                .unwrap_or(BATCH_NOT_STARTED),
            approved: annotations
                .get(FLEET_ANNOTATION_ROLLOUT_APPROVED)
                .is_some_and(|v| v == "true"),
            approval_method: annotations
                .get(FLEET_ANNOTATION_ROLLOUT_APPROVAL_METHOD)
                .map(|v| ApprovalMethod::from_annotation(v))
                .unwrap_or_default(),
            last_batch_success_percentage: parse_int(
                annotations,
                FLEET_ANNOTATION_LAST_BATCH_SUCCESS_PERCENTAGE,
            )?,
        })
    }

    pub fn from_fleet(fleet: &Fleet) -> RolloutResult<Self> {
        Self::from_annotations(&fleet.metadata.annotations)
    }

    /// A rollout is new when no version is being deployed yet or the
    /// deployed one differs from `template_version`.
    pub fn is_rollout_new(&self, template_version: &str) -> bool {
        self.deploying_template_version.as_deref() != Some(template_version)
    }
}

fn parse_int(annotations: &BTreeMap<String, String>, key: &str) -> RolloutResult<Option<i64>> {
    annotations
        .get(key)
        .map(|value| {
            value
                .parse::<i64>()
                .map_err(|e| RolloutError::InvalidAnnotation {
                    key: key.to_string(),
                    value: value.clone(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}

/// One change to a fleet's rollout state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutUpdate {
    TemplateVersion(String),
    DeployingTemplateVersion(String),
    BatchNumber(i64),
    /// `false` removes the approval.
    Approved(bool),
    ApprovalMethod(ApprovalMethod),
    LastBatchSuccessPercentage(i64),
}

/// Translate updates into annotations to set and keys to remove.
pub fn annotation_changes(updates: &[RolloutUpdate]) -> (BTreeMap<String, String>, Vec<String>) {
    let mut set = BTreeMap::new();
    let mut unset = Vec::new();
    for update in updates {
        let (key, value) = match update {
            RolloutUpdate::TemplateVersion(v) => (FLEET_ANNOTATION_TEMPLATE_VERSION, v.clone()),
            RolloutUpdate::DeployingTemplateVersion(v) => {
                (FLEET_ANNOTATION_DEPLOYING_TEMPLATE_VERSION, v.clone())
            }
            RolloutUpdate::BatchNumber(n) => (FLEET_ANNOTATION_BATCH_NUMBER, n.to_string()),
            RolloutUpdate::Approved(true) => (FLEET_ANNOTATION_ROLLOUT_APPROVED, "true".to_string()),
            RolloutUpdate::Approved(false) => {
                unset.push(FLEET_ANNOTATION_ROLLOUT_APPROVED.to_string());
                continue;
            }
            RolloutUpdate::ApprovalMethod(m) => {
                (FLEET_ANNOTATION_ROLLOUT_APPROVAL_METHOD, m.as_str().to_string())
            }
            RolloutUpdate::LastBatchSuccessPercentage(p) => {
                (FLEET_ANNOTATION_LAST_BATCH_SUCCESS_PERCENTAGE, p.to_string())
            }
        };
        set.insert(key.to_string(), value);
    }
    (set, unset)
}

/// Narrow persistence seam for rollout state.
pub trait RolloutStateStore {
    /// Load the current rollout state of a fleet.
    fn rollout_state(&self, org_id: &str, fleet_name: &str) -> RolloutResult<RolloutState>;

    /// Apply all updates in one atomic annotation write.
    fn update_rollout_state(
        &self,
        org_id: &str,
        fleet_name: &str,
        updates: &[RolloutUpdate],
    ) -> RolloutResult<()>;
}

impl RolloutStateStore for StateStore {
    fn rollout_state(&self, org_id: &str, fleet_name: &str) -> RolloutResult<RolloutState> {
        let fleet = self
            .get_fleet(org_id, fleet_name)?
            .ok_or_else(|| RolloutError::FleetNotFound(format!("{org_id}/{fleet_name}")))?;
        RolloutState::from_fleet(&fleet)
    }

    fn update_rollout_state(
        &self,
        org_id: &str,
        fleet_name: &str,
        updates: &[RolloutUpdate],
    ) -> RolloutResult<()> {
        let (set, unset) = annotation_changes(updates);
        self.update_fleet_annotations(org_id, fleet_name, &set, &unset)?;
        Ok(())
    }
}
