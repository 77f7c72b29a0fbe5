//! One-shot operator commands.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use fleetroll_rollout::{
    ApprovalMethod, CallbackManager, DeviceSelectionReconciler, DisruptionAllowanceReconciler,
    RolloutError, RolloutState, RolloutStateStore, RolloutUpdate,
};
use fleetroll_state::{DeviceSelectionStrategy, ListParams, StateStore};

use crate::config::DaemonConfig;

/// Open the configured store, creating its directory if needed.
pub fn open_store(config: &DaemonConfig) -> anyhow::Result<StateStore> {
    if let Some(dir) = config.store.path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let store = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "state store opened");
    Ok(store)
}

/// Run one pass of both reconcilers. Fails if either collected errors.
pub fn reconcile_once(
    store: &StateStore,
    org_id: &str,
    callbacks: Arc<dyn CallbackManager>,
) -> anyhow::Result<()> {
    let selection = DeviceSelectionReconciler::new(store.clone(), callbacks.clone())
        .with_org_id(org_id)
        .reconcile();
    let disruption = DisruptionAllowanceReconciler::new(store.clone(), callbacks)
        .with_org_id(org_id)
        .reconcile();
    selection?;
    disruption?;
    Ok(())
}

/// Approve the fleet's current batch.
pub fn approve(store: &StateStore, org_id: &str, fleet: &str) -> anyhow::Result<()> {
    ensure_fleet(store, org_id, fleet)?;
    store.update_rollout_state(org_id, fleet, &[RolloutUpdate::Approved(true)])?;
    info!(%fleet, "batch approved");
    Ok(())
}

pub fn set_approval_method(
    store: &StateStore,
    org_id: &str,
    fleet: &str,
    method: ApprovalMethod,
) -> anyhow::Result<()> {
    ensure_fleet(store, org_id, fleet)?;
    store.update_rollout_state(org_id, fleet, &[RolloutUpdate::ApprovalMethod(method)])?;
    info!(%fleet, %method, "approval method set");
    Ok(())
}

/// Rollout progress of one fleet, as printed by `fleetrolld status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloutStatus {
    pub fleet: String,
    #[serde(flatten)]
    pub state: RolloutState,
    /// Number of batches in the fleet's sequence, if it has one.
    pub batches: Option<usize>,
    pub selected_devices: Vec<String>,
}

pub fn status(store: &StateStore, org_id: &str, fleet_name: &str) -> anyhow::Result<RolloutStatus> {
    let fleet = store
        .get_fleet(org_id, fleet_name)?
        .ok_or_else(|| RolloutError::FleetNotFound(fleet_name.to_string()))?;
    let batches = fleet
        .spec
        .rollout_policy
        .as_ref()
        .and_then(|p| p.device_selection.as_ref())
        .map(|strategy| match strategy {
            DeviceSelectionStrategy::BatchSequence(seq) => seq.sequence.len(),
        });
    let params = ListParams {
        selected_for_rollout: Some(true),
        ..ListParams::owned_by_fleet(fleet_name)
    };
    let selected_devices = store
        .list_devices(org_id, &params)?
        .into_iter()
        .map(|d| d.metadata.name)
        .collect();
    Ok(RolloutStatus {
        fleet: fleet_name.to_string(),
        state: RolloutState::from_fleet(&fleet)?,
        batches,
        selected_devices,
    })
}

fn ensure_fleet(store: &StateStore, org_id: &str, fleet: &str) -> Result<(), RolloutError> {
    match store.get_fleet(org_id, fleet)? {
        Some(_) => Ok(()),
        None => Err(RolloutError::FleetNotFound(fleet.to_string())),
    }
}
