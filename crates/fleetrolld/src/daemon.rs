//! Long-running mode: both reconcilers on their own timers.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use fleetroll_rollout::{
    ChannelNotifier, DeviceSelectionReconciler, DisruptionAllowanceReconciler, Reconciler,
    RolloutEvent, run_periodic,
};
use fleetroll_state::StateStore;

use crate::config::DaemonConfig;

/// Run until `shutdown` resolves, then stop both reconcilers and drain the
/// remaining events.
pub async fn run(
    config: &DaemonConfig,
    store: StateStore,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let (notifier, mut events) = ChannelNotifier::new();
    let notifier = Arc::new(notifier);

    let device_selection: Arc<dyn Reconciler> = Arc::new(
        DeviceSelectionReconciler::new(store.clone(), notifier.clone())
            .with_org_id(&config.org_id),
    );
    let disruption_allowance: Arc<dyn Reconciler> = Arc::new(
        DisruptionAllowanceReconciler::new(store, notifier.clone()).with_org_id(&config.org_id),
    );
    drop(notifier);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let selection_handle = tokio::spawn(run_periodic(
        device_selection,
        config.reconciler.device_selection_interval(),
        shutdown_rx.clone(),
    ));
    let disruption_handle = tokio::spawn(run_periodic(
        disruption_allowance,
        config.reconciler.disruption_allowance_interval(),
        shutdown_rx,
    ));

    // Ends once both reconcilers, the only senders, are gone.
    let events_handle = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    info!(org_id = %config.org_id, "fleetroll daemon running");
    shutdown.await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    selection_handle.await?;
    disruption_handle.await?;
    events_handle.await?;

    info!("fleetroll daemon stopped");
    Ok(())
}

fn log_event(event: &RolloutEvent) {
    match event {
        RolloutEvent::FleetRolloutSelectionUpdated { org_id, fleet } => {
            info!(%org_id, %fleet, "fleet rollout selection updated");
        }
        RolloutEvent::DeviceSourceUpdated { org_id, device } => {
            info!(%org_id, %device, "device source updated");
        }
    }
}
