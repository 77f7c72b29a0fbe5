//! Fire-and-forget callbacks to downstream controllers.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use fleetroll_state::Fleet;

/// Wakes the controllers that act on rollout decisions. Calls must not
/// block and cannot fail from the caller's point of view.
pub trait CallbackManager: Send + Sync {
    /// The fleet's set of devices selected for rollout changed.
    fn fleet_rollout_selection_updated(&self, org_id: &str, fleet: &Fleet);

    /// The device may re-render its configuration now.
    fn device_source_updated(&self, org_id: &str, device_name: &str);
}

/// One emitted callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    FleetRolloutSelectionUpdated { org_id: String, fleet: String },
    DeviceSourceUpdated { org_id: String, device: String },
}

/// [`CallbackManager`] that forwards every callback over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<RolloutEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RolloutEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: RolloutEvent) {
        if let Err(e) = self.tx.send(event) {
            warn!(event = ?e.0, "rollout event dropped, receiver closed");
        }
    }
}

impl CallbackManager for ChannelNotifier {
    fn fleet_rollout_selection_updated(&self, org_id: &str, fleet: &Fleet) {
        self.send(RolloutEvent::FleetRolloutSelectionUpdated {
            org_id: org_id.to_string(),
            fleet: fleet.name().to_string(),
        });
    }

    fn device_source_updated(&self, org_id: &str, device_name: &str) {
        self.send(RolloutEvent::DeviceSourceUpdated {
            org_id: org_id.to_string(),
            device: device_name.to_string(),
        });
    }
}
