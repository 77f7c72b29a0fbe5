//! fleetroll rollout core: phased template-version rollout across fleets.
//!
//! Two independent reconcilers read fleet and device state from the
//! [`StateStore`](fleetroll_state::StateStore), mutate annotations and rollout
//! flags through it, and wake downstream controllers through a
//! [`CallbackManager`]. Neither keeps state between passes: everything is
//! re-derived from the store on every tick, so a pass can be repeated or
//! interrupted at any point.
//!
//! # Components
//!
//! - **`state`**: typed view of the rollout annotations on a fleet
//! - **`selector`**: device selection strategy traits and factory
//! - **`batch_sequence`**: batch-by-batch selector and per-batch selection
//! - **`device_selection`**: reconciler walking fleets through their batches
//! - **`disruption_allowance`**: reconciler throttling concurrent updates
//! - **`notifier`**: fire-and-forget callbacks to downstream controllers
//! - **`periodic`**: timer loop driving a reconciler until shutdown
//!
//! # State machine
//!
//! ```text
//! NotStarted(-1) → Batch0 → Batch1 → … → BatchN-1 → Exhausted(N)
//!        ↑                                               │
//!        └──────── reset (new template version) ─────────┘
//! ```

pub mod batch_sequence;
pub mod device_selection;
pub mod disruption_allowance;
pub mod error;
pub mod notifier;
pub mod periodic;
pub mod selector;
pub mod state;

pub use batch_sequence::{
    BatchSelection, BatchSequenceSelector, DEFAULT_SUCCESS_THRESHOLD, resolve_limit,
};
pub use device_selection::{DeviceSelectionReconciler, ROLLOUT_DEVICE_SELECTION_INTERVAL};
pub use disruption_allowance::{
    DISRUPTION_ALLOWANCE_INTERVAL, DisruptionAllowanceReconciler, GroupCounts, num_to_render,
};
pub use error::{ReconcileErrors, RolloutError, RolloutResult};
pub use notifier::{CallbackManager, ChannelNotifier, RolloutEvent};
pub use periodic::{Reconciler, run_periodic};
pub use selector::{RolloutDeviceSelector, Selection, new_rollout_device_selector};
pub use state::{ApprovalMethod, RolloutState, RolloutStateStore, RolloutUpdate};
