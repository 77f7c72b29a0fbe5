//! fleetroll-state: embedded resource store for fleetroll.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for fleets and their devices, plus the device queries the rollout
//! reconcilers are built on: filtered list/count, per-label-group counts,
//! completion counts, and atomic bulk marking of rollout selections.
//!
//! # Architecture
//!
//! All resources are JSON-serialized into redb's `&[u8]` value columns.
//! Keys are composite (`{org_id}/{name}`), so a prefix scan yields every
//! resource of an organization.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared between the reconciler tasks. Every mutating call runs
//! in a single write transaction and is visible to the next read.

pub mod error;
pub mod query;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use query::{CompletionCount, DevicePredicate, LabelGroup, ListParams};
pub use store::StateStore;
pub use types::*;
