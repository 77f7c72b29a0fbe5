//! Rollout error types.

use thiserror::Error;

/// Errors raised while reconciling a fleet's rollout.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("state store error: {0}")]
    State(#[from] fleetroll_state::StateError),

    #[error("fleet not found: {0}")]
    FleetNotFound(String),

    #[error("invalid annotation {key}={value:?}: {reason}")]
    InvalidAnnotation {
        key: String,
        value: String,
        reason: String,
    },

    #[error("batch number {0} out of bounds")]
    BatchOutOfBounds(i64),

    #[error("batch number overflow: {next} exceeds sequence length {len}")]
    BatchOverflow { next: i64, len: i64 },

    #[error("invalid disruption allowance: {0}")]
    InvalidDisruptionAllowance(String),

    #[error("fleet {fleet}: {source}")]
    Fleet {
        fleet: String,
        #[source]
        source: Box<RolloutError>,
    },
}

impl RolloutError {
    /// Attach the fleet name to an error raised while processing it.
    pub fn for_fleet(self, fleet: &str) -> Self {
        Self::Fleet {
            fleet: fleet.to_string(),
            source: Box::new(self),
        }
    }
}

pub type RolloutResult<T> = Result<T, RolloutError>;

/// Every failure collected during one reconciliation pass.
#[derive(Debug, Error)]
#[error("{} error(s): {}", .errors.len(), join(.errors))]
pub struct ReconcileErrors {
    pub errors: Vec<RolloutError>,
}

impl ReconcileErrors {
    /// `Ok` when the pass collected nothing.
    pub fn check(errors: Vec<RolloutError>) -> Result<(), Self> {
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Self { errors })
        }
    }
}

fn join(errors: &[RolloutError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
