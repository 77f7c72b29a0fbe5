//! Store errors. The redb and serde_json errors are flattened to strings so
//! callers only ever match on the failing step.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open fleetroll store: {0}")]
    Open(String),

    /// Beginning or committing a redb transaction failed.
    #[error("store transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open store table: {0}")]
    Table(String),

    #[error("store read failed: {0}")]
    Read(String),

    #[error("store write failed: {0}")]
    Write(String),

    #[error("cannot encode resource: {0}")]
    Serialize(String),

    /// A stored resource no longer matches the current types.
    #[error("cannot decode stored resource: {0}")]
    Deserialize(String),

    /// No resource at the given `{org_id}/{name}` key.
    #[error("no resource stored under {0}")]
    NotFound(String),
}
