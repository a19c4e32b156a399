//! Error types for the rollgate state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by the store and the version model.
///
/// redb failures are flattened to strings so that callers never depend on
/// the storage engine's own error types.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open update store: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("invalid version {0:?}")]
    InvalidVersion(String),
}
