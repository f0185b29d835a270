//! Error types for hearth state storage.

use thiserror::Error;

use crate::mutation::MutationError;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur while reading or writing a hearth database.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
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

    #[error("not found: {0}")]
    NotFound(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("backup failed: {0}")]
    Backup(String),

    #[error(transparent)]
    Mutation(#[from] MutationError),
}
