//! Error types for the gridlease record store.

use thiserror::Error;

/// Result type alias for record store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during record store operations.
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
}

impl StateError {
    /// Whether this error is the distinguished "row does not exist" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound(_))
    }
}
