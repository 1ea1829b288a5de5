use thiserror::Error;

use crate::topology::NodeId;

/// Errors raised by the grid.
///
/// The type is `Clone` because outcomes travel between threads: a validation
/// failure observed by a delivery thread is handed to the originator through
/// a reply channel, and an ambiguous group declaration is re-raised
/// identically on every resolution attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SeshatError {
    /// Invalid group declaration on a key type, or an invalid node configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation is not available under the active protocol.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A bounded wait expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// A delivered prepare could not be applied (write skew, constraint violation).
    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("Node {0} is unreachable")]
    NodeUnreachable(NodeId),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl SeshatError {
    /// Whether the client should treat this failure as a rolled back transaction.
    pub fn is_rollback_outcome(&self) -> bool {
        matches!(
            self,
            SeshatError::ValidationFailure(_)
                | SeshatError::Timeout(_)
                | SeshatError::NodeUnreachable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SeshatError>;
