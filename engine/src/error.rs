//! Error types for the sync engine.

use crate::{ConflictId, EntityId, EntityType, OperationId};
use thiserror::Error;

/// All possible errors from the sync engine.
///
/// Errors are `Clone` so a single cycle outcome can be handed to every caller
/// that joined an in-flight sync cycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    // Transient errors
    #[error("network error: {0}")]
    Network(String),

    #[error("local transaction failed: {0}")]
    TransactionFailed(String),

    // Ordering errors
    #[error("dependency not met for {entity_type}: {detail}")]
    DependencyNotMet {
        entity_type: EntityType,
        detail: String,
    },

    #[error("conflict detected for entity {0}")]
    ConflictDetected(EntityId),

    // Terminal operation errors
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("max retries exceeded for operation {op_id} after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded {
        op_id: OperationId,
        attempts: u32,
        last_error: String,
    },

    // Configuration errors
    #[error("cyclic dependency between entity types: {0}")]
    CyclicDependency(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    // State errors
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("entity not found: {0}")]
    EntityNotFound(EntityId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    // Persistence errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    /// Returns true if the failed operation may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::TransactionFailed(_)
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Result type for engine operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
