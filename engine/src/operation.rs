//! Queued local mutations.
//!
//! Every local change is captured as a [`SyncOperation`] instead of being
//! pushed directly. Operations survive restarts in the offline queue and are
//! consumed by the sync coordinator.

use crate::{EntityId, EntityType, OperationId, SyncPriority, SyncableEntity, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Default retry budget for a new operation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What an operation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// Completed or cancelled; satisfies a dependency.
    pub fn is_finished(self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Cancelled)
    }

    /// No further processing without an external trigger.
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::Pending | OperationStatus::InProgress)
    }
}

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    /// Operation ID
    pub id: OperationId,
    pub entity_type: EntityType,
    /// Local id of the target entity
    pub entity_id: EntityId,
    pub kind: OperationKind,
    /// Entity payload at enqueue time
    pub payload: serde_json::Value,
    /// Operations that must finish first (assigned by the queue)
    #[serde(default)]
    pub depends_on: Vec<OperationId>,
    pub priority: SyncPriority,
    pub created_at: Timestamp,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: OperationStatus,
    /// Queue insertion sequence (assigned by the queue)
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Create a pending operation with a fresh id.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        kind: OperationKind,
        payload: serde_json::Value,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            kind,
            payload,
            depends_on: Vec::new(),
            priority: SyncPriority::Normal,
            created_at,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            status: OperationStatus::Pending,
            seq: 0,
            last_error: None,
        }
    }

    /// Capture `entity` as an operation, inheriting its priority.
    pub fn for_entity(entity: &SyncableEntity, kind: OperationKind, created_at: Timestamp) -> Self {
        Self::new(
            entity.entity_type,
            entity.local_id.clone(),
            kind,
            entity.payload.clone(),
            created_at,
        )
        .with_priority(entity.sync_priority)
    }

    pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: SyncPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Queue order: priority descending, then `created_at`, then `seq`.
    pub fn dispatch_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.created_at.cmp(&other.created_at))
            .then(self.seq.cmp(&other.seq))
    }

    /// True once the retry budget is spent.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }
}
