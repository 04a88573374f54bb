//! Per-entity sync state machine.
//!
//! ```text
//! InSync -> NeedsUpload -> Uploading -> InSync | FilesPending | Error | Conflict
//! Uploading -> NeedsUpload          (Deferred, prerequisite not synced yet)
//! NeedsDownload -> Downloading -> InSync | Error | Conflict
//! FilesPending -> InSync            (FilesUploaded)
//! Conflict -> InSync                (Resolved only)
//! Error -> NeedsUpload/NeedsDownload (automatic while retries remain, else ManualRetry)
//! ```
//!
//! [`transition`] is pure; [`SyncStateTracker`] holds one [`TrackedEntity`]
//! per entity and applies events to it.

use crate::{error::SyncResult, EntityId, EntityType, SyncError, SyncStatus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// The entity was edited locally
    LocalChange,
    /// The remote store has a newer version
    RemoteChange,
    BeginUpload,
    BeginDownload,
    Succeeded,
    /// Metadata uploaded, binary file still local
    FilesPending,
    FilesUploaded,
    Failed { message: String, retryable: bool },
    /// Upload postponed until a prerequisite is synced; no attempt is charged
    Deferred,
    ConflictDetected,
    Resolved,
    ManualRetry,
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::LocalChange => "LocalChange",
            SyncEvent::RemoteChange => "RemoteChange",
            SyncEvent::BeginUpload => "BeginUpload",
            SyncEvent::BeginDownload => "BeginDownload",
            SyncEvent::Succeeded => "Succeeded",
            SyncEvent::FilesPending => "FilesPending",
            SyncEvent::FilesUploaded => "FilesUploaded",
            SyncEvent::Failed { .. } => "Failed",
            SyncEvent::Deferred => "Deferred",
            SyncEvent::ConflictDetected => "ConflictDetected",
            SyncEvent::Resolved => "Resolved",
            SyncEvent::ManualRetry => "ManualRetry",
        }
    }
}

/// State of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntity {
    pub entity_type: EntityType,
    pub status: SyncStatus,
    /// Failed attempts since the last success
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Edited locally while an upload or download was in flight
    pub dirty: bool,
    /// Where a failed entity goes back to on retry
    pub retry_to: SyncStatus,
}

impl TrackedEntity {
    pub fn new(entity_type: EntityType, status: SyncStatus) -> Self {
        Self {
            entity_type,
            status,
            attempts: 0,
            last_error: None,
            dirty: false,
            retry_to: SyncStatus::NeedsUpload,
        }
    }
}

/// Apply `event` to `entity`.
pub fn transition(
    entity: &TrackedEntity,
    event: &SyncEvent,
    max_retries: u32,
) -> SyncResult<TrackedEntity> {
    use SyncStatus::*;

    let mut next = entity.clone();
    match (entity.status, event) {
        (Conflict, SyncEvent::LocalChange) => {}
        (Uploading | Downloading, SyncEvent::LocalChange) => next.dirty = true,
        (_, SyncEvent::LocalChange) => {
            next.status = NeedsUpload;
            next.attempts = 0;
            next.last_error = None;
        }

        (InSync | NeedsDownload | FilesPending, SyncEvent::RemoteChange) => {
            next.status = NeedsDownload;
        }
        (_, SyncEvent::RemoteChange) => {}

        (NeedsUpload, SyncEvent::BeginUpload) => {
            next.status = Uploading;
            next.retry_to = NeedsUpload;
        }
        (InSync | NeedsDownload, SyncEvent::BeginDownload) => {
            next.status = Downloading;
            next.retry_to = NeedsDownload;
        }

        (Uploading | Downloading, SyncEvent::Succeeded) => {
            next.status = if entity.dirty { NeedsUpload } else { InSync };
            next.dirty = false;
            next.attempts = 0;
            next.last_error = None;
        }
        (Uploading, SyncEvent::FilesPending) => {
            next.status = if entity.dirty { NeedsUpload } else { FilesPending };
            next.dirty = false;
            next.attempts = 0;
            next.last_error = None;
        }
        (FilesPending, SyncEvent::FilesUploaded) => next.status = InSync,

        (Uploading | Downloading, SyncEvent::Failed { message, retryable }) => {
            next.last_error = Some(message.clone());
            next.attempts += 1;
            let retry_to = if entity.dirty { NeedsUpload } else { entity.retry_to };
            next.dirty = false;
            next.status = if *retryable && next.attempts <= max_retries {
                retry_to
            } else {
                Error
            };
            next.retry_to = retry_to;
        }

        (Uploading, SyncEvent::Deferred) => {
            next.status = NeedsUpload;
            next.dirty = false;
        }

        (InSync, SyncEvent::ConflictDetected) => return Err(invalid(entity.status, event)),
        (_, SyncEvent::ConflictDetected) => {
            next.status = Conflict;
            next.dirty = false;
        }
        (Conflict, SyncEvent::Resolved) => {
            next.status = InSync;
            next.attempts = 0;
            next.last_error = None;
        }

        (Error, SyncEvent::ManualRetry) => {
            next.status = entity.retry_to;
            next.attempts = 0;
            next.last_error = None;
        }

        _ => return Err(invalid(entity.status, event)),
    }
    Ok(next)
}

fn invalid(from: SyncStatus, event: &SyncEvent) -> SyncError {
    SyncError::InvalidTransition {
        from: format!("{from:?}"),
        event: event.name().to_string(),
    }
}

/// Tracks the state of every entity under sync.
#[derive(Debug)]
pub struct SyncStateTracker {
    entries: RwLock<HashMap<EntityId, TrackedEntity>>,
    max_retries: u32,
}

impl SyncStateTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_retries,
        }
    }

    /// Start tracking an entity in a known state.
    pub fn track(&self, entity_id: impl Into<EntityId>, entity_type: EntityType, status: SyncStatus) {
        self.entries
            .write()
            .insert(entity_id.into(), TrackedEntity::new(entity_type, status));
    }

    /// Apply an event and return the new status.
    ///
    /// Unknown entities start in `NeedsUpload` on `LocalChange` and in
    /// `NeedsDownload` on `RemoteChange`.
    pub fn apply(
        &self,
        entity_id: &str,
        entity_type: EntityType,
        event: SyncEvent,
    ) -> SyncResult<SyncStatus> {
        let mut entries = self.entries.write();

        let Some(current) = entries.get(entity_id).cloned() else {
            let initial = match event {
                SyncEvent::LocalChange => SyncStatus::NeedsUpload,
                SyncEvent::RemoteChange => SyncStatus::NeedsDownload,
                _ => return Err(SyncError::EntityNotFound(entity_id.to_string())),
            };
            entries.insert(entity_id.to_string(), TrackedEntity::new(entity_type, initial));
            return Ok(initial);
        };

        let next = transition(&current, &event, self.max_retries)?;
        if next.status != current.status {
            tracing::trace!(
                entity_id,
                from = ?current.status,
                to = ?next.status,
                event = event.name(),
                "state transition"
            );
        }
        let status = next.status;
        entries.insert(entity_id.to_string(), next);
        Ok(status)
    }

    /// Stop tracking an entity (deletion committed).
    pub fn forget(&self, entity_id: &str) -> Option<TrackedEntity> {
        self.entries.write().remove(entity_id)
    }

    pub fn get(&self, entity_id: &str) -> Option<TrackedEntity> {
        self.entries.read().get(entity_id).cloned()
    }

    pub fn status(&self, entity_id: &str) -> Option<SyncStatus> {
        self.entries.read().get(entity_id).map(|e| e.status)
    }

    pub fn is_conflicted(&self, entity_id: &str) -> bool {
        self.status(entity_id) == Some(SyncStatus::Conflict)
    }

    /// Ids of entities in `status`, sorted.
    pub fn entities_in(&self, status: SyncStatus) -> Vec<EntityId> {
        let mut ids: Vec<_> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of entities per (type, status).
    pub fn counts(&self) -> BTreeMap<(EntityType, SyncStatus), usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.read().values() {
            *counts.entry((entry.entity_type, entry.status)).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
