//! Local entity store.
//!
//! The engine never owns the application's database; it reads and writes
//! entities through the [`LocalStore`] trait. [`MemoryLocalStore`] is the
//! bundled implementation: an in-memory map that can be exported to and
//! imported from a [`LocalSnapshot`].

use crate::{error::SyncResult, EntityId, EntityType, SyncError, SyncStatus, SyncableEntity};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Version of the local snapshot format.
pub const LOCAL_SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Access to the application's local entities.
pub trait LocalStore: Send + Sync + std::fmt::Debug {
    fn get(&self, local_id: &str) -> SyncResult<Option<SyncableEntity>>;

    fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> SyncResult<Option<SyncableEntity>>;

    /// Insert or replace.
    fn put(&self, entity: SyncableEntity) -> SyncResult<()>;

    fn remove(&self, local_id: &str) -> SyncResult<Option<SyncableEntity>>;

    /// Entities of one type, ordered by local id.
    fn list(&self, entity_type: EntityType) -> SyncResult<Vec<SyncableEntity>>;

    /// Read-modify-write in one transaction. Nothing is written if `f` fails.
    fn update(
        &self,
        local_id: &str,
        f: &mut dyn FnMut(&mut SyncableEntity) -> SyncResult<()>,
    ) -> SyncResult<SyncableEntity>;

    /// Live entities of `entity_type` that were never uploaded and still wait
    /// for it. Entities parked in `Error` or `Conflict` are not counted.
    fn count_missing_remote_id(&self, entity_type: EntityType) -> SyncResult<usize>;

    fn exists(&self, local_id: &str) -> SyncResult<bool> {
        Ok(self.get(local_id)?.is_some())
    }
}

/// Serialized contents of a [`MemoryLocalStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    pub format_version: u32,
    /// Entities by local id (sorted for deterministic output)
    pub entities: BTreeMap<EntityId, SyncableEntity>,
}

impl LocalSnapshot {
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> SyncResult<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        if snapshot.format_version > LOCAL_SNAPSHOT_FORMAT_VERSION {
            return Err(SyncError::Serialization(format!(
                "unsupported local snapshot format version: {} (max supported: {})",
                snapshot.format_version, LOCAL_SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(snapshot)
    }
}

/// In-memory [`LocalStore`].
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entities: RwLock<BTreeMap<EntityId, SyncableEntity>>,
    fail_commits: AtomicU32,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with `TransactionFailed`.
    pub fn fail_next_commit(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    fn check_commit(&self) -> SyncResult<()> {
        let injected = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::TransactionFailed("injected commit failure".into()));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Every entity, ordered by local id.
    pub fn all(&self) -> Vec<SyncableEntity> {
        self.entities.read().values().cloned().collect()
    }

    /// Export the current contents.
    pub fn export_state(&self) -> LocalSnapshot {
        LocalSnapshot {
            format_version: LOCAL_SNAPSHOT_FORMAT_VERSION,
            entities: self.entities.read().clone(),
        }
    }

    /// Replace the contents with `snapshot`.
    pub fn import_state(&self, snapshot: LocalSnapshot) -> SyncResult<()> {
        for (id, entity) in &snapshot.entities {
            if *id != entity.local_id {
                return Err(SyncError::Serialization(format!(
                    "entity keyed as '{id}' has local id '{}'",
                    entity.local_id
                )));
            }
        }
        *self.entities.write() = snapshot.entities;
        Ok(())
    }

    pub fn from_snapshot(snapshot: LocalSnapshot) -> SyncResult<Self> {
        let store = Self::new();
        store.import_state(snapshot)?;
        Ok(store)
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, local_id: &str) -> SyncResult<Option<SyncableEntity>> {
        Ok(self.entities.read().get(local_id).cloned())
    }

    fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> SyncResult<Option<SyncableEntity>> {
        Ok(self
            .entities
            .read()
            .values()
            .find(|e| e.entity_type == entity_type && e.remote_id.as_deref() == Some(remote_id))
            .cloned())
    }

    fn put(&self, entity: SyncableEntity) -> SyncResult<()> {
        self.check_commit()?;
        self.entities.write().insert(entity.local_id.clone(), entity);
        Ok(())
    }

    fn remove(&self, local_id: &str) -> SyncResult<Option<SyncableEntity>> {
        self.check_commit()?;
        Ok(self.entities.write().remove(local_id))
    }

    fn list(&self, entity_type: EntityType) -> SyncResult<Vec<SyncableEntity>> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| e.entity_type == entity_type)
            .cloned()
            .collect())
    }

    fn update(
        &self,
        local_id: &str,
        f: &mut dyn FnMut(&mut SyncableEntity) -> SyncResult<()>,
    ) -> SyncResult<SyncableEntity> {
        let mut entities = self.entities.write();
        let current = entities
            .get(local_id)
            .ok_or_else(|| SyncError::EntityNotFound(local_id.to_string()))?;

        let mut next = current.clone();
        f(&mut next)?;
        self.check_commit()?;

        entities.insert(local_id.to_string(), next.clone());
        Ok(next)
    }

    fn count_missing_remote_id(&self, entity_type: EntityType) -> SyncResult<usize> {
        Ok(self
            .entities
            .read()
            .values()
            .filter(|e| e.entity_type == entity_type && e.remote_id.is_none() && !e.deleted)
            .filter(|e| !matches!(e.sync_status, SyncStatus::Error | SyncStatus::Conflict))
            .count())
    }
}
