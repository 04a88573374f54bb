//! File-backed local entity store.

use parking_lot::Mutex;
use roam_sync::{
    persist::write_atomic, EntityType, LocalSnapshot, LocalStore, MemoryLocalStore, SyncError,
    SyncResult, SyncableEntity,
};
use std::path::{Path, PathBuf};

/// [`LocalStore`] that mirrors a [`MemoryLocalStore`] into a JSON file after
/// every write.
///
/// Writes are serialized so the file never lags behind memory. A write whose
/// file update fails is undone in memory and reported as `TransactionFailed`.
#[derive(Debug)]
pub struct FileLocalStore {
    inner: MemoryLocalStore,
    path: PathBuf,
    writes: Mutex<()>,
}

impl FileLocalStore {
    /// Open the store at `path`, loading existing contents if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let inner = match std::fs::read_to_string(&path) {
            Ok(json) => MemoryLocalStore::from_snapshot(LocalSnapshot::from_json(&json)?)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryLocalStore::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), entities = inner.len(), "opened local store");
        Ok(Self {
            inner,
            path,
            writes: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn flush(&self) -> SyncResult<()> {
        let json = self.inner.export_state().to_json()?;
        write_atomic(&self.path, json.as_bytes()).map_err(|e| {
            SyncError::TransactionFailed(format!("writing {}: {e}", self.path.display()))
        })
    }

    /// Put `previous` back after a failed flush.
    fn restore(&self, local_id: &str, previous: Option<SyncableEntity>) {
        let restored = match previous {
            Some(entity) => self.inner.put(entity),
            None => self.inner.remove(local_id).map(|_| ()),
        };
        if let Err(e) = restored {
            tracing::error!(local_id, error = %e, "could not undo local write");
        }
    }
}

impl LocalStore for FileLocalStore {
    fn get(&self, local_id: &str) -> SyncResult<Option<SyncableEntity>> {
        self.inner.get(local_id)
    }

    fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: &str,
    ) -> SyncResult<Option<SyncableEntity>> {
        self.inner.find_by_remote_id(entity_type, remote_id)
    }

    fn put(&self, entity: SyncableEntity) -> SyncResult<()> {
        let _write = self.writes.lock();
        let local_id = entity.local_id.clone();
        let previous = self.inner.get(&local_id)?;
        self.inner.put(entity)?;
        self.flush().inspect_err(|_| self.restore(&local_id, previous))
    }

    fn remove(&self, local_id: &str) -> SyncResult<Option<SyncableEntity>> {
        let _write = self.writes.lock();
        let removed = self.inner.remove(local_id)?;
        if removed.is_some() {
            self.flush().inspect_err(|_| self.restore(local_id, removed.clone()))?;
        }
        Ok(removed)
    }

    fn list(&self, entity_type: EntityType) -> SyncResult<Vec<SyncableEntity>> {
        self.inner.list(entity_type)
    }

    fn update(
        &self,
        local_id: &str,
        f: &mut dyn FnMut(&mut SyncableEntity) -> SyncResult<()>,
    ) -> SyncResult<SyncableEntity> {
        let _write = self.writes.lock();
        let previous = self.inner.get(local_id)?;
        let updated = self.inner.update(local_id, f)?;
        self.flush().inspect_err(|_| self.restore(local_id, previous))?;
        Ok(updated)
    }

    fn count_missing_remote_id(&self, entity_type: EntityType) -> SyncResult<usize> {
        self.inner.count_missing_remote_id(entity_type)
    }
}
