//! Durable sync state.
//!
//! The offline queue keeps everything it must not lose (operations, conflict
//! records and the download watermark) in one [`SyncSnapshot`] and writes it
//! through a [`SnapshotStorage`] on every mutation. Maps are `BTreeMap`s so
//! the serialized form is deterministic.

use crate::conflict::ConflictRecord;
use crate::{error::SyncResult, ConflictId, OperationId, SyncError, SyncOperation, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Persisted state of the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// One record per operation, keyed by id
    pub operations: BTreeMap<OperationId, SyncOperation>,
    /// Conflicts awaiting resolution
    pub open_conflicts: BTreeMap<ConflictId, ConflictRecord>,
    /// Resolved conflicts, oldest first
    pub archived_conflicts: Vec<ConflictRecord>,
    /// Download watermark
    pub last_sync_timestamp: Option<Timestamp>,
    /// Next queue sequence number
    pub next_seq: u64,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            operations: BTreeMap::new(),
            open_conflicts: BTreeMap::new(),
            archived_conflicts: Vec::new(),
            last_sync_timestamp: None,
            next_seq: 1,
        }
    }
}

impl SyncSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> SyncResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON, rejecting newer formats.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let snapshot: Self = serde_json::from_str(json)?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(SyncError::Serialization(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Where the queue persists its snapshot.
pub trait SnapshotStorage: Send + Sync + std::fmt::Debug {
    /// Load the last saved snapshot, if any.
    fn load(&self) -> SyncResult<Option<SyncSnapshot>>;

    /// Durably replace the saved snapshot.
    fn save(&self, snapshot: &SyncSnapshot) -> SyncResult<()>;
}

/// In-memory storage for tests and ephemeral contexts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    saved: Mutex<Option<SyncSnapshot>>,
    saves: AtomicUsize,
    fail_next: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage pre-seeded with `snapshot`.
    pub fn with_snapshot(snapshot: SyncSnapshot) -> Self {
        Self {
            saved: Mutex::new(Some(snapshot)),
            ..Self::default()
        }
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Copy of the last saved snapshot.
    pub fn snapshot(&self) -> Option<SyncSnapshot> {
        self.saved.lock().clone()
    }

    /// Make the next `save` fail with a storage error.
    pub fn fail_next_save(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl SnapshotStorage for MemoryStorage {
    fn load(&self) -> SyncResult<Option<SyncSnapshot>> {
        Ok(self.saved.lock().clone())
    }

    fn save(&self, snapshot: &SyncSnapshot) -> SyncResult<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SyncError::Storage("injected save failure".into()));
        }
        *self.saved.lock() = Some(snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Snapshot stored as a JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStorage for JsonFileStorage {
    fn load(&self) -> SyncResult<Option<SyncSnapshot>> {
        match fs::read_to_string(&self.path) {
            Ok(json) => SyncSnapshot::from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, snapshot: &SyncSnapshot) -> SyncResult<()> {
        let json = snapshot.to_json_pretty()?;
        write_atomic(&self.path, json.as_bytes())
    }
}

/// Write `contents` to a uniquely named sibling temp file, fsync it, then
/// rename it over `path`. Concurrent writers never share a temp file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> SyncResult<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };

    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| SyncError::from(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityType, OperationKind};
    use serde_json::json;

    fn snapshot_with_op() -> SyncSnapshot {
        let mut snapshot = SyncSnapshot::new();
        let op = SyncOperation::new(
            EntityType::Category,
            "cat-1",
            OperationKind::Create,
            json!({"name": "Food"}),
            1000,
        )
        .with_id("op-1");
        snapshot.operations.insert(op.id.clone(), op);
        snapshot.last_sync_timestamp = Some(42);
        snapshot
    }

    #[test]
    fn json_roundtrip() {
        let snapshot = snapshot_with_op();
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"formatVersion\":1"));
        assert!(json.contains("\"lastSyncTimestamp\":42"));

        let parsed = SyncSnapshot::from_json(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn deterministic_serialization() {
        let a = snapshot_with_op().to_json().unwrap();
        let b = snapshot_with_op().to_json().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn reject_future_format_version() {
        let json = r#"{
            "formatVersion": 999,
            "operations": {},
            "openConflicts": {},
            "archivedConflicts": [],
            "lastSyncTimestamp": null,
            "nextSeq": 1
        }"#;

        assert!(matches!(
            SyncSnapshot::from_json(json),
            Err(SyncError::Serialization(_))
        ));
    }

    #[test]
    fn memory_storage_counts_saves() {
        let storage = MemoryStorage::new();
        assert!(storage.load().unwrap().is_none());

        storage.save(&snapshot_with_op()).unwrap();
        storage.save(&SyncSnapshot::new()).unwrap();

        assert_eq!(storage.save_count(), 2);
        assert_eq!(storage.load().unwrap(), Some(SyncSnapshot::new()));
    }

    #[test]
    fn memory_storage_injected_failure() {
        let storage = MemoryStorage::new();
        storage.fail_next_save();

        assert!(matches!(
            storage.save(&SyncSnapshot::new()),
            Err(SyncError::Storage(_))
        ));
        assert!(storage.save(&SyncSnapshot::new()).is_ok());
    }

    #[test]
    fn file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = JsonFileStorage::new(dir.path().join("state").join("sync.json"));

        assert!(storage.load().unwrap().is_none());

        let snapshot = snapshot_with_op();
        storage.save(&snapshot).unwrap();
        assert_eq!(storage.load().unwrap(), Some(snapshot));
        let leftovers = fs::read_dir(dir.path().join("state")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn concurrent_atomic_writes_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");

        std::thread::scope(|scope| {
            for writer in 0..8 {
                let path = &path;
                scope.spawn(move || {
                    for n in 0..25 {
                        let body = format!("{{\"writer\":{writer},\"n\":{n}}}");
                        write_atomic(path, body.as_bytes()).unwrap();
                    }
                });
            }
        });

        let last: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(last["n"], json!(24));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn file_storage_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        fs::write(&path, "not json").unwrap();

        let storage = JsonFileStorage::new(&path);
        assert!(matches!(storage.load(), Err(SyncError::Serialization(_))));
    }
}
