//! Syncable entities and the per-type dispatch table.
//!
//! Every [`EntityType`] maps to one static [`EntityHandler`]. The handler
//! carries what the engine needs to treat that type: its payload schema, its
//! cross-entity references, its base batch size, and two function pointers
//! (`serialize` and `apply_conflict_strategy`) resolved at compile time.

use crate::conflict::{ConflictResolver, ConflictResult, ResolutionStrategy};
use crate::schema::{self, FieldDef, FieldType};
use crate::{error::SyncResult, DeviceId, EntityId, RemoteId, SyncError, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// The fixed set of entity types under sync control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Category,
    Tag,
    Wishlist,
    Trip,
    Note,
    Attachment,
    Track,
}

impl EntityType {
    /// Every entity type, in declaration order.
    pub const ALL: [EntityType; 7] = [
        EntityType::Category,
        EntityType::Tag,
        EntityType::Wishlist,
        EntityType::Trip,
        EntityType::Note,
        EntityType::Attachment,
        EntityType::Track,
    ];

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Category => "category",
            EntityType::Tag => "tag",
            EntityType::Wishlist => "wishlist",
            EntityType::Trip => "trip",
            EntityType::Note => "note",
            EntityType::Attachment => "attachment",
            EntityType::Track => "track",
        }
    }

    /// The dispatch table entry for this type.
    pub fn handler(self) -> &'static EntityHandler {
        &HANDLERS[self as usize]
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SyncError::InvalidConfiguration(format!("unknown entity type: {s}")))
    }
}

/// Sync status of a single entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    InSync,
    NeedsUpload,
    NeedsDownload,
    Uploading,
    Downloading,
    Error,
    /// Metadata is synced but attached binary files are not yet uploaded.
    FilesPending,
    Conflict,
}

/// Scheduling priority; higher priorities leave the queue first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum SyncPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// A domain record under sync control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncableEntity {
    /// Opaque local identifier, always present
    pub local_id: EntityId,
    /// Identifier assigned by the remote store on first upload
    pub remote_id: Option<RemoteId>,
    pub entity_type: EntityType,
    /// Last version confirmed by the remote store
    pub version: Version,
    /// Time of the last mutation
    pub updated_at: Timestamp,
    pub sync_status: SyncStatus,
    pub sync_priority: SyncPriority,
    pub last_sync_attempt: Option<Timestamp>,
    pub sync_error_message: Option<String>,
    /// Domain fields (JSON object)
    pub payload: Value,
    /// Per-field contribution timestamps; missing fields fall back to `updated_at`
    #[serde(default)]
    pub field_timestamps: BTreeMap<String, Timestamp>,
    /// Logical delete (tombstone)
    #[serde(default)]
    pub deleted: bool,
    /// Device that produced the current state
    #[serde(default)]
    pub origin_device: DeviceId,
}

impl SyncableEntity {
    /// Create a new, never-synced entity with a fresh local id.
    pub fn new(entity_type: EntityType, payload: Value) -> Self {
        Self {
            local_id: uuid::Uuid::now_v7().to_string(),
            remote_id: None,
            entity_type,
            version: 0,
            updated_at: 0,
            sync_status: SyncStatus::NeedsUpload,
            sync_priority: SyncPriority::Normal,
            last_sync_attempt: None,
            sync_error_message: None,
            payload,
            field_timestamps: BTreeMap::new(),
            deleted: false,
            origin_device: DeviceId::new(),
        }
    }

    /// Use a caller-chosen local id.
    pub fn with_local_id(mut self, local_id: impl Into<EntityId>) -> Self {
        self.local_id = local_id.into();
        self
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: SyncPriority) -> Self {
        self.sync_priority = priority;
        self
    }

    /// The dispatch table entry for this entity's type.
    pub fn handler(&self) -> &'static EntityHandler {
        self.entity_type.handler()
    }

    /// Get a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Payload fields as a map (empty for non-object payloads).
    pub fn fields(&self) -> Map<String, Value> {
        self.payload.as_object().cloned().unwrap_or_default()
    }

    /// When `name` was last written.
    pub fn field_timestamp(&self, name: &str) -> Timestamp {
        self.field_timestamps
            .get(name)
            .copied()
            .unwrap_or(self.updated_at)
    }

    /// Stamp every payload field with `timestamp`.
    pub fn stamp_all_fields(&mut self, timestamp: Timestamp) {
        self.field_timestamps = self
            .fields()
            .keys()
            .map(|name| (name.clone(), timestamp))
            .collect();
        self.updated_at = timestamp;
    }

    /// Replace the payload with a local edit.
    ///
    /// Only fields whose value changed (including removed fields) receive the
    /// new contribution timestamp.
    pub fn apply_local_change(&mut self, payload: Value, timestamp: Timestamp, device: &str) {
        let before = self.fields();
        let after = payload.as_object().cloned().unwrap_or_default();
        let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

        for name in names {
            if before.get(name) != after.get(name) {
                self.field_timestamps.insert(name.clone(), timestamp);
            }
        }

        self.payload = payload;
        self.updated_at = timestamp;
        self.origin_device = device.to_string();
        self.sync_status = SyncStatus::NeedsUpload;
    }

    /// Mark the entity as logically deleted.
    pub fn mark_deleted(&mut self, timestamp: Timestamp, device: &str) {
        self.deleted = true;
        self.updated_at = timestamp;
        self.origin_device = device.to_string();
        self.sync_status = SyncStatus::NeedsUpload;
    }

    /// Check that the entity can be sent to the remote store.
    pub fn validate_for_sync(&self) -> SyncResult<()> {
        if self.local_id.trim().is_empty() {
            return Err(SyncError::validation("entity has an empty local id"));
        }
        if self.deleted {
            return Ok(());
        }
        schema::validate_payload(self.handler().fields, &self.payload)
            .map_err(|e| match e {
                SyncError::ValidationFailed(msg) => SyncError::validation(format!(
                    "{} {}: {msg}",
                    self.entity_type, self.local_id
                )),
                other => other,
            })
    }

    /// Payload without fields that only make sense on this device.
    pub fn synced_payload(&self) -> Value {
        let mut fields = self.fields();
        for name in self.handler().local_only {
            fields.remove(*name);
        }
        Value::Object(fields)
    }

    /// True for file-backed entities whose file has not been uploaded yet.
    pub fn has_pending_files(&self) -> bool {
        self.handler().has_files
            && !self.deleted
            && self.field("localPath").is_some_and(|v| !v.is_null())
    }
}

/// A payload field holding the id of another entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub field: &'static str,
    pub target: EntityType,
}

/// Builds the wire payload for an entity.
pub type SerializeFn = fn(&SyncableEntity) -> SyncResult<Value>;

/// Resolves a local/remote divergence for one entity type.
pub type ConflictStrategyFn = fn(
    &ConflictResolver,
    &SyncableEntity,
    &SyncableEntity,
    ResolutionStrategy,
) -> SyncResult<ConflictResult>;

/// Static per-type behavior.
pub struct EntityHandler {
    pub entity_type: EntityType,
    /// Tie-break rank for dependency ordering
    pub rank: u32,
    /// Batch size at `NetworkQuality::Good`
    pub base_batch_size: usize,
    /// Entity carries a binary file uploaded out of band
    pub has_files: bool,
    pub fields: &'static [FieldDef],
    /// Fields never sent to the remote store
    pub local_only: &'static [&'static str],
    pub references: &'static [Reference],
    pub default_strategy: ResolutionStrategy,
    pub serialize: SerializeFn,
    pub apply_conflict_strategy: ConflictStrategyFn,
}

impl fmt::Debug for EntityHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityHandler")
            .field("entity_type", &self.entity_type)
            .field("rank", &self.rank)
            .field("base_batch_size", &self.base_batch_size)
            .field("has_files", &self.has_files)
            .field("references", &self.references)
            .field("default_strategy", &self.default_strategy)
            .finish_non_exhaustive()
    }
}

fn serialize_fields(entity: &SyncableEntity) -> SyncResult<Value> {
    entity.validate_for_sync()?;
    Ok(entity.synced_payload())
}

fn resolve_record(
    resolver: &ConflictResolver,
    local: &SyncableEntity,
    remote: &SyncableEntity,
    strategy: ResolutionStrategy,
) -> SyncResult<ConflictResult> {
    resolver.resolve(local, remote, strategy)
}

/// File-backed entities cannot mix metadata from two different files.
fn resolve_file_record(
    resolver: &ConflictResolver,
    local: &SyncableEntity,
    remote: &SyncableEntity,
    strategy: ResolutionStrategy,
) -> SyncResult<ConflictResult> {
    let same_file = local.field("fileHash") == remote.field("fileHash");
    if strategy == ResolutionStrategy::FieldLevelMerge && !same_file {
        let mut result = resolver.resolve(local, remote, ResolutionStrategy::LastWriteWins)?;
        result.details = format!("file content differs, resolved whole: {}", result.details);
        return Ok(result);
    }
    resolver.resolve(local, remote, strategy)
}

const CATEGORY_FIELDS: &[FieldDef] = &[
    FieldDef::required("name", FieldType::String),
    FieldDef::optional("color", FieldType::String),
    FieldDef::optional("icon", FieldType::String),
];

const TAG_FIELDS: &[FieldDef] = &[
    FieldDef::required("name", FieldType::String),
    FieldDef::required("categoryId", FieldType::String),
];

const WISHLIST_FIELDS: &[FieldDef] = &[
    FieldDef::required("title", FieldType::String),
    FieldDef::optional("categoryId", FieldType::String),
    FieldDef::optional("notes", FieldType::String),
    FieldDef::optional("priority", FieldType::Int),
];

const TRIP_FIELDS: &[FieldDef] = &[
    FieldDef::required("title", FieldType::String),
    FieldDef::optional("startDate", FieldType::Timestamp),
    FieldDef::optional("endDate", FieldType::Timestamp),
    FieldDef::optional("notes", FieldType::String),
];

const NOTE_FIELDS: &[FieldDef] = &[
    FieldDef::required("tripId", FieldType::String),
    FieldDef::required("body", FieldType::String),
    FieldDef::optional("title", FieldType::String),
    FieldDef::optional("tags", FieldType::Json),
];

const ATTACHMENT_FIELDS: &[FieldDef] = &[
    FieldDef::required("noteId", FieldType::String),
    FieldDef::required("fileName", FieldType::String),
    FieldDef::optional("fileHash", FieldType::String),
    FieldDef::optional("mimeType", FieldType::String),
    FieldDef::optional("sizeBytes", FieldType::Int),
    FieldDef::optional("localPath", FieldType::String),
];

const TRACK_FIELDS: &[FieldDef] = &[
    FieldDef::required("noteId", FieldType::String),
    FieldDef::required("fileName", FieldType::String),
    FieldDef::optional("fileHash", FieldType::String),
    FieldDef::optional("durationMs", FieldType::Int),
    FieldDef::optional("distanceMeters", FieldType::Float),
    FieldDef::optional("localPath", FieldType::String),
];

const FILE_LOCAL_ONLY: &[&str] = &["localPath"];

const CATEGORY_REF: &[Reference] = &[Reference {
    field: "categoryId",
    target: EntityType::Category,
}];

const TRIP_REF: &[Reference] = &[Reference {
    field: "tripId",
    target: EntityType::Trip,
}];

const NOTE_REF: &[Reference] = &[Reference {
    field: "noteId",
    target: EntityType::Note,
}];

// Indexed by `EntityType as usize`.
static HANDLERS: [EntityHandler; 7] = [
    EntityHandler {
        entity_type: EntityType::Category,
        rank: 0,
        base_batch_size: 50,
        has_files: false,
        fields: CATEGORY_FIELDS,
        local_only: &[],
        references: &[],
        default_strategy: ResolutionStrategy::LastWriteWins,
        serialize: serialize_fields,
        apply_conflict_strategy: resolve_record,
    },
    EntityHandler {
        entity_type: EntityType::Tag,
        rank: 1,
        base_batch_size: 50,
        has_files: false,
        fields: TAG_FIELDS,
        local_only: &[],
        references: CATEGORY_REF,
        default_strategy: ResolutionStrategy::LastWriteWins,
        serialize: serialize_fields,
        apply_conflict_strategy: resolve_record,
    },
    EntityHandler {
        entity_type: EntityType::Wishlist,
        rank: 2,
        base_batch_size: 25,
        has_files: false,
        fields: WISHLIST_FIELDS,
        local_only: &[],
        references: CATEGORY_REF,
        default_strategy: ResolutionStrategy::FieldLevelMerge,
        serialize: serialize_fields,
        apply_conflict_strategy: resolve_record,
    },
    EntityHandler {
        entity_type: EntityType::Trip,
        rank: 3,
        base_batch_size: 20,
        has_files: false,
        fields: TRIP_FIELDS,
        local_only: &[],
        references: &[],
        default_strategy: ResolutionStrategy::FieldLevelMerge,
        serialize: serialize_fields,
        apply_conflict_strategy: resolve_record,
    },
    EntityHandler {
        entity_type: EntityType::Note,
        rank: 4,
        base_batch_size: 20,
        has_files: false,
        fields: NOTE_FIELDS,
        local_only: &[],
        references: TRIP_REF,
        default_strategy: ResolutionStrategy::FieldLevelMerge,
        serialize: serialize_fields,
        apply_conflict_strategy: resolve_record,
    },
    EntityHandler {
        entity_type: EntityType::Attachment,
        rank: 5,
        base_batch_size: 5,
        has_files: true,
        fields: ATTACHMENT_FIELDS,
        local_only: FILE_LOCAL_ONLY,
        references: NOTE_REF,
        default_strategy: ResolutionStrategy::LastWriteWins,
        serialize: serialize_fields,
        apply_conflict_strategy: resolve_file_record,
    },
    EntityHandler {
        entity_type: EntityType::Track,
        rank: 6,
        base_batch_size: 5,
        has_files: true,
        fields: TRACK_FIELDS,
        local_only: FILE_LOCAL_ONLY,
        references: NOTE_REF,
        default_strategy: ResolutionStrategy::LastWriteWins,
        serialize: serialize_fields,
        apply_conflict_strategy: resolve_file_record,
    },
];
