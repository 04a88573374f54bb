//! # Roam Sync
//!
//! An offline-first synchronization engine that reconciles a local data store
//! with a remote authoritative store across unreliable networks and several
//! devices.
//!
//! Local mutations are captured as operations in a durable queue. A sync cycle
//! drains that queue in entity-dependency order, sends operations to the remote
//! store in adaptively sized batches with bounded concurrency, detects
//! optimistic-concurrency conflicts, and resolves them with a selectable
//! strategy. A download phase then pulls remote changes since the last
//! watermark.
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! A [`SyncableEntity`] is a domain record under sync control. Every entity has
//! an [`EntityType`]; each type owns an [`EntityHandler`] in a static dispatch
//! table that knows how to validate, serialize and resolve it.
//!
//! ### Operations and the offline queue
//!
//! Each local change becomes a [`SyncOperation`] in the [`OfflineQueue`]. The
//! queue persists synchronously on every mutation, orders by priority and
//! creation time, and never hands out two in-flight operations for one entity.
//!
//! ### Dependency order
//!
//! The [`DependencyResolver`] turns the static [`DependencyGraph`] into a
//! deterministic type order: categories before tags, trips before notes, notes
//! before attachments and tracks.
//!
//! ### Conflicts
//!
//! The [`ConflictDetector`] compares local and remote versions field by field.
//! The [`ConflictResolver`] applies one of the [`ResolutionStrategy`] variants:
//! - [`ResolutionStrategy::LastWriteWins`]
//! - [`ResolutionStrategy::FieldLevelMerge`]
//! - [`ResolutionStrategy::DevicePriority`]
//! - [`ResolutionStrategy::ManualResolution`]
//!
//! ### State tracking
//!
//! The [`SyncStateTracker`] runs a small state machine per entity and feeds
//! [`SyncContext::sync_statistics`].
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use roam_sync::{
//!     EntityType, InMemoryRemote, MemoryLocalStore, OperationKind, SyncConfig, SyncContext,
//!     SyncableEntity,
//! };
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let remote = Arc::new(InMemoryRemote::new());
//! let local = Arc::new(MemoryLocalStore::new());
//! let context = SyncContext::builder(remote.clone(), local.clone())
//!     .config(SyncConfig::new("device-a"))
//!     .build()
//!     .unwrap();
//!
//! let category = SyncableEntity::new(EntityType::Category, json!({"name": "Food"}));
//! context
//!     .enqueue_local_change(category, OperationKind::Create)
//!     .unwrap();
//!
//! let result = context.run_sync_cycle().await.unwrap();
//! assert_eq!(result.succeeded, 1);
//! assert_eq!(context.sync_statistics().unwrap().pending_count, 0);
//! # });
//! ```
//!
//! ## Persistence
//!
//! Queue contents, conflict records and the sync watermark live in a
//! [`SyncSnapshot`] written through a [`SnapshotStorage`] implementation
//! ([`MemoryStorage`] or the atomic [`JsonFileStorage`]).

pub mod clock;
pub mod config;
pub mod conflict;
pub mod context;
pub mod coordinator;
pub mod dependency;
pub mod entity;
pub mod error;
pub mod local;
pub mod operation;
pub mod persist;
pub mod queue;
pub mod remote;
pub mod schema;
pub mod tracker;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{adaptive_batch_size, NetworkQuality, RetryConfig, SyncConfig};
pub use conflict::{
    ConflictDetection, ConflictDetector, ConflictRecord, ConflictResolver, ConflictResult,
    ConflictType, ResolutionStrategy, Winner,
};
pub use context::{SyncContext, SyncContextBuilder, SyncStatistics, SyncTrigger, TypeProgress};
pub use coordinator::SyncCycleResult;
pub use dependency::{DependencyGraph, DependencyNode, DependencyResolver};
pub use entity::{
    EntityHandler, EntityType, Reference, SyncPriority, SyncStatus, SyncableEntity,
};
pub use error::{SyncError, SyncResult};
pub use local::{LocalSnapshot, LocalStore, MemoryLocalStore};
pub use operation::{OperationKind, OperationStatus, SyncOperation, DEFAULT_MAX_RETRIES};
pub use persist::{
    JsonFileStorage, MemoryStorage, SnapshotStorage, SyncSnapshot, SNAPSHOT_FORMAT_VERSION,
};
pub use queue::{OfflineQueue, TypeCounts};
pub use remote::{
    InMemoryRemote, ItemOutcome, PullRequest, PullResponse, PushItem, RemoteEntity, RemoteStore,
};
pub use schema::{FieldDef, FieldType};
pub use tracker::{SyncEvent, SyncStateTracker, TrackedEntity};

/// Type aliases for clarity
pub type EntityId = String;
pub type RemoteId = String;
pub type OperationId = String;
pub type ConflictId = String;
pub type DeviceId = String;
pub type Version = u64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
