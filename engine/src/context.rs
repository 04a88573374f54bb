//! The engine's public entry point.
//!
//! A [`SyncContext`] owns the queue, the state tracker and the coordinator,
//! and exposes the operations an application calls: record a local change,
//! run or trigger a sync cycle, inspect progress and resolve conflicts.
//!
//! Only one cycle runs at a time. A caller that asks for a cycle while one is
//! in flight joins it and receives the same result.

use crate::coordinator::{Coordinator, Settled, SyncCycleResult};
use crate::persist::{MemoryStorage, SnapshotStorage};
use crate::{
    error::SyncResult, Clock, ConflictRecord, ConflictResult, DependencyGraph,
    DependencyResolver, EntityId, EntityType, LocalStore, NetworkQuality, OfflineQueue,
    OperationId, OperationKind, OperationStatus, RemoteStore, ResolutionStrategy, SyncConfig,
    SyncError, SyncEvent, SyncOperation, SyncStateTracker, SyncStatus, SyncableEntity,
    SystemClock, Timestamp,
};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Why a sync cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncTrigger {
    Timer,
    AppForeground,
    NetworkRecovered,
    UserAction,
}

/// Progress of one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeProgress {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// Entities parked in `Conflict`
    pub conflicted: usize,
}

/// Snapshot of the engine's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    /// Operations waiting to be sent or in flight
    pub pending_count: usize,
    pub last_sync_timestamp: Option<Timestamp>,
    pub per_type_progress: BTreeMap<EntityType, TypeProgress>,
    pub open_conflicts: usize,
    /// Entities whose sync ended in `Error`
    pub failed_entities: Vec<EntityId>,
    pub conflicted_entities: Vec<EntityId>,
}

type CycleOutcome = Option<SyncResult<SyncCycleResult>>;

/// Builder for [`SyncContext`].
#[derive(Debug)]
pub struct SyncContextBuilder {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    config: SyncConfig,
    storage: Option<Arc<dyn SnapshotStorage>>,
    clock: Option<Arc<dyn Clock>>,
    graph: Option<DependencyGraph>,
}

impl SyncContextBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Where the queue is persisted. Defaults to memory.
    pub fn storage(mut self, storage: Arc<dyn SnapshotStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the standard dependency graph. Every entity type must appear.
    pub fn graph(mut self, graph: DependencyGraph) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Validate the configuration, resolve the type order and open the queue.
    ///
    /// Fails with `CyclicDependency` if the graph has a cycle.
    pub fn build(self) -> SyncResult<SyncContext> {
        self.config.validate()?;

        let graph = self.graph.unwrap_or_else(DependencyGraph::standard);
        if let Some(missing) = EntityType::ALL.iter().find(|t| graph.get(**t).is_none()) {
            return Err(SyncError::InvalidConfiguration(format!(
                "dependency graph has no node for {missing}"
            )));
        }
        let resolver = Arc::new(DependencyResolver::new(graph)?);

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let queue = OfflineQueue::open(storage, resolver.clone())?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let core = Coordinator::new(
            self.config,
            queue,
            self.local,
            self.remote,
            resolver,
            clock,
        );

        let mut tracked = 0;
        for entity_type in EntityType::ALL {
            for entity in core.local.list(entity_type)? {
                core.tracker
                    .track(entity.local_id.clone(), entity_type, entity.sync_status);
                tracked += 1;
            }
        }

        tracing::info!(
            device_id = %core.config.device_id,
            order = ?core.resolver.resolve_order(),
            tracked,
            pending = core.queue.pending_count(),
            "sync context ready"
        );

        Ok(SyncContext {
            core: Arc::new(core),
            in_flight: Mutex::new(None),
        })
    }
}

/// Clears the single-flight slot when the leading cycle ends or is dropped.
struct FlightGuard<'a> {
    slot: &'a Mutex<Option<watch::Receiver<CycleOutcome>>>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
    }
}

enum Role {
    Leader(watch::Sender<CycleOutcome>),
    Follower(watch::Receiver<CycleOutcome>),
}

/// Offline-first sync engine for one device.
#[derive(Debug)]
pub struct SyncContext {
    core: Arc<Coordinator>,
    in_flight: Mutex<Option<watch::Receiver<CycleOutcome>>>,
}

impl SyncContext {
    pub fn builder(remote: Arc<dyn RemoteStore>, local: Arc<dyn LocalStore>) -> SyncContextBuilder {
        SyncContextBuilder {
            remote,
            local,
            config: SyncConfig::default(),
            storage: None,
            clock: None,
            graph: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.core.config
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.core.queue
    }

    pub fn tracker(&self) -> &SyncStateTracker {
        &self.core.tracker
    }

    pub fn resolver(&self) -> &DependencyResolver {
        &self.core.resolver
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.core.local
    }

    pub fn network_quality(&self) -> NetworkQuality {
        self.core.network_quality()
    }

    /// Record a local mutation and queue it for upload.
    ///
    /// Earlier operations of the entity that are not in flight are replaced:
    /// an upload always sends the entity's current state. Deleting an entity
    /// that never reached the remote store drops it locally and returns
    /// `None`.
    pub fn enqueue_local_change(
        &self,
        entity: SyncableEntity,
        kind: OperationKind,
    ) -> SyncResult<Option<OperationId>> {
        if entity.local_id.trim().is_empty() {
            return Err(SyncError::validation("entity has an empty local id"));
        }
        let core = &self.core;
        let id = entity.local_id.clone();
        let now = core.now();
        let device = core.config.device_id.clone();

        if core.queue.open_conflict_for_entity(&id).is_some() {
            return Err(SyncError::ConflictDetected(id));
        }

        let in_flight = core
            .queue
            .operations_for_entity(&id)
            .iter()
            .any(|op| op.status == OperationStatus::InProgress);

        let stored = match kind {
            OperationKind::Create => {
                if core.local.exists(&id)? {
                    return Err(SyncError::validation(format!("entity {id} already exists")));
                }
                let mut created = entity;
                created.remote_id = None;
                created.version = 0;
                created.deleted = false;
                created.origin_device = device;
                created.sync_status = SyncStatus::NeedsUpload;
                created.stamp_all_fields(now);
                core.local.put(created.clone())?;
                created
            }
            OperationKind::Update => {
                let current = core
                    .local
                    .get(&id)?
                    .ok_or_else(|| SyncError::EntityNotFound(id.clone()))?;
                if current.deleted {
                    return Err(SyncError::validation(format!("entity {id} is deleted")));
                }
                core.local.update(&id, &mut |stored| {
                    stored.apply_local_change(entity.payload.clone(), now, &device);
                    stored.sync_priority = entity.sync_priority;
                    Ok(())
                })?
            }
            OperationKind::Delete => {
                let current = core
                    .local
                    .get(&id)?
                    .ok_or_else(|| SyncError::EntityNotFound(id.clone()))?;
                if current.remote_id.is_none() && !in_flight {
                    core.queue.cancel_for_entity(&id)?;
                    core.local.remove(&id)?;
                    core.tracker.forget(&id);
                    tracing::debug!(entity_id = %id, "unsynced entity dropped");
                    return Ok(None);
                }
                core.local.update(&id, &mut |stored| {
                    stored.mark_deleted(now, &device);
                    Ok(())
                })?
            }
        };

        let superseded = core.queue.cancel_for_entity(&id)?;
        let kind = match (kind, &stored.remote_id) {
            (OperationKind::Delete, _) => OperationKind::Delete,
            (_, Some(_)) => OperationKind::Update,
            (_, None) if in_flight => OperationKind::Update,
            (_, None) => OperationKind::Create,
        };
        let op = SyncOperation::for_entity(&stored, kind, now)
            .with_max_retries(core.config.max_retries);
        let op_id = core.queue.enqueue(op)?;
        core.track(&id, stored.entity_type, SyncEvent::LocalChange);

        tracing::debug!(
            op_id = %op_id,
            entity_id = %id,
            entity_type = %stored.entity_type,
            ?kind,
            superseded = superseded.len(),
            "local change queued"
        );
        Ok(Some(op_id))
    }

    /// Run one sync cycle, or join the one already running.
    ///
    /// Dropping the leading caller's future abandons the cycle; callers that
    /// joined it receive [`SyncError::Cancelled`].
    pub async fn run_sync_cycle(&self) -> SyncResult<SyncCycleResult> {
        let role = {
            let mut slot = self.in_flight.lock();
            match slot.as_ref() {
                Some(receiver) => Role::Follower(receiver.clone()),
                None => {
                    let (sender, receiver) = watch::channel(None);
                    *slot = Some(receiver);
                    Role::Leader(sender)
                }
            }
        };

        match role {
            Role::Leader(sender) => {
                let _guard = FlightGuard {
                    slot: &self.in_flight,
                };
                let result = self.core.run_cycle().await;
                sender.send_replace(Some(result.clone()));
                result
            }
            Role::Follower(mut receiver) => {
                tracing::debug!("joining in-flight sync cycle");
                loop {
                    let published = receiver.borrow_and_update().clone();
                    if let Some(result) = published {
                        return result;
                    }
                    if receiver.changed().await.is_err() {
                        return receiver
                            .borrow()
                            .clone()
                            .unwrap_or(Err(SyncError::Cancelled));
                    }
                }
            }
        }
    }

    /// Run a cycle on behalf of an external trigger.
    pub async fn trigger_sync_cycle(&self, trigger: SyncTrigger) -> SyncResult<SyncCycleResult> {
        tracing::info!(?trigger, "sync triggered");
        self.run_sync_cycle().await
    }

    /// Stop the running cycle at the next batch boundary.
    pub fn cancel_sync(&self) {
        self.core.cancel();
    }

    pub fn set_network_quality(&self, quality: NetworkQuality) {
        tracing::info!(?quality, "network quality changed");
        self.core.set_network_quality(quality);
    }

    pub fn sync_statistics(&self) -> SyncResult<SyncStatistics> {
        let core = &self.core;
        let counts = core.queue.counts_by_type();
        let tracked = core.tracker.counts();

        let per_type_progress = core
            .resolver
            .resolve_order()
            .into_iter()
            .map(|entity_type| {
                let ops = counts.get(&entity_type).copied().unwrap_or_default();
                let progress = TypeProgress {
                    pending: ops.pending,
                    in_progress: ops.in_progress,
                    completed: ops.completed,
                    failed: ops.failed,
                    conflicted: tracked
                        .get(&(entity_type, SyncStatus::Conflict))
                        .copied()
                        .unwrap_or(0),
                };
                (entity_type, progress)
            })
            .collect();

        Ok(SyncStatistics {
            pending_count: core.queue.pending_count(),
            last_sync_timestamp: core.queue.last_sync_timestamp(),
            per_type_progress,
            open_conflicts: core.queue.open_conflicts().len(),
            failed_entities: core.tracker.entities_in(SyncStatus::Error),
            conflicted_entities: core.tracker.entities_in(SyncStatus::Conflict),
        })
    }

    pub fn open_conflicts(&self) -> Vec<ConflictRecord> {
        self.core.queue.open_conflicts()
    }

    /// Resolve a parked conflict.
    ///
    /// With `manual_payload` the payload becomes the entity's new state;
    /// otherwise `strategy` is applied to the local entity and the remote
    /// version recorded with the conflict. The result is queued for upload
    /// unless it matches the remote version.
    pub fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        manual_payload: Option<Value>,
    ) -> SyncResult<ConflictResult> {
        let core = &self.core;
        let record = core
            .queue
            .open_conflict(conflict_id)
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        let local = core
            .local
            .get(&record.entity_id)?
            .ok_or_else(|| SyncError::EntityNotFound(record.entity_id.clone()))?;
        let theirs = record.remote_snapshot.clone();
        let now = core.now();

        let result = match manual_payload {
            Some(payload) => core
                .conflicts
                .resolve_with_payload(&local, &theirs, payload, now)?,
            None if strategy == ResolutionStrategy::ManualResolution => {
                return Err(SyncError::InvalidConfiguration(
                    "manual resolution needs a payload".into(),
                ));
            }
            None => (local.handler().apply_conflict_strategy)(
                &core.conflicts,
                &local,
                &theirs,
                strategy,
            )?,
        };

        core.queue.archive_conflict(conflict_id, &result, "user", now)?;
        core.track(&local.local_id, local.entity_type, SyncEvent::Resolved);

        match core.settle(&local, &theirs, result.resolved_entity.clone())? {
            Settled::AdoptedRemote => {
                core.queue.cancel_for_entity(&local.local_id)?;
            }
            Settled::NeedsUpload(entity) => {
                core.requeue(&entity)?;
            }
        }

        tracing::info!(
            %conflict_id,
            entity_id = %local.local_id,
            strategy = %result.strategy,
            winner = ?result.winner,
            "conflict resolved"
        );
        Ok(result)
    }

    /// Manual retry: give every failed operation a fresh retry budget.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        let core = &self.core;
        let count = core.queue.retry_failed()?;

        for entity_id in core.tracker.entities_in(SyncStatus::Error) {
            if let Some(tracked) = core.tracker.get(&entity_id) {
                core.track(&entity_id, tracked.entity_type, SyncEvent::ManualRetry);
            }
            if core.local.exists(&entity_id)? {
                core.local.update(&entity_id, &mut |entity| {
                    if entity.sync_status == SyncStatus::Error {
                        entity.sync_status = SyncStatus::NeedsUpload;
                        entity.sync_error_message = None;
                    }
                    Ok(())
                })?;
            }
        }

        tracing::info!(count, "failed operations requeued");
        Ok(count)
    }

    /// The binary files of a `FilesPending` entity reached the remote store.
    pub fn mark_files_uploaded(&self, local_id: &str) -> SyncResult<()> {
        let core = &self.core;
        let updated = core.local.update(local_id, &mut |entity| {
            if entity.sync_status != SyncStatus::FilesPending {
                return Err(SyncError::InvalidTransition {
                    from: format!("{:?}", entity.sync_status),
                    event: "FilesUploaded".into(),
                });
            }
            entity.sync_status = SyncStatus::InSync;
            Ok(())
        })?;
        core.track(local_id, updated.entity_type, SyncEvent::FilesUploaded);
        Ok(())
    }
}
