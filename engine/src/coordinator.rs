//! Batch sync coordinator.
//!
//! One cycle runs two phases over the entity types in dependency order:
//!
//! 1. **Upload**: queued operations of a type are drained into batches sized
//!    by [`adaptive_batch_size`]. Each operation of a batch runs in its own
//!    tokio task, bounded by a semaphore of `concurrency_limit` permits. A type
//!    only starts once every batch of the previous type has finished.
//! 2. **Download**: remote changes since the watermark are pulled page by
//!    page and applied to the local store.
//!
//! Per-operation failures never fail the batch. A batch whose every operation
//! fails with a network error aborts the cycle: the remote is unreachable.
//! The watermark advances only after a cycle that left nothing behind.

use crate::config::adaptive_batch_size;
use crate::conflict::{keep_local_only_fields, ConflictDetector, ConflictRecord, ConflictResolver};
use crate::remote::{ItemOutcome, PullRequest, PushItem, RemoteEntity, RemoteStore};
use crate::{
    error::SyncResult, Clock, DependencyResolver, EntityId, EntityType, LocalStore,
    NetworkQuality, OfflineQueue, OperationId, OperationKind, OperationStatus, RemoteId,
    SyncConfig, SyncError, SyncEvent, SyncOperation, SyncStateTracker, SyncStatus, SyncableEntity,
    Timestamp, Version,
};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleResult {
    /// Operations acknowledged by the remote store
    pub succeeded: usize,
    /// Conflicts met on upload or download
    pub conflicted: usize,
    /// Operations that ended `Failed`
    pub failed: usize,
    /// Operations postponed until a prerequisite is synced
    pub deferred: usize,
    /// Remote changes written to the local store
    pub downloaded: usize,
    pub watermark_advanced: bool,
    pub last_sync_timestamp: Option<Timestamp>,
    pub duration: Duration,
}

/// Consecutive network failures, in batches where nothing else happened,
/// after which the remote store counts as unreachable.
const UNREACHABLE_AFTER: usize = 2;

#[derive(Debug)]
enum OpOutcome {
    Succeeded,
    Conflicted,
    /// Sent again with a rebased version
    Rebased,
    Deferred,
    /// Back in the queue with one retry charged
    Retrying(SyncError),
    Failed(SyncError),
}

impl OpOutcome {
    fn is_network_failure(&self) -> bool {
        matches!(
            self,
            OpOutcome::Retrying(SyncError::Network(_)) | OpOutcome::Failed(SyncError::Network(_))
        )
    }
}

enum DownloadOutcome {
    Applied,
    Skipped,
    Conflicted,
}

/// What a conflict resolution left in the local store.
pub(crate) enum Settled {
    /// The local entity now matches the remote one
    AdoptedRemote,
    /// The resolved entity differs from the remote one and must be uploaded
    NeedsUpload(SyncableEntity),
}

/// Shared engine state driven by a [`SyncContext`](crate::SyncContext).
#[derive(Debug)]
pub(crate) struct Coordinator {
    pub(crate) config: SyncConfig,
    pub(crate) queue: OfflineQueue,
    pub(crate) local: Arc<dyn LocalStore>,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) tracker: SyncStateTracker,
    pub(crate) resolver: Arc<DependencyResolver>,
    pub(crate) conflicts: ConflictResolver,
    pub(crate) clock: Arc<dyn Clock>,
    detector: ConflictDetector,
    quality: RwLock<NetworkQuality>,
    cancelled: AtomicBool,
    permits: Arc<Semaphore>,
}

impl Coordinator {
    pub(crate) fn new(
        config: SyncConfig,
        queue: OfflineQueue,
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        resolver: Arc<DependencyResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker: SyncStateTracker::new(config.max_retries),
            conflicts: ConflictResolver::new()
                .with_device_priorities(config.device_priorities.clone()),
            detector: ConflictDetector::new(),
            quality: RwLock::new(config.network_quality),
            cancelled: AtomicBool::new(false),
            permits: Arc::new(Semaphore::new(config.concurrency_limit)),
            config,
            queue,
            local,
            remote,
            resolver,
            clock,
        }
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    pub(crate) fn network_quality(&self) -> NetworkQuality {
        *self.quality.read()
    }

    pub(crate) fn set_network_quality(&self, quality: NetworkQuality) {
        *self.quality.write() = quality;
    }

    /// Ask the running cycle to stop at the next batch boundary.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    /// Feed an event to the state tracker. The tracker is advisory: an event
    /// that does not fit the current state is logged and dropped.
    pub(crate) fn track(&self, entity_id: &str, entity_type: EntityType, event: SyncEvent) {
        if let Err(err) = self.tracker.apply(entity_id, entity_type, event) {
            tracing::debug!(entity_id, error = %err, "state tracker ignored event");
        }
    }

    pub(crate) async fn run_cycle(self: &Arc<Self>) -> SyncResult<SyncCycleResult> {
        let started = Instant::now();
        self.cancelled.store(false, Ordering::SeqCst);

        tracing::info!(
            pending = self.queue.pending_count(),
            quality = ?self.network_quality(),
            "sync cycle started"
        );

        let mut result = SyncCycleResult::default();
        match self.cycle(&mut result).await {
            Ok(()) => {}
            Err(SyncError::Cancelled) => {
                tracing::warn!(succeeded = result.succeeded, "sync cycle cancelled");
                return Err(SyncError::Cancelled);
            }
            Err(err) => {
                tracing::error!(error = %err, succeeded = result.succeeded, "sync cycle aborted");
                return Err(err);
            }
        }

        result.last_sync_timestamp = self.queue.last_sync_timestamp();
        result.duration = started.elapsed();

        tracing::info!(
            succeeded = result.succeeded,
            conflicted = result.conflicted,
            failed = result.failed,
            deferred = result.deferred,
            downloaded = result.downloaded,
            watermark_advanced = result.watermark_advanced,
            duration_ms = result.duration.as_millis() as u64,
            "sync cycle finished"
        );
        Ok(result)
    }

    async fn cycle(self: &Arc<Self>, result: &mut SyncCycleResult) -> SyncResult<()> {
        // Finished operations from earlier cycles are only history by now.
        let pruned = self.queue.prune_completed()?;
        if pruned > 0 {
            tracing::debug!(pruned, "dropped finished operations");
        }

        let order = self.resolver.resolve_order();
        let mut clean = true;

        for &entity_type in &order {
            clean &= self.upload_type(entity_type, result).await?;
        }

        // Writes that land while later types are pulled must stay above the
        // watermark, so it is the earliest first-page server time.
        let mut server_time: Option<Timestamp> = None;
        for &entity_type in &order {
            let (type_clean, type_time) = self.download_type(entity_type, result).await?;
            clean &= type_clean;
            server_time = match (server_time, type_time) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        }

        if let (true, Some(server_time)) = (clean, server_time) {
            self.queue.set_last_sync_timestamp(server_time)?;
            result.watermark_advanced = true;
        }
        Ok(())
    }

    // Upload

    /// Upload every eligible operation of one type. Returns false if anything
    /// was left behind.
    async fn upload_type(
        self: &Arc<Self>,
        entity_type: EntityType,
        result: &mut SyncCycleResult,
    ) -> SyncResult<bool> {
        self.check_cancelled()?;
        if !self.queue.has_pending(entity_type) {
            return Ok(true);
        }

        if let Err(err) = self.resolver.check_ready(entity_type, self.local.as_ref()) {
            if !matches!(err, SyncError::DependencyNotMet { .. }) {
                return Err(err);
            }
            let waiting = self
                .queue
                .counts_by_type()
                .get(&entity_type)
                .map_or(0, |counts| counts.pending);
            tracing::warn!(%entity_type, waiting, error = %err, "entity type skipped this cycle");
            result.deferred += waiting;
            return Ok(false);
        }

        let batch_size = adaptive_batch_size(entity_type, self.network_quality());
        let mut dispatched: HashMap<OperationId, u32> = HashMap::new();
        let mut excluded: HashSet<OperationId> = HashSet::new();
        let mut clean = true;
        let mut network_failures = 0usize;

        loop {
            self.check_cancelled()?;
            let batch = self.queue.drain_batch(batch_size, |op| {
                op.entity_type == entity_type && !excluded.contains(&op.id)
            })?;
            if batch.is_empty() {
                break;
            }

            for op in &batch {
                let count = dispatched.entry(op.id.clone()).or_default();
                *count += 1;
                if *count > op.max_retries {
                    excluded.insert(op.id.clone());
                }
            }

            tracing::debug!(%entity_type, size = batch.len(), "dispatching batch");
            let outcomes = self.dispatch_batch(batch).await;
            if outcomes.iter().all(|(_, outcome)| outcome.is_network_failure()) {
                network_failures += outcomes.len();
            } else {
                network_failures = 0;
            }
            let unreachable = network_failures >= UNREACHABLE_AFTER;

            for (id, outcome) in outcomes {
                match outcome {
                    OpOutcome::Succeeded => result.succeeded += 1,
                    OpOutcome::Conflicted => result.conflicted += 1,
                    OpOutcome::Rebased | OpOutcome::Retrying(_) => {}
                    OpOutcome::Deferred => {
                        result.deferred += 1;
                        excluded.insert(id);
                        clean = false;
                    }
                    OpOutcome::Failed(_) => {
                        result.failed += 1;
                        clean = false;
                    }
                }
            }

            if unreachable {
                return Err(SyncError::network(format!(
                    "remote unreachable while uploading {entity_type}"
                )));
            }
        }

        if self.queue.has_pending(entity_type) {
            clean = false;
        }
        Ok(clean)
    }

    async fn dispatch_batch(
        self: &Arc<Self>,
        batch: Vec<SyncOperation>,
    ) -> Vec<(OperationId, OpOutcome)> {
        let ids: Vec<OperationId> = batch.iter().map(|op| op.id.clone()).collect();

        let tasks = batch.into_iter().map(|op| {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = this.permits.clone().acquire_owned().await;
                this.upload_op(op).await
            })
        });
        let joined = join_all(tasks).await;

        ids.into_iter()
            .zip(joined)
            .map(|(id, joined)| {
                let outcome = joined.unwrap_or_else(|err| {
                    tracing::error!(op_id = %id, error = %err, "upload task aborted");
                    if let Err(release) = self.queue.release(&id, Some("upload task aborted")) {
                        tracing::warn!(op_id = %id, error = %release, "could not release operation");
                    }
                    OpOutcome::Retrying(SyncError::TransactionFailed(format!(
                        "upload task aborted: {err}"
                    )))
                });
                (id, outcome)
            })
            .collect()
    }

    async fn upload_op(&self, op: SyncOperation) -> OpOutcome {
        self.track(&op.entity_id, op.entity_type, SyncEvent::BeginUpload);
        match self.try_upload(&op).await {
            Ok(outcome) => outcome,
            Err(err) => self.fail_op(&op, err),
        }
    }

    async fn try_upload(&self, op: &SyncOperation) -> SyncResult<OpOutcome> {
        let entity = self
            .local
            .get(&op.entity_id)?
            .ok_or_else(|| SyncError::EntityNotFound(op.entity_id.clone()))?;

        let kind = match (op.kind, &entity.remote_id) {
            (OperationKind::Delete, None) => {
                // Never reached the remote store; nothing to delete there.
                self.local.remove(&op.entity_id)?;
                self.queue.mark_completed(&op.id)?;
                self.tracker.forget(&op.entity_id);
                return Ok(OpOutcome::Succeeded);
            }
            (OperationKind::Update, None) => OperationKind::Create,
            (kind, _) => kind,
        };

        let mut payload = (entity.handler().serialize)(&entity)?;
        self.outbound_references(entity.entity_type, &mut payload)?;

        let delay = self.config.retry.delay_for_attempt(op.retry_count);
        if !delay.is_zero() {
            tracing::debug!(op_id = %op.id, retry = op.retry_count, ?delay, "backing off");
            tokio::time::sleep(delay).await;
        }

        let item = PushItem {
            entity_type: entity.entity_type,
            kind,
            entity_id: entity.local_id.clone(),
            remote_id: entity.remote_id.clone(),
            payload,
            client_version: entity.version,
            updated_at: entity.updated_at,
            field_timestamps: entity.field_timestamps.clone(),
            origin_device: entity.origin_device.clone(),
        };

        match self.push_one(item).await? {
            ItemOutcome::Accepted { remote_id, version } => {
                self.commit_accepted(op, kind, remote_id, version)
            }
            ItemOutcome::Conflict {
                remote_version,
                remote,
            } => {
                tracing::debug!(
                    op_id = %op.id,
                    local_version = entity.version,
                    remote_version,
                    "write rejected as stale"
                );
                self.upload_conflict(op, entity, &remote)
            }
            ItemOutcome::Rejected { reason } => Err(SyncError::validation(format!(
                "rejected by remote store: {reason}"
            ))),
        }
    }

    async fn push_one(&self, item: PushItem) -> SyncResult<ItemOutcome> {
        let timeout = self.config.timeout;
        let outcomes = tokio::time::timeout(timeout, self.remote.push(vec![item]))
            .await
            .map_err(|_| SyncError::network(format!("push timed out after {timeout:?}")))??;
        outcomes
            .into_iter()
            .next()
            .ok_or_else(|| SyncError::network("remote store returned no outcome"))
    }

    fn commit_accepted(
        &self,
        op: &SyncOperation,
        kind: OperationKind,
        remote_id: RemoteId,
        version: Version,
    ) -> SyncResult<OpOutcome> {
        if kind == OperationKind::Delete {
            self.local.remove(&op.entity_id)?;
            self.queue.mark_completed(&op.id)?;
            self.tracker.forget(&op.entity_id);
            tracing::debug!(op_id = %op.id, entity_id = %op.entity_id, "delete committed");
            return Ok(OpOutcome::Succeeded);
        }

        let now = self.now();
        let more = self.has_queued_followup(op);
        let committed = self.local.update(&op.entity_id, &mut |entity| {
            entity.remote_id = Some(remote_id.clone());
            entity.version = entity.version.max(version);
            entity.last_sync_attempt = Some(now);
            entity.sync_error_message = None;
            entity.sync_status = if more {
                SyncStatus::NeedsUpload
            } else if entity.has_pending_files() {
                SyncStatus::FilesPending
            } else {
                SyncStatus::InSync
            };
            Ok(())
        })?;
        self.queue.mark_completed(&op.id)?;

        let event = if committed.sync_status == SyncStatus::FilesPending {
            SyncEvent::FilesPending
        } else {
            SyncEvent::Succeeded
        };
        self.track(&op.entity_id, op.entity_type, event);

        tracing::debug!(
            op_id = %op.id,
            entity_id = %op.entity_id,
            remote_id = %remote_id,
            version,
            "operation committed"
        );
        Ok(OpOutcome::Succeeded)
    }

    fn upload_conflict(
        &self,
        op: &SyncOperation,
        local: SyncableEntity,
        remote: &RemoteEntity,
    ) -> SyncResult<OpOutcome> {
        let theirs = self.localize(remote, local.local_id.clone())?;
        let detection = self.detector.detect(&local, &theirs);

        if !detection.has_conflict {
            let remote_version = theirs.version;
            let remote_id = theirs.remote_id.clone();

            if same_content(&local, &theirs) {
                // The remote store already holds this write.
                self.local.update(&op.entity_id, &mut |entity| {
                    entity.remote_id = remote_id.clone();
                    entity.version = entity.version.max(remote_version);
                    entity.sync_status = SyncStatus::InSync;
                    entity.sync_error_message = None;
                    Ok(())
                })?;
                self.queue.mark_completed(&op.id)?;
                self.track(&op.entity_id, op.entity_type, SyncEvent::Succeeded);
                return Ok(OpOutcome::Succeeded);
            }

            self.local.update(&op.entity_id, &mut |entity| {
                entity.remote_id = remote_id.clone();
                entity.version = entity.version.max(remote_version);
                Ok(())
            })?;
            self.queue.reschedule(&op.id, op.payload.clone())?;
            self.track(&op.entity_id, op.entity_type, SyncEvent::LocalChange);
            self.track(&op.entity_id, op.entity_type, SyncEvent::Succeeded);
            tracing::debug!(op_id = %op.id, remote_version, "rebased on concurrent write");
            return Ok(OpOutcome::Rebased);
        }

        let now = self.now();
        let strategy = self.config.strategy_for(local.entity_type);
        let record = ConflictRecord::new(&local, &theirs, &detection, strategy, now);
        self.track(&op.entity_id, op.entity_type, SyncEvent::ConflictDetected);
        tracing::warn!(
            entity_id = %local.local_id,
            entity_type = %local.entity_type,
            conflict_type = ?detection.conflict_type,
            fields = ?detection.conflicted_fields,
            %strategy,
            "conflict detected on upload"
        );

        let resolution =
            (local.handler().apply_conflict_strategy)(&self.conflicts, &local, &theirs, strategy)?;
        if resolution.is_deferred() {
            self.park(&local, record, now)?;
            self.queue.cancel(&op.id)?;
            return Ok(OpOutcome::Conflicted);
        }

        let mut record = record;
        record.close(&resolution, format!("auto:{strategy}"), now);
        self.queue.add_conflict(record, now)?;
        self.track(&op.entity_id, op.entity_type, SyncEvent::Resolved);

        match self.settle(&local, &theirs, resolution.resolved_entity)? {
            Settled::AdoptedRemote => self.queue.mark_completed(&op.id)?,
            Settled::NeedsUpload(entity) => {
                self.queue.reschedule(&op.id, entity.synced_payload())?;
                self.track(&op.entity_id, op.entity_type, SyncEvent::LocalChange);
            }
        }
        Ok(OpOutcome::Conflicted)
    }

    fn fail_op(&self, op: &SyncOperation, err: SyncError) -> OpOutcome {
        if matches!(err, SyncError::DependencyNotMet { .. }) {
            tracing::debug!(op_id = %op.id, error = %err, "operation deferred");
            if let Err(release) = self.queue.release(&op.id, Some(&err.to_string())) {
                tracing::warn!(op_id = %op.id, error = %release, "could not release operation");
            }
            self.track(&op.entity_id, op.entity_type, SyncEvent::Deferred);
            return OpOutcome::Deferred;
        }

        let status = match self.queue.mark_failed(&op.id, &err) {
            Ok(status) => status,
            Err(queue_err) => {
                tracing::error!(op_id = %op.id, error = %queue_err, "could not record failure");
                return OpOutcome::Failed(queue_err);
            }
        };
        self.track(
            &op.entity_id,
            op.entity_type,
            SyncEvent::Failed {
                message: err.to_string(),
                retryable: status == OperationStatus::Pending,
            },
        );

        if status == OperationStatus::Pending {
            tracing::warn!(op_id = %op.id, entity_id = %op.entity_id, error = %err, "operation will be retried");
            return OpOutcome::Retrying(err);
        }

        tracing::warn!(op_id = %op.id, entity_id = %op.entity_id, error = %err, "operation failed");
        let message = self
            .queue
            .get(&op.id)
            .and_then(|failed| failed.last_error)
            .unwrap_or_else(|| err.to_string());
        let now = self.now();
        let surfaced = self.local.update(&op.entity_id, &mut |entity| {
            entity.sync_status = SyncStatus::Error;
            entity.sync_error_message = Some(message.clone());
            entity.last_sync_attempt = Some(now);
            Ok(())
        });
        if let Err(surface_err) = surfaced {
            tracing::debug!(entity_id = %op.entity_id, error = %surface_err, "could not flag entity");
        }
        OpOutcome::Failed(err)
    }

    fn has_queued_followup(&self, op: &SyncOperation) -> bool {
        self.queue
            .operations_for_entity(&op.entity_id)
            .iter()
            .any(|other| other.id != op.id && other.status == OperationStatus::Pending)
    }

    fn has_unsent_changes(&self, entity_id: &str) -> bool {
        self.queue
            .operations_for_entity(entity_id)
            .iter()
            .any(|op| !op.status.is_finished())
    }

    // Download

    async fn download_type(
        &self,
        entity_type: EntityType,
        result: &mut SyncCycleResult,
    ) -> SyncResult<(bool, Option<Timestamp>)> {
        let since = self.queue.last_sync_timestamp();
        let limit = self
            .config
            .pull_page_limit
            .unwrap_or_else(|| adaptive_batch_size(entity_type, self.network_quality()));
        let timeout = self.config.timeout;

        let mut cursor = None;
        let mut clean = true;
        let mut server_time = None;

        loop {
            self.check_cancelled()?;
            let request = PullRequest {
                since,
                entity_types: vec![entity_type],
                limit,
                cursor: cursor.take(),
            };
            let page = tokio::time::timeout(timeout, self.remote.pull(request))
                .await
                .map_err(|_| SyncError::network(format!("pull timed out after {timeout:?}")))??;
            server_time.get_or_insert(page.server_time);

            for remote in &page.entities {
                match self.apply_remote(remote) {
                    Ok(DownloadOutcome::Applied) => result.downloaded += 1,
                    Ok(DownloadOutcome::Conflicted) => result.conflicted += 1,
                    Ok(DownloadOutcome::Skipped) => {}
                    Err(err) => {
                        tracing::warn!(remote_id = %remote.remote_id, error = %err, "remote change not applied");
                        clean = false;
                    }
                }
            }

            match (page.has_more, page.cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        Ok((clean, server_time))
    }

    fn apply_remote(&self, remote: &RemoteEntity) -> SyncResult<DownloadOutcome> {
        let existing = self
            .local
            .find_by_remote_id(remote.entity_type, &remote.remote_id)?;

        let Some(existing) = existing else {
            if remote.deleted {
                return Ok(DownloadOutcome::Skipped);
            }
            let entity = self.localize(remote, uuid::Uuid::now_v7().to_string())?;
            let (local_id, entity_type) = (entity.local_id.clone(), entity.entity_type);
            self.local.put(entity)?;
            self.tracker.track(local_id.clone(), entity_type, SyncStatus::InSync);
            tracing::debug!(%local_id, remote_id = %remote.remote_id, "remote entity inserted");
            return Ok(DownloadOutcome::Applied);
        };

        if remote.version <= existing.version {
            return Ok(DownloadOutcome::Skipped);
        }
        if self.queue.open_conflict_for_entity(&existing.local_id).is_some() {
            tracing::debug!(entity_id = %existing.local_id, "entity awaits manual resolution");
            return Ok(DownloadOutcome::Skipped);
        }

        let theirs = self.localize(remote, existing.local_id.clone())?;
        if !self.has_unsent_changes(&existing.local_id) {
            self.adopt(&existing, theirs)?;
            return Ok(DownloadOutcome::Applied);
        }

        if same_content(&existing, &theirs) {
            self.queue.cancel_for_entity(&existing.local_id)?;
            self.adopt(&existing, theirs)?;
            return Ok(DownloadOutcome::Applied);
        }

        let detection = self.detector.detect(&existing, &theirs);
        if !detection.has_conflict {
            // Our queued write supersedes it; send it on top of the new version.
            let remote_version = theirs.version;
            self.local.update(&existing.local_id, &mut |entity| {
                entity.version = entity.version.max(remote_version);
                Ok(())
            })?;
            return Ok(DownloadOutcome::Skipped);
        }

        let now = self.now();
        let strategy = self.config.strategy_for(existing.entity_type);
        let record = ConflictRecord::new(&existing, &theirs, &detection, strategy, now);
        self.track(&existing.local_id, existing.entity_type, SyncEvent::ConflictDetected);
        tracing::warn!(
            entity_id = %existing.local_id,
            entity_type = %existing.entity_type,
            conflict_type = ?detection.conflict_type,
            fields = ?detection.conflicted_fields,
            %strategy,
            "conflict detected on download"
        );

        let resolution = (existing.handler().apply_conflict_strategy)(
            &self.conflicts,
            &existing,
            &theirs,
            strategy,
        )?;
        if resolution.is_deferred() {
            self.queue.cancel_for_entity(&existing.local_id)?;
            self.park(&existing, record, now)?;
            return Ok(DownloadOutcome::Conflicted);
        }

        let mut record = record;
        record.close(&resolution, format!("auto:{strategy}"), now);
        self.queue.add_conflict(record, now)?;
        self.track(&existing.local_id, existing.entity_type, SyncEvent::Resolved);

        match self.settle(&existing, &theirs, resolution.resolved_entity)? {
            Settled::AdoptedRemote => {
                self.queue.cancel_for_entity(&existing.local_id)?;
            }
            Settled::NeedsUpload(entity) => {
                self.requeue(&entity)?;
            }
        }
        Ok(DownloadOutcome::Conflicted)
    }

    /// Replace a clean local entity with the remote one.
    fn adopt(&self, existing: &SyncableEntity, mut theirs: SyncableEntity) -> SyncResult<()> {
        let (id, entity_type) = (existing.local_id.as_str(), existing.entity_type);
        if theirs.deleted {
            self.local.remove(id)?;
            self.tracker.forget(id);
            tracing::debug!(entity_id = id, "remote deletion applied");
            return Ok(());
        }

        keep_local_only_fields(existing, &mut theirs);
        theirs.sync_priority = existing.sync_priority;
        theirs.sync_status = if existing.sync_status == SyncStatus::FilesPending {
            SyncStatus::FilesPending
        } else {
            SyncStatus::InSync
        };
        let status = theirs.sync_status;
        self.local.put(theirs)?;

        if status == SyncStatus::InSync {
            self.track(id, entity_type, SyncEvent::RemoteChange);
            self.track(id, entity_type, SyncEvent::BeginDownload);
            self.track(id, entity_type, SyncEvent::Succeeded);
        } else {
            self.tracker.track(id, entity_type, status);
        }
        Ok(())
    }

    // Shared with manual resolution

    /// Write a resolved entity to the local store.
    pub(crate) fn settle(
        &self,
        local: &SyncableEntity,
        theirs: &SyncableEntity,
        resolved: SyncableEntity,
    ) -> SyncResult<Settled> {
        let mut resolved = resolved;
        resolved.local_id = local.local_id.clone();
        resolved.sync_priority = local.sync_priority;
        resolved.remote_id = theirs.remote_id.clone().or_else(|| local.remote_id.clone());
        resolved.version = resolved.version.max(local.version).max(theirs.version);
        resolved.sync_error_message = None;

        if same_content(&resolved, theirs) {
            if theirs.deleted {
                self.local.remove(&local.local_id)?;
                self.tracker.forget(&local.local_id);
            } else {
                resolved.sync_status = SyncStatus::InSync;
                self.local.put(resolved)?;
            }
            return Ok(Settled::AdoptedRemote);
        }

        resolved.sync_status = SyncStatus::NeedsUpload;
        self.local.put(resolved.clone())?;
        Ok(Settled::NeedsUpload(resolved))
    }

    /// Replace every idle operation of `entity` with one that uploads its
    /// current state.
    pub(crate) fn requeue(&self, entity: &SyncableEntity) -> SyncResult<OperationId> {
        self.queue.cancel_for_entity(&entity.local_id)?;
        let kind = match (entity.deleted, &entity.remote_id) {
            (true, _) => OperationKind::Delete,
            (false, Some(_)) => OperationKind::Update,
            (false, None) => OperationKind::Create,
        };
        let op = SyncOperation::for_entity(entity, kind, self.now())
            .with_max_retries(self.config.max_retries);
        let id = self.queue.enqueue(op)?;
        self.track(&entity.local_id, entity.entity_type, SyncEvent::LocalChange);
        Ok(id)
    }

    /// Park an entity until the conflict is resolved by hand.
    fn park(&self, local: &SyncableEntity, record: ConflictRecord, now: Timestamp) -> SyncResult<()> {
        let conflict_id = record.id.clone();
        self.queue.add_conflict(record, now)?;
        self.local.update(&local.local_id, &mut |entity| {
            entity.sync_status = SyncStatus::Conflict;
            entity.sync_error_message = Some(format!("conflict {conflict_id} awaits resolution"));
            Ok(())
        })?;
        tracing::info!(entity_id = %local.local_id, %conflict_id, "entity parked for manual resolution");
        Ok(())
    }

    /// Local view of a remote entity with references mapped to local ids.
    pub(crate) fn localize(
        &self,
        remote: &RemoteEntity,
        local_id: impl Into<EntityId>,
    ) -> SyncResult<SyncableEntity> {
        let mut entity = remote.to_entity(local_id);
        if let Value::Object(fields) = &mut entity.payload {
            for reference in remote.entity_type.handler().references {
                let Some(Value::String(remote_id)) = fields.get(reference.field).cloned() else {
                    continue;
                };
                if let Some(target) = self.local.find_by_remote_id(reference.target, &remote_id)? {
                    fields.insert(reference.field.to_string(), Value::String(target.local_id));
                }
            }
        }
        Ok(entity)
    }

    /// Map reference fields from local ids to remote ids.
    fn outbound_references(&self, entity_type: EntityType, payload: &mut Value) -> SyncResult<()> {
        let Value::Object(fields) = payload else {
            return Ok(());
        };
        for reference in entity_type.handler().references {
            let Some(Value::String(local_id)) = fields.get(reference.field).cloned() else {
                continue;
            };
            let Some(target) = self.local.get(&local_id)? else {
                continue;
            };
            match target.remote_id {
                Some(remote_id) => {
                    fields.insert(reference.field.to_string(), Value::String(remote_id));
                }
                None => {
                    return Err(SyncError::DependencyNotMet {
                        entity_type,
                        detail: format!("{} {local_id} has no remote id yet", reference.target),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Same synced state, ignoring device-local fields and bookkeeping.
fn same_content(a: &SyncableEntity, b: &SyncableEntity) -> bool {
    a.deleted == b.deleted && a.synced_payload() == b.synced_payload()
}
