//! Durable offline operation queue.
//!
//! The queue is the single writer of the persisted [`SyncSnapshot`]. Every
//! mutation is applied to a copy of the current state, saved through the
//! [`SnapshotStorage`] and only then made visible, so a failed save leaves
//! both memory and disk unchanged.
//!
//! # Eligibility
//!
//! An operation can be handed out when:
//! - its status is `Pending`
//! - every id in `depends_on` is `Completed` or `Cancelled` (unknown ids,
//!   e.g. pruned ones, count as done); a `Failed` operation on another
//!   entity does not block either, references to that entity are checked
//!   when the dependent operation is sent
//! - no other operation for the same entity is `InProgress`
//!
//! Eligible operations leave in priority order (highest first), then by
//! `created_at`, then by `seq`.

use crate::conflict::{ConflictRecord, ConflictResult};
use crate::persist::{MemoryStorage, SnapshotStorage, SyncSnapshot};
use crate::{
    error::SyncResult, ConflictId, DependencyResolver, EntityType, OperationId, OperationStatus,
    SyncError, SyncOperation, Timestamp,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Closed conflict records kept in the archive; older ones are dropped first.
pub const MAX_ARCHIVED_CONFLICTS: usize = 256;

/// Operation counts for one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Persistent, priority-ordered queue of local mutations.
#[derive(Debug)]
pub struct OfflineQueue {
    state: Mutex<SyncSnapshot>,
    storage: Arc<dyn SnapshotStorage>,
    resolver: Arc<DependencyResolver>,
}

impl OfflineQueue {
    /// Open the queue, loading any saved snapshot.
    ///
    /// Operations left `InProgress` by a previous process are returned to
    /// `Pending`.
    pub fn open(
        storage: Arc<dyn SnapshotStorage>,
        resolver: Arc<DependencyResolver>,
    ) -> SyncResult<Self> {
        let snapshot = storage.load()?.unwrap_or_default();
        let queue = Self {
            state: Mutex::new(snapshot),
            storage,
            resolver,
        };

        let recovered = queue.recover_in_progress()?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered interrupted operations");
        }
        Ok(queue)
    }

    /// A queue over fresh in-memory storage and the standard graph.
    pub fn in_memory() -> SyncResult<Self> {
        Self::open(
            Arc::new(MemoryStorage::new()),
            Arc::new(DependencyResolver::standard()?),
        )
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut SyncSnapshot) -> SyncResult<R>) -> SyncResult<R> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.storage.save(&next)?;
        *state = next;
        Ok(out)
    }

    /// Read the current state.
    pub fn with_state<R>(&self, f: impl FnOnce(&SyncSnapshot) -> R) -> R {
        f(&self.state.lock())
    }

    /// Add an operation.
    ///
    /// Assigns `seq` and extends `depends_on` with every unfinished operation
    /// on the same entity and on any prerequisite entity type.
    pub fn enqueue(&self, mut op: SyncOperation) -> SyncResult<OperationId> {
        if op.id.trim().is_empty() {
            return Err(SyncError::validation("operation id must not be empty"));
        }
        let prerequisites = self.resolver.prerequisites_of(op.entity_type);

        self.mutate(|state| {
            if state.operations.contains_key(&op.id) {
                return Err(SyncError::validation(format!(
                    "duplicate operation id: {}",
                    op.id
                )));
            }

            let mut depends_on: BTreeSet<OperationId> = op.depends_on.drain(..).collect();
            depends_on.extend(
                state
                    .operations
                    .values()
                    .filter(|existing| !existing.status.is_finished())
                    .filter(|existing| {
                        existing.entity_id == op.entity_id
                            || prerequisites.contains(&existing.entity_type)
                    })
                    .map(|existing| existing.id.clone()),
            );

            op.depends_on = depends_on.into_iter().collect();
            op.seq = state.next_seq;
            op.status = OperationStatus::Pending;
            state.next_seq += 1;

            tracing::debug!(
                op_id = %op.id,
                entity_id = %op.entity_id,
                entity_type = %op.entity_type,
                depends_on = op.depends_on.len(),
                "operation enqueued"
            );

            let id = op.id.clone();
            state.operations.insert(id.clone(), op);
            Ok(id)
        })
    }

    /// Next eligible operation matching `predicate`, without claiming it.
    pub fn peek_next(&self, predicate: impl Fn(&SyncOperation) -> bool) -> Option<SyncOperation> {
        let state = self.state.lock();
        eligible(&state)
            .into_iter()
            .find(|op| predicate(*op))
            .cloned()
    }

    /// Claim up to `limit` eligible operations matching `predicate`.
    ///
    /// The returned operations are `InProgress`; at most one per entity.
    pub fn drain_batch(
        &self,
        limit: usize,
        predicate: impl Fn(&SyncOperation) -> bool,
    ) -> SyncResult<Vec<SyncOperation>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.mutate(|state| {
            let mut entities = BTreeSet::new();
            let ids: Vec<OperationId> = eligible(state)
                .into_iter()
                .filter(|op| predicate(*op))
                .filter(|op| entities.insert(op.entity_id.clone()))
                .take(limit)
                .map(|op| op.id.clone())
                .collect();

            let mut batch = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(op) = state.operations.get_mut(&id) {
                    op.status = OperationStatus::InProgress;
                    batch.push(op.clone());
                }
            }
            Ok(batch)
        })
    }

    /// Claim one specific operation.
    pub fn mark_in_progress(&self, id: &str) -> SyncResult<()> {
        self.mutate(|state| {
            let op = find(state, id)?;
            if op.status != OperationStatus::Pending {
                return Err(invalid(op.status, "markInProgress"));
            }
            let busy = state.operations.values().any(|other| {
                other.entity_id == op.entity_id && other.status == OperationStatus::InProgress
            });
            if busy {
                return Err(SyncError::InvalidTransition {
                    from: "Pending".into(),
                    event: format!("markInProgress while entity {} is busy", op.entity_id),
                });
            }
            find_mut(state, id)?.status = OperationStatus::InProgress;
            Ok(())
        })
    }

    /// The remote store acknowledged the operation.
    pub fn mark_completed(&self, id: &str) -> SyncResult<()> {
        self.mutate(|state| {
            let op = find_mut(state, id)?;
            if op.status.is_terminal() {
                return Err(invalid(op.status, "markCompleted"));
            }
            op.status = OperationStatus::Completed;
            op.last_error = None;
            Ok(())
        })
    }

    /// Record a failed attempt.
    ///
    /// Retryable errors charge the retry budget and return the operation to
    /// `Pending` until the budget is spent; everything else is terminal.
    /// Returns the resulting status.
    pub fn mark_failed(&self, id: &str, error: &SyncError) -> SyncResult<OperationStatus> {
        self.mutate(|state| {
            let op = find_mut(state, id)?;
            if op.status.is_terminal() {
                return Err(invalid(op.status, "markFailed"));
            }

            if error.is_retryable() {
                op.retry_count += 1;
                if op.retries_exhausted() {
                    op.status = OperationStatus::Failed;
                    op.last_error = Some(
                        SyncError::MaxRetriesExceeded {
                            op_id: op.id.clone(),
                            attempts: op.retry_count,
                            last_error: error.to_string(),
                        }
                        .to_string(),
                    );
                } else {
                    op.status = OperationStatus::Pending;
                    op.last_error = Some(error.to_string());
                }
            } else {
                op.status = OperationStatus::Failed;
                op.last_error = Some(error.to_string());
            }

            tracing::debug!(
                op_id = %op.id,
                retry_count = op.retry_count,
                status = ?op.status,
                error = %error,
                "operation failed"
            );
            Ok(op.status)
        })
    }

    /// Return a claimed operation to `Pending` without charging a retry.
    pub fn release(&self, id: &str, reason: Option<&str>) -> SyncResult<()> {
        self.mutate(|state| {
            let op = find_mut(state, id)?;
            if op.status != OperationStatus::InProgress {
                return Err(invalid(op.status, "release"));
            }
            op.status = OperationStatus::Pending;
            if let Some(reason) = reason {
                op.last_error = Some(reason.to_string());
            }
            Ok(())
        })
    }

    /// Replace the payload and send the operation again.
    pub fn reschedule(&self, id: &str, payload: serde_json::Value) -> SyncResult<()> {
        self.mutate(|state| {
            let op = find_mut(state, id)?;
            if op.status == OperationStatus::Completed {
                return Err(invalid(op.status, "reschedule"));
            }
            op.payload = payload;
            op.status = OperationStatus::Pending;
            op.last_error = None;
            Ok(())
        })
    }

    /// Cancel one operation.
    pub fn cancel(&self, id: &str) -> SyncResult<()> {
        self.mutate(|state| {
            let op = find_mut(state, id)?;
            if op.status == OperationStatus::Completed {
                return Err(invalid(op.status, "cancel"));
            }
            op.status = OperationStatus::Cancelled;
            Ok(())
        })
    }

    /// Cancel every unfinished operation of an entity that is not in flight.
    /// Returns the cancelled ids.
    pub fn cancel_for_entity(&self, entity_id: &str) -> SyncResult<Vec<OperationId>> {
        self.mutate(|state| {
            let mut cancelled = Vec::new();
            for op in state.operations.values_mut() {
                let idle = matches!(op.status, OperationStatus::Pending | OperationStatus::Failed);
                if op.entity_id == entity_id && idle {
                    op.status = OperationStatus::Cancelled;
                    cancelled.push(op.id.clone());
                }
            }
            Ok(cancelled)
        })
    }

    /// Manual retry trigger: every `Failed` operation gets a fresh budget.
    pub fn retry_failed(&self) -> SyncResult<usize> {
        self.mutate(|state| {
            let mut count = 0;
            for op in state.operations.values_mut() {
                if op.status == OperationStatus::Failed {
                    op.status = OperationStatus::Pending;
                    op.retry_count = 0;
                    op.last_error = None;
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    /// Return every `InProgress` operation to `Pending`.
    pub fn recover_in_progress(&self) -> SyncResult<usize> {
        let stuck = self.with_state(|state| {
            state
                .operations
                .values()
                .any(|op| op.status == OperationStatus::InProgress)
        });
        if !stuck {
            return Ok(0);
        }

        self.mutate(|state| {
            let mut count = 0;
            for op in state.operations.values_mut() {
                if op.status == OperationStatus::InProgress {
                    op.status = OperationStatus::Pending;
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    /// Drop completed and cancelled operations.
    pub fn prune_completed(&self) -> SyncResult<usize> {
        let finished = self
            .state
            .lock()
            .operations
            .values()
            .any(|op| op.status.is_finished());
        if !finished {
            return Ok(0);
        }
        self.mutate(|state| {
            let before = state.operations.len();
            state.operations.retain(|_, op| !op.status.is_finished());
            Ok(before - state.operations.len())
        })
    }

    pub fn get(&self, id: &str) -> Option<SyncOperation> {
        self.state.lock().operations.get(id).cloned()
    }

    /// All operations in insertion order.
    pub fn operations(&self) -> Vec<SyncOperation> {
        let mut ops: Vec<_> = self.state.lock().operations.values().cloned().collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    /// Operations of one entity in insertion order.
    pub fn operations_for_entity(&self, entity_id: &str) -> Vec<SyncOperation> {
        let mut ops: Vec<_> = self
            .state
            .lock()
            .operations
            .values()
            .filter(|op| op.entity_id == entity_id)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.seq);
        ops
    }

    /// Operations waiting to be sent or in flight.
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .operations
            .values()
            .filter(|op| {
                matches!(
                    op.status,
                    OperationStatus::Pending | OperationStatus::InProgress
                )
            })
            .count()
    }

    /// True if any operation of `entity_type` waits to be sent.
    pub fn has_pending(&self, entity_type: EntityType) -> bool {
        self.state
            .lock()
            .operations
            .values()
            .any(|op| op.entity_type == entity_type && op.status == OperationStatus::Pending)
    }

    pub fn counts_by_type(&self) -> BTreeMap<EntityType, TypeCounts> {
        let state = self.state.lock();
        let mut counts: BTreeMap<EntityType, TypeCounts> = BTreeMap::new();
        for op in state.operations.values() {
            let entry = counts.entry(op.entity_type).or_default();
            match op.status {
                OperationStatus::Pending => entry.pending += 1,
                OperationStatus::InProgress => entry.in_progress += 1,
                OperationStatus::Completed => entry.completed += 1,
                OperationStatus::Failed => entry.failed += 1,
                OperationStatus::Cancelled => entry.cancelled += 1,
            }
        }
        counts
    }

    // Conflict records

    /// Store a conflict record. Open records supersede an earlier open record
    /// for the same entity.
    pub fn add_conflict(&self, record: ConflictRecord, now: Timestamp) -> SyncResult<()> {
        self.mutate(|state| {
            if !record.is_open() {
                archive(state, record);
                return Ok(());
            }

            let superseded: Vec<ConflictId> = state
                .open_conflicts
                .values()
                .filter(|open| open.entity_id == record.entity_id)
                .map(|open| open.id.clone())
                .collect();
            for id in superseded {
                if let Some(mut old) = state.open_conflicts.remove(&id) {
                    old.resolved_at = Some(now);
                    old.resolved_by = Some("superseded".to_string());
                    archive(state, old);
                }
            }

            state.open_conflicts.insert(record.id.clone(), record);
            Ok(())
        })
    }

    /// Close an open record and move it to the archive.
    pub fn archive_conflict(
        &self,
        id: &str,
        result: &ConflictResult,
        resolved_by: &str,
        at: Timestamp,
    ) -> SyncResult<ConflictRecord> {
        self.mutate(|state| {
            let mut record = state
                .open_conflicts
                .remove(id)
                .ok_or_else(|| SyncError::ConflictNotFound(id.to_string()))?;
            record.close(result, resolved_by, at);
            archive(state, record.clone());
            Ok(record)
        })
    }

    pub fn open_conflict(&self, id: &str) -> Option<ConflictRecord> {
        self.state.lock().open_conflicts.get(id).cloned()
    }

    pub fn open_conflicts(&self) -> Vec<ConflictRecord> {
        let mut records: Vec<_> = self.state.lock().open_conflicts.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn open_conflict_for_entity(&self, entity_id: &str) -> Option<ConflictRecord> {
        self.state
            .lock()
            .open_conflicts
            .values()
            .find(|r| r.entity_id == entity_id)
            .cloned()
    }

    pub fn archived_conflicts(&self) -> Vec<ConflictRecord> {
        self.state.lock().archived_conflicts.clone()
    }

    // Watermark

    pub fn last_sync_timestamp(&self) -> Option<Timestamp> {
        self.state.lock().last_sync_timestamp
    }

    /// Advance the download watermark; it never moves backwards.
    pub fn set_last_sync_timestamp(&self, timestamp: Timestamp) -> SyncResult<()> {
        self.mutate(|state| {
            let next = state
                .last_sync_timestamp
                .map_or(timestamp, |prev| prev.max(timestamp));
            state.last_sync_timestamp = Some(next);
            Ok(())
        })
    }
}

fn eligible(state: &SyncSnapshot) -> Vec<&SyncOperation> {
    let busy: BTreeSet<&str> = state
        .operations
        .values()
        .filter(|op| op.status == OperationStatus::InProgress)
        .map(|op| op.entity_id.as_str())
        .collect();

    let mut ready: Vec<&SyncOperation> = state
        .operations
        .values()
        .filter(|op| op.status == OperationStatus::Pending)
        .filter(|op| !busy.contains(op.entity_id.as_str()))
        .filter(|op| {
            op.depends_on.iter().all(|dep| {
                state.operations.get(dep).map_or(true, |d| {
                    d.status.is_finished()
                        || (d.status == OperationStatus::Failed && d.entity_id != op.entity_id)
                })
            })
        })
        .collect();

    ready.sort_by(|a, b| a.dispatch_order(b));
    ready
}

fn find<'a>(state: &'a SyncSnapshot, id: &str) -> SyncResult<&'a SyncOperation> {
    state
        .operations
        .get(id)
        .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))
}

fn find_mut<'a>(state: &'a mut SyncSnapshot, id: &str) -> SyncResult<&'a mut SyncOperation> {
    state
        .operations
        .get_mut(id)
        .ok_or_else(|| SyncError::OperationNotFound(id.to_string()))
}

fn invalid(from: OperationStatus, event: &str) -> SyncError {
    SyncError::InvalidTransition {
        from: format!("{from:?}"),
        event: event.to_string(),
    }
}

fn archive(state: &mut SyncSnapshot, record: ConflictRecord) {
    state.archived_conflicts.push(record);
    let overflow = state
        .archived_conflicts
        .len()
        .saturating_sub(MAX_ARCHIVED_CONFLICTS);
    state.archived_conflicts.drain(..overflow);
}
