//! Remote store interface.
//!
//! The remote store is authoritative. It accepts writes under optimistic
//! concurrency: every update or delete carries the version it was based on,
//! and a version older than the stored one is answered with
//! [`ItemOutcome::Conflict`] instead of being applied.
//!
//! [`InMemoryRemote`] is a deterministic in-process implementation with
//! fault injection, used by tests and demos.

use crate::{
    error::SyncResult, DeviceId, EntityId, EntityType, OperationKind, RemoteId, SyncError,
    SyncStatus, SyncableEntity, Timestamp, Version,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// One write sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    pub entity_type: EntityType,
    pub kind: OperationKind,
    /// Sender's local id (idempotency key for creates)
    pub entity_id: EntityId,
    pub remote_id: Option<RemoteId>,
    /// Payload with references rewritten to remote ids
    pub payload: Value,
    /// Version this write is based on; older than the stored version means stale
    pub client_version: Version,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub field_timestamps: BTreeMap<String, Timestamp>,
    #[serde(default)]
    pub origin_device: DeviceId,
}

/// An entity as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub remote_id: RemoteId,
    pub entity_type: EntityType,
    pub version: Version,
    pub payload: Value,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub field_timestamps: BTreeMap<String, Timestamp>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub origin_device: DeviceId,
    /// Server time of the last write
    pub modified_at: Timestamp,
}

impl RemoteEntity {
    /// Local view of this entity under `local_id`.
    pub fn to_entity(&self, local_id: impl Into<EntityId>) -> SyncableEntity {
        let mut entity = SyncableEntity::new(self.entity_type, self.payload.clone());
        entity.local_id = local_id.into();
        entity.remote_id = Some(self.remote_id.clone());
        entity.version = self.version;
        entity.updated_at = self.updated_at;
        entity.field_timestamps = self.field_timestamps.clone();
        entity.deleted = self.deleted;
        entity.origin_device = self.origin_device.clone();
        entity.sync_status = SyncStatus::InSync;
        entity
    }
}

/// Per-item answer to a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ItemOutcome {
    #[serde(rename_all = "camelCase")]
    Accepted { remote_id: RemoteId, version: Version },
    /// The write was based on a stale version
    #[serde(rename_all = "camelCase")]
    Conflict {
        remote_version: Version,
        remote: RemoteEntity,
    },
    /// The write can never succeed as sent
    Rejected { reason: String },
}

/// Request for remote changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Only entities modified after this server time
    pub since: Option<Timestamp>,
    pub entity_types: Vec<EntityType>,
    pub limit: usize,
    pub cursor: Option<String>,
}

/// A page of remote changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub entities: Vec<RemoteEntity>,
    pub has_more: bool,
    pub cursor: Option<String>,
    /// Server time when the page was produced
    pub server_time: Timestamp,
}

/// The authoritative remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync + std::fmt::Debug {
    /// Send writes; one outcome per item, in order.
    async fn push(&self, items: Vec<PushItem>) -> SyncResult<Vec<ItemOutcome>>;

    /// Fetch changes.
    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse>;
}

#[derive(Debug, Default)]
struct RemoteState {
    entities: BTreeMap<RemoteId, RemoteEntity>,
    /// (type, sender local id) -> remote id, for idempotent creates
    created: HashMap<(EntityType, EntityId), RemoteId>,
    server_time: Timestamp,
    next_id: u64,
    unreachable: bool,
    fail_next: HashMap<EntityId, u32>,
    push_calls: usize,
    push_log: Vec<(EntityType, EntityId)>,
    in_flight: usize,
    max_in_flight: usize,
    in_flight_by_entity: HashMap<EntityId, usize>,
    max_in_flight_by_entity: HashMap<EntityId, usize>,
}

impl RemoteState {
    fn tick(&mut self) -> Timestamp {
        self.server_time += 1;
        self.server_time
    }

    fn begin(&mut self, items: &[PushItem]) {
        self.push_calls += 1;
        self.in_flight += 1;
        self.max_in_flight = self.max_in_flight.max(self.in_flight);
        for item in items {
            let count = self.in_flight_by_entity.entry(item.entity_id.clone()).or_default();
            *count += 1;
            let max = self
                .max_in_flight_by_entity
                .entry(item.entity_id.clone())
                .or_default();
            *max = (*max).max(*count);
        }
    }

    fn end(&mut self, items: &[PushItem]) {
        self.in_flight = self.in_flight.saturating_sub(1);
        for item in items {
            if let Some(count) = self.in_flight_by_entity.get_mut(&item.entity_id) {
                *count = count.saturating_sub(1);
            }
        }
    }

    fn apply(&mut self, item: PushItem) -> ItemOutcome {
        self.push_log.push((item.entity_type, item.entity_id.clone()));

        if item.kind == OperationKind::Create {
            return self.create(item);
        }

        let remote_id = item.remote_id.clone().or_else(|| {
            self.created
                .get(&(item.entity_type, item.entity_id.clone()))
                .cloned()
        });
        let Some(remote_id) = remote_id else {
            return ItemOutcome::Rejected {
                reason: format!("unknown {} {}", item.entity_type, item.entity_id),
            };
        };
        let Some(current) = self.entities.get(&remote_id).cloned() else {
            return ItemOutcome::Rejected {
                reason: format!("unknown remote id {remote_id}"),
            };
        };

        if item.kind == OperationKind::Delete && current.deleted {
            return ItemOutcome::Accepted {
                remote_id,
                version: current.version,
            };
        }
        if item.client_version < current.version {
            return ItemOutcome::Conflict {
                remote_version: current.version,
                remote: current,
            };
        }

        let modified_at = self.tick();
        let mut next = current;
        next.version = next.version.max(item.client_version) + 1;
        next.updated_at = item.updated_at;
        next.origin_device = item.origin_device;
        next.modified_at = modified_at;
        if item.kind == OperationKind::Delete {
            next.deleted = true;
        } else {
            // An up-to-date update revives a tombstone.
            next.deleted = false;
            next.payload = item.payload;
            next.field_timestamps = item.field_timestamps;
        }

        let outcome = ItemOutcome::Accepted {
            remote_id: remote_id.clone(),
            version: next.version,
        };
        self.entities.insert(remote_id, next);
        outcome
    }

    fn create(&mut self, item: PushItem) -> ItemOutcome {
        let key = (item.entity_type, item.entity_id.clone());
        if let Some(existing) = self.created.get(&key).and_then(|id| self.entities.get(id)) {
            return ItemOutcome::Accepted {
                remote_id: existing.remote_id.clone(),
                version: existing.version,
            };
        }

        self.next_id += 1;
        let remote_id = format!("srv-{}", self.next_id);
        let modified_at = self.tick();
        let entity = RemoteEntity {
            remote_id: remote_id.clone(),
            entity_type: item.entity_type,
            version: 1,
            payload: item.payload,
            updated_at: item.updated_at,
            field_timestamps: item.field_timestamps,
            deleted: false,
            origin_device: item.origin_device,
            modified_at,
        };

        self.created.insert(key, remote_id.clone());
        self.entities.insert(remote_id.clone(), entity);
        ItemOutcome::Accepted {
            remote_id,
            version: 1,
        }
    }
}

/// Deterministic in-process remote store.
///
/// Server time is a counter that advances by one on every accepted write.
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
    latency: Duration,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every push by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `n` pushes touching `entity_id` fail with a network error.
    pub fn fail_next_push(&self, entity_id: impl Into<EntityId>, n: u32) {
        self.state.lock().fail_next.insert(entity_id.into(), n);
    }

    /// Fail every call with a network error while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Simulate a write by another device.
    pub fn insert_remote(
        &self,
        entity_type: EntityType,
        payload: Value,
        updated_at: Timestamp,
        origin_device: impl Into<DeviceId>,
    ) -> RemoteEntity {
        let mut state = self.state.lock();
        state.next_id += 1;
        let remote_id = format!("srv-{}", state.next_id);
        let modified_at = state.tick();
        let field_timestamps = payload
            .as_object()
            .map(|fields| fields.keys().map(|k| (k.clone(), updated_at)).collect())
            .unwrap_or_default();

        let entity = RemoteEntity {
            remote_id: remote_id.clone(),
            entity_type,
            version: 1,
            payload,
            updated_at,
            field_timestamps,
            deleted: false,
            origin_device: origin_device.into(),
            modified_at,
        };
        state.entities.insert(remote_id, entity.clone());
        entity
    }

    /// Simulate another device editing an entity. Only fields whose value
    /// changed get `updated_at` as their field timestamp.
    pub fn update_remote(
        &self,
        remote_id: &str,
        payload: Value,
        updated_at: Timestamp,
        origin_device: impl Into<DeviceId>,
    ) -> SyncResult<RemoteEntity> {
        let mut state = self.state.lock();
        let modified_at = state.tick();
        let entity = state
            .entities
            .get_mut(remote_id)
            .ok_or_else(|| SyncError::EntityNotFound(remote_id.to_string()))?;

        if let (Some(before), Some(after)) = (entity.payload.as_object(), payload.as_object()) {
            for name in before.keys().chain(after.keys()) {
                if before.get(name) != after.get(name) {
                    entity.field_timestamps.insert(name.clone(), updated_at);
                }
            }
        }
        entity.payload = payload;
        entity.version += 1;
        entity.updated_at = updated_at;
        entity.origin_device = origin_device.into();
        entity.modified_at = modified_at;
        Ok(entity.clone())
    }

    /// Simulate another device deleting an entity.
    pub fn delete_remote(&self, remote_id: &str, updated_at: Timestamp) -> SyncResult<RemoteEntity> {
        let mut state = self.state.lock();
        let modified_at = state.tick();
        let entity = state
            .entities
            .get_mut(remote_id)
            .ok_or_else(|| SyncError::EntityNotFound(remote_id.to_string()))?;
        entity.deleted = true;
        entity.version += 1;
        entity.updated_at = updated_at;
        entity.modified_at = modified_at;
        Ok(entity.clone())
    }

    pub fn entity(&self, remote_id: &str) -> Option<RemoteEntity> {
        self.state.lock().entities.get(remote_id).cloned()
    }

    /// Every stored entity, tombstones included.
    pub fn entities(&self) -> Vec<RemoteEntity> {
        self.state.lock().entities.values().cloned().collect()
    }

    pub fn server_time(&self) -> Timestamp {
        self.state.lock().server_time
    }

    /// Number of push calls received (including failed ones).
    pub fn push_calls(&self) -> usize {
        self.state.lock().push_calls
    }

    /// Every item applied, in arrival order.
    pub fn push_log(&self) -> Vec<(EntityType, EntityId)> {
        self.state.lock().push_log.clone()
    }

    /// Highest number of concurrent push calls seen.
    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }

    /// Highest number of concurrent pushes seen for one sender entity.
    pub fn max_in_flight_for_entity(&self, entity_id: &str) -> usize {
        self.state
            .lock()
            .max_in_flight_by_entity
            .get(entity_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn push(&self, items: Vec<PushItem>) -> SyncResult<Vec<ItemOutcome>> {
        {
            let mut state = self.state.lock();
            if state.unreachable {
                state.push_calls += 1;
                return Err(SyncError::network("remote unreachable"));
            }
            state.begin(&items);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock();
        state.end(&items);

        let injected = items.iter().any(|item| {
            state
                .fail_next
                .get_mut(&item.entity_id)
                .filter(|remaining| **remaining > 0)
                .map(|remaining| *remaining -= 1)
                .is_some()
        });
        if injected {
            return Err(SyncError::network("injected push failure"));
        }

        Ok(items.into_iter().map(|item| state.apply(item)).collect())
    }

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        let state = self.state.lock();
        if state.unreachable {
            return Err(SyncError::network("remote unreachable"));
        }

        let offset = match &request.cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| SyncError::validation(format!("invalid cursor: {cursor}")))?,
            None => 0,
        };

        let mut matching: Vec<&RemoteEntity> = state
            .entities
            .values()
            .filter(|e| request.entity_types.contains(&e.entity_type))
            .filter(|e| request.since.map_or(true, |since| e.modified_at > since))
            .collect();
        matching.sort_by(|a, b| {
            a.modified_at
                .cmp(&b.modified_at)
                .then_with(|| a.remote_id.cmp(&b.remote_id))
        });

        let limit = request.limit.max(1);
        let entities: Vec<RemoteEntity> = matching
            .iter()
            .skip(offset)
            .take(limit)
            .map(|e| (*e).clone())
            .collect();
        let next = offset + entities.len();
        let has_more = next < matching.len();

        Ok(PullResponse {
            entities,
            has_more,
            cursor: has_more.then(|| next.to_string()),
            server_time: state.server_time,
        })
    }
}
