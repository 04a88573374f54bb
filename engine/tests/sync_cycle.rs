//! End-to-end sync cycles against the in-memory remote store.

use async_trait::async_trait;
use roam_sync::{
    EntityType, InMemoryRemote, ItemOutcome, JsonFileStorage, LocalStore, ManualClock,
    MemoryLocalStore, NetworkQuality, OperationKind, OperationStatus, PullRequest, PullResponse,
    PushItem, RemoteStore, ResolutionStrategy, RetryConfig, SyncConfig, SyncContext, SyncError,
    SyncResult, SyncStatus, SyncableEntity,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const START: u64 = 1_700_000_000_000;
const MINUTE: u64 = 60_000;
const HOUR: u64 = 60 * MINUTE;

struct Device {
    context: SyncContext,
    local: Arc<MemoryLocalStore>,
}

impl Device {
    fn new(name: &str, remote: &Arc<InMemoryRemote>, clock: &Arc<ManualClock>) -> Self {
        Self::with_config(name, remote, clock, |config| config)
    }

    fn with_config(
        name: &str,
        remote: &Arc<InMemoryRemote>,
        clock: &Arc<ManualClock>,
        configure: impl FnOnce(SyncConfig) -> SyncConfig,
    ) -> Self {
        let local = Arc::new(MemoryLocalStore::new());
        let config = configure(SyncConfig::new(name).with_retry(RetryConfig::immediate()));
        let context = SyncContext::builder(remote.clone(), local.clone())
            .config(config)
            .clock(clock.clone())
            .build()
            .unwrap();
        Self { context, local }
    }

    fn create(&self, entity_type: EntityType, id: &str, payload: Value) {
        let entity = SyncableEntity::new(entity_type, payload).with_local_id(id);
        self.context
            .enqueue_local_change(entity, OperationKind::Create)
            .unwrap();
    }

    fn edit(&self, id: &str, payload: Value) {
        let mut entity = self.local.get(id).unwrap().unwrap();
        entity.payload = payload;
        self.context
            .enqueue_local_change(entity, OperationKind::Update)
            .unwrap();
    }

    fn get(&self, id: &str) -> SyncableEntity {
        self.local.get(id).unwrap().unwrap()
    }

    /// Local copy of a remote entity.
    fn by_remote(&self, entity_type: EntityType, remote_id: &str) -> SyncableEntity {
        self.local
            .find_by_remote_id(entity_type, remote_id)
            .unwrap()
            .unwrap()
    }
}

fn setup() -> (Arc<InMemoryRemote>, Arc<ManualClock>) {
    (
        Arc::new(InMemoryRemote::new()),
        Arc::new(ManualClock::new(START)),
    )
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn uploads_follow_dependency_order() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);

    // Enqueued children first on purpose.
    device.create(EntityType::Attachment, "a1", json!({"noteId": "n1", "fileName": "a.jpg"}));
    device.create(EntityType::Note, "n1", json!({"tripId": "t1", "body": "day one"}));
    device.create(EntityType::Tag, "g1", json!({"name": "cheap", "categoryId": "c1"}));
    device.create(EntityType::Trip, "t1", json!({"title": "Lisbon"}));
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));

    let result = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.succeeded, 5);
    assert_eq!(result.failed, 0);

    let log: Vec<EntityType> = remote.push_log().into_iter().map(|(t, _)| t).collect();
    let position = |t: EntityType| log.iter().position(|x| *x == t).unwrap();
    assert!(position(EntityType::Category) < position(EntityType::Tag));
    assert!(position(EntityType::Trip) < position(EntityType::Note));
    assert!(position(EntityType::Note) < position(EntityType::Attachment));

    // References travel as remote ids.
    let category = device.get("c1");
    let tag = remote.entity(device.get("g1").remote_id.as_deref().unwrap()).unwrap();
    assert_eq!(tag.payload["categoryId"], json!(category.remote_id.unwrap()));
}

#[tokio::test]
async fn tag_waits_for_its_category() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);

    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    // Missing the required name: this category never reaches the remote store.
    device.create(EntityType::Category, "c2", json!({"color": "red"}));
    device.create(EntityType::Tag, "g1", json!({"name": "cheap", "categoryId": "c2"}));

    let first = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.failed, 1);
    assert_eq!(first.deferred, 1);
    assert!(!first.watermark_advanced);
    assert!(device.get("g1").remote_id.is_none());
    assert_eq!(device.get("c2").sync_status, SyncStatus::Error);

    device.edit("c2", json!({"name": "Transport", "color": "red"}));
    let second = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(second.succeeded, 2);
    assert!(second.watermark_advanced);
    assert!(device.get("g1").remote_id.is_some());
    assert_eq!(device.context.sync_statistics().unwrap().pending_count, 0);
}

#[tokio::test]
async fn rejected_parent_does_not_hold_back_other_children() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Trip, "t1", json!({"title": "Lisbon"}));
    device.context.run_sync_cycle().await.unwrap();

    // No title: the remote store never accepts this trip.
    device.create(EntityType::Trip, "t2", json!({"notes": "no title"}));
    device.create(EntityType::Note, "n1", json!({"tripId": "t1", "body": "day one"}));

    let first = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.succeeded, 1);
    assert_eq!(first.deferred, 0);
    assert_eq!(device.get("t2").sync_status, SyncStatus::Error);
    assert!(device.get("n1").remote_id.is_some());

    let second = device.context.run_sync_cycle().await.unwrap();
    assert!(second.watermark_advanced);
}

// ============================================================================
// Versions and idempotence
// ============================================================================

#[tokio::test]
async fn versions_only_move_forward() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Trip, "t1", json!({"title": "Lisbon"}));

    let mut versions = Vec::new();
    for title in ["Porto", "Faro", "Braga"] {
        device.context.run_sync_cycle().await.unwrap();
        versions.push(device.get("t1").version);
        clock.advance(MINUTE);
        device.edit("t1", json!({"title": title}));
    }
    device.context.run_sync_cycle().await.unwrap();
    versions.push(device.get("t1").version);

    assert!(versions.windows(2).all(|w| w[0] < w[1]), "{versions:?}");
    let stored = device.get("t1");
    let server = remote.entity(stored.remote_id.as_deref().unwrap()).unwrap();
    assert_eq!(server.version, stored.version);
    assert_eq!(server.payload, json!({"title": "Braga"}));
}

#[tokio::test]
async fn rerunning_a_clean_cycle_does_nothing() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    device.create(EntityType::Trip, "t1", json!({"title": "Lisbon"}));

    let first = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(first.succeeded, 2);
    let calls = remote.push_calls();
    let snapshot = device.local.export_state();

    let second = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.downloaded, 0);
    assert_eq!(remote.push_calls(), calls);
    assert_eq!(device.local.export_state(), snapshot);
    assert_eq!(second.last_sync_timestamp, first.last_sync_timestamp);
}

#[tokio::test]
async fn finished_operations_are_pruned_next_cycle() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    device.create(EntityType::Category, "c2", json!({"name": "Transport"}));

    device.context.run_sync_cycle().await.unwrap();
    let ops = device.context.queue().operations();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|op| op.status == OperationStatus::Completed));

    device.context.run_sync_cycle().await.unwrap();
    assert!(device.context.queue().operations().is_empty());
}

// ============================================================================
// Multiple devices
// ============================================================================

#[tokio::test]
async fn changes_round_trip_between_devices() {
    let (remote, clock) = setup();
    let a = Device::new("device-a", &remote, &clock);
    let b = Device::new("device-b", &remote, &clock);

    a.create(EntityType::Trip, "t1", json!({"title": "Lisbon", "notes": "pack light"}));
    a.context.run_sync_cycle().await.unwrap();
    let remote_id = a.get("t1").remote_id.unwrap();

    let pulled = b.context.run_sync_cycle().await.unwrap();
    assert_eq!(pulled.downloaded, 1);
    let on_b = b.by_remote(EntityType::Trip, &remote_id);
    assert_eq!(on_b.payload, json!({"title": "Lisbon", "notes": "pack light"}));
    assert_eq!(on_b.sync_status, SyncStatus::InSync);
    assert_eq!(b.context.tracker().status(&on_b.local_id), Some(SyncStatus::InSync));

    clock.advance(MINUTE);
    b.edit(&on_b.local_id, json!({"title": "Lisbon", "notes": "bring a jacket"}));
    b.context.run_sync_cycle().await.unwrap();

    let back = a.context.run_sync_cycle().await.unwrap();
    assert_eq!(back.downloaded, 1);
    assert_eq!(a.get("t1").payload["notes"], "bring a jacket");
    assert_eq!(a.get("t1").version, b.get(&on_b.local_id).version);
}

#[tokio::test]
async fn references_are_rewritten_on_download() {
    let (remote, clock) = setup();
    let a = Device::new("device-a", &remote, &clock);
    let b = Device::new("device-b", &remote, &clock);

    a.create(EntityType::Trip, "t1", json!({"title": "Lisbon"}));
    a.create(EntityType::Note, "n1", json!({"tripId": "t1", "body": "day one"}));
    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();

    let trip = b.by_remote(EntityType::Trip, a.get("t1").remote_id.as_deref().unwrap());
    let note = b.by_remote(EntityType::Note, a.get("n1").remote_id.as_deref().unwrap());
    assert_eq!(note.payload["tripId"], json!(trip.local_id));
}

#[tokio::test]
async fn remote_deletion_removes_local_copy() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    device.context.run_sync_cycle().await.unwrap();

    let remote_id = device.get("c1").remote_id.unwrap();
    remote.delete_remote(&remote_id, START + HOUR).unwrap();

    device.context.run_sync_cycle().await.unwrap();
    assert!(device.local.get("c1").unwrap().is_none());
    assert!(device.context.tracker().get("c1").is_none());
}

#[tokio::test]
async fn local_delete_reaches_remote() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    device.context.run_sync_cycle().await.unwrap();
    let remote_id = device.get("c1").remote_id.unwrap();

    clock.advance(MINUTE);
    let entity = device.get("c1");
    device
        .context
        .enqueue_local_change(entity, OperationKind::Delete)
        .unwrap();
    device.context.run_sync_cycle().await.unwrap();

    assert!(remote.entity(&remote_id).unwrap().deleted);
    assert!(device.local.get("c1").unwrap().is_none());
}

#[tokio::test]
async fn paged_download() {
    let (remote, clock) = setup();
    for i in 0..30 {
        remote.insert_remote(
            EntityType::Category,
            json!({"name": format!("category {i}")}),
            START,
            "device-z",
        );
    }
    let device = Device::with_config("device-a", &remote, &clock, |c| c.with_pull_page_limit(7));

    let result = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.downloaded, 30);
    assert_eq!(device.local.list(EntityType::Category).unwrap().len(), 30);
    assert_eq!(result.last_sync_timestamp, Some(remote.server_time()));
}

/// Lets another device write between the first and last type of a download.
#[derive(Debug)]
struct LateWriter {
    inner: Arc<InMemoryRemote>,
    written: AtomicBool,
}

#[async_trait]
impl RemoteStore for LateWriter {
    async fn push(&self, items: Vec<PushItem>) -> SyncResult<Vec<ItemOutcome>> {
        self.inner.push(items).await
    }

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        if request.entity_types.contains(&EntityType::Track)
            && !self.written.swap(true, Ordering::SeqCst)
        {
            self.inner
                .insert_remote(EntityType::Category, json!({"name": "Late"}), START, "device-b");
        }
        self.inner.pull(request).await
    }
}

#[tokio::test]
async fn write_during_download_is_pulled_next_cycle() {
    let (remote, clock) = setup();
    let late = Arc::new(LateWriter {
        inner: remote.clone(),
        written: AtomicBool::new(false),
    });
    let local = Arc::new(MemoryLocalStore::new());
    let context = SyncContext::builder(late, local.clone())
        .config(SyncConfig::new("device-a").with_retry(RetryConfig::immediate()))
        .clock(clock.clone())
        .build()
        .unwrap();

    let first = context.run_sync_cycle().await.unwrap();
    assert!(first.watermark_advanced);
    assert!(local.list(EntityType::Category).unwrap().is_empty());

    let second = context.run_sync_cycle().await.unwrap();
    assert_eq!(second.downloaded, 1);
    let categories = local.list(EntityType::Category).unwrap();
    assert_eq!(categories.len(), 1);
    assert_eq!(categories[0].payload["name"], "Late");
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn disjoint_field_edits_merge() {
    let (remote, clock) = setup();
    let a = Device::new("device-a", &remote, &clock);
    let b = Device::new("device-b", &remote, &clock);

    a.create(EntityType::Trip, "t1", json!({"title": "Lisbon", "notes": "pack light"}));
    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();
    let remote_id = a.get("t1").remote_id.unwrap();
    let b_id = b.by_remote(EntityType::Trip, &remote_id).local_id;

    clock.advance(10_000);
    a.edit("t1", json!({"title": "Lisbon & Sintra", "notes": "pack light"}));
    clock.advance(10_000);
    b.edit(&b_id, json!({"title": "Lisbon", "notes": "bring a jacket"}));

    a.context.run_sync_cycle().await.unwrap();
    let merged = b.context.run_sync_cycle().await.unwrap();
    assert_eq!(merged.conflicted, 1);

    let expected = json!({"title": "Lisbon & Sintra", "notes": "bring a jacket"});
    assert_eq!(b.get(&b_id).payload, expected);
    assert_eq!(remote.entity(&remote_id).unwrap().payload, expected);

    let archived = b.context.queue().archived_conflicts();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].strategy, ResolutionStrategy::FieldLevelMerge);
    assert!(archived[0].resolved_by.as_deref().unwrap().starts_with("auto:"));

    a.context.run_sync_cycle().await.unwrap();
    assert_eq!(a.get("t1").payload, expected);
    assert_eq!(a.get("t1").version, b.get(&b_id).version);
}

#[tokio::test]
async fn later_write_wins_an_hour_apart() {
    let (remote, clock) = setup();
    let a = Device::new("device-a", &remote, &clock);
    let b = Device::new("device-b", &remote, &clock);

    a.create(EntityType::Category, "c1", json!({"name": "Food"}));
    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();
    let remote_id = a.get("c1").remote_id.unwrap();
    let b_id = b.by_remote(EntityType::Category, &remote_id).local_id;

    clock.advance(MINUTE);
    a.edit("c1", json!({"name": "Groceries"}));
    clock.advance(HOUR);
    b.edit(&b_id, json!({"name": "Dining"}));

    a.context.run_sync_cycle().await.unwrap();
    let result = b.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.conflicted, 1);
    assert_eq!(result.succeeded, 1);

    assert_eq!(remote.entity(&remote_id).unwrap().payload["name"], "Dining");
    a.context.run_sync_cycle().await.unwrap();
    assert_eq!(a.get("c1").payload["name"], "Dining");
}

#[tokio::test]
async fn earlier_local_write_loses() {
    let (remote, clock) = setup();
    let a = Device::new("device-a", &remote, &clock);
    let b = Device::new("device-b", &remote, &clock);

    a.create(EntityType::Category, "c1", json!({"name": "Food"}));
    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();
    let remote_id = a.get("c1").remote_id.unwrap();
    let b_id = b.by_remote(EntityType::Category, &remote_id).local_id;

    clock.advance(MINUTE);
    b.edit(&b_id, json!({"name": "Dining"}));
    clock.advance(HOUR);
    a.edit("c1", json!({"name": "Groceries"}));

    a.context.run_sync_cycle().await.unwrap();
    let result = b.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.conflicted, 1);
    assert_eq!(result.succeeded, 0);

    let on_b = b.get(&b_id);
    assert_eq!(on_b.payload["name"], "Groceries");
    assert_eq!(on_b.sync_status, SyncStatus::InSync);
    assert_eq!(remote.entity(&remote_id).unwrap().payload["name"], "Groceries");
    assert_eq!(b.context.queue().pending_count(), 0);
}

#[tokio::test]
async fn device_priority_decides() {
    let (remote, clock) = setup();
    let a = Device::new("device-a", &remote, &clock);
    let b = Device::with_config("device-b", &remote, &clock, |c| {
        c.with_strategy(EntityType::Category, ResolutionStrategy::DevicePriority)
            .with_device_priority("device-a", 10)
            .with_device_priority("device-b", 1)
    });

    a.create(EntityType::Category, "c1", json!({"name": "Food"}));
    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();
    let remote_id = a.get("c1").remote_id.unwrap();
    let b_id = b.by_remote(EntityType::Category, &remote_id).local_id;

    clock.advance(MINUTE);
    a.edit("c1", json!({"name": "Groceries"}));
    clock.advance(HOUR);
    b.edit(&b_id, json!({"name": "Dining"}));

    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();

    // device-b wrote later but device-a outranks it.
    assert_eq!(b.get(&b_id).payload["name"], "Groceries");
    assert_eq!(remote.entity(&remote_id).unwrap().payload["name"], "Groceries");
}

#[tokio::test]
async fn manual_resolution_parks_until_resolved() {
    let (remote, clock) = setup();
    let a = Device::new("device-a", &remote, &clock);
    let b = Device::with_config("device-b", &remote, &clock, |c| {
        c.with_strategy(EntityType::Category, ResolutionStrategy::ManualResolution)
    });

    a.create(EntityType::Category, "c1", json!({"name": "Food"}));
    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();
    let remote_id = a.get("c1").remote_id.unwrap();
    let b_id = b.by_remote(EntityType::Category, &remote_id).local_id;

    clock.advance(MINUTE);
    a.edit("c1", json!({"name": "Groceries"}));
    clock.advance(HOUR);
    b.edit(&b_id, json!({"name": "Dining"}));
    a.context.run_sync_cycle().await.unwrap();

    let parked = b.context.run_sync_cycle().await.unwrap();
    assert_eq!(parked.conflicted, 1);
    assert_eq!(b.get(&b_id).sync_status, SyncStatus::Conflict);
    assert_eq!(b.get(&b_id).payload["name"], "Dining");

    let stats = b.context.sync_statistics().unwrap();
    assert_eq!(stats.open_conflicts, 1);
    assert_eq!(stats.conflicted_entities, vec![b_id.clone()]);
    assert_eq!(stats.per_type_progress[&EntityType::Category].conflicted, 1);

    // Parked entities refuse further edits.
    let entity = b.get(&b_id);
    assert!(matches!(
        b.context.enqueue_local_change(entity, OperationKind::Update),
        Err(SyncError::ConflictDetected(_))
    ));

    let conflict = b.context.open_conflicts().remove(0);
    assert_eq!(conflict.remote_payload["name"], "Groceries");
    assert!(matches!(
        b.context
            .resolve_conflict(&conflict.id, ResolutionStrategy::ManualResolution, None),
        Err(SyncError::InvalidConfiguration(_))
    ));

    let resolution = b
        .context
        .resolve_conflict(
            &conflict.id,
            ResolutionStrategy::ManualResolution,
            Some(json!({"name": "Groceries & Dining"})),
        )
        .unwrap();
    assert_eq!(resolution.resolved_entity.payload["name"], "Groceries & Dining");
    assert!(b.context.open_conflicts().is_empty());

    let pushed = b.context.run_sync_cycle().await.unwrap();
    assert_eq!(pushed.succeeded, 1);
    assert_eq!(
        remote.entity(&remote_id).unwrap().payload["name"],
        "Groceries & Dining"
    );
    assert_eq!(b.get(&b_id).sync_status, SyncStatus::InSync);

    let archived = b.context.queue().archived_conflicts();
    assert_eq!(archived[0].resolved_by.as_deref(), Some("user"));
}

#[tokio::test]
async fn manual_resolution_can_take_remote() {
    let (remote, clock) = setup();
    let a = Device::new("device-a", &remote, &clock);
    let b = Device::with_config("device-b", &remote, &clock, |c| {
        c.with_strategy(EntityType::Category, ResolutionStrategy::ManualResolution)
    });

    a.create(EntityType::Category, "c1", json!({"name": "Food"}));
    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();
    let remote_id = a.get("c1").remote_id.unwrap();
    let b_id = b.by_remote(EntityType::Category, &remote_id).local_id;

    clock.advance(HOUR);
    a.edit("c1", json!({"name": "Groceries"}));
    clock.advance(MINUTE);
    b.edit(&b_id, json!({"name": "Dining"}));
    a.context.run_sync_cycle().await.unwrap();
    b.context.run_sync_cycle().await.unwrap();

    let conflict = b.context.open_conflicts().remove(0);
    // Taking the remote payload needs no further upload.
    b.context
        .resolve_conflict(
            &conflict.id,
            ResolutionStrategy::ManualResolution,
            Some(conflict.remote_payload.clone()),
        )
        .unwrap();

    assert_eq!(b.get(&b_id).payload["name"], "Groceries");
    assert_eq!(b.get(&b_id).sync_status, SyncStatus::InSync);
    assert_eq!(b.context.queue().pending_count(), 0);
}

// ============================================================================
// Failures, retries and cancellation
// ============================================================================

#[tokio::test]
async fn one_network_failure_in_a_batch_is_retried() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    for i in 0..10 {
        device.create(EntityType::Category, &format!("c{i}"), json!({"name": format!("c{i}")}));
    }
    remote.fail_next_push("c3", 1);

    let result = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.succeeded, 10);
    assert_eq!(result.failed, 0);
    assert!(result.watermark_advanced);

    // The other nine went through before the retry.
    let log = remote.push_log();
    assert_eq!(log.len(), 10);
    assert_eq!(log[9].1, "c3");

    let op = device
        .context
        .queue()
        .operations_for_entity("c3")
        .pop()
        .unwrap();
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.retry_count, 1);
}

#[tokio::test]
async fn persistent_network_failure_aborts_cycle() {
    let (remote, clock) = setup();
    let device = Device::with_config("device-a", &remote, &clock, |c| c.with_max_retries(2));
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    device.create(EntityType::Category, "c2", json!({"name": "Transport"}));
    remote.fail_next_push("c2", 10);

    let result = device.context.run_sync_cycle().await;
    // c2 is alone in its last batches, so the cycle gives up on the network.
    assert!(matches!(result, Err(SyncError::Network(_))));

    let op = device.context.queue().operations_for_entity("c2").pop().unwrap();
    assert_eq!(device.get("c1").sync_status, SyncStatus::InSync);
    assert!(op.retry_count >= 1);
    assert!(device.context.queue().last_sync_timestamp().is_none());
}

#[tokio::test]
async fn unreachable_remote_keeps_work_queued() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    remote.set_unreachable(true);

    let result = device.context.run_sync_cycle().await;
    assert!(matches!(result, Err(SyncError::Network(_))));
    assert_eq!(device.context.queue().pending_count(), 1);
    assert!(device.context.queue().last_sync_timestamp().is_none());

    remote.set_unreachable(false);
    let result = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.succeeded, 1);
}

#[tokio::test]
async fn poor_network_survives_one_dropped_request() {
    let (remote, clock) = setup();
    let device = Device::with_config("device-a", &remote, &clock, |c| {
        c.with_network_quality(NetworkQuality::Poor)
    });
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    device.create(EntityType::Category, "c2", json!({"name": "Transport"}));
    device.create(EntityType::Tag, "g1", json!({"name": "bus", "categoryId": "c2"}));
    remote.fail_next_push("c1", 1);

    let result = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.failed, 0);
    assert!(result.watermark_advanced);
    for id in ["c1", "c2", "g1"] {
        assert!(device.get(id).remote_id.is_some(), "{id} not uploaded");
    }
}

#[tokio::test]
async fn poor_network_still_gives_up_when_unreachable() {
    let (remote, clock) = setup();
    let device = Device::with_config("device-a", &remote, &clock, |c| {
        c.with_network_quality(NetworkQuality::Poor)
    });
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    remote.set_unreachable(true);

    let result = device.context.run_sync_cycle().await;
    assert!(matches!(result, Err(SyncError::Network(_))));
    let op = device.context.queue().operations_for_entity("c1").pop().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(device.context.queue().pending_count(), 1);
}

#[tokio::test]
async fn failed_operations_can_be_retried_by_hand() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));
    device.create(EntityType::Category, "c2", json!({"name": "Transport"}));

    // Unknown remote id: the remote store rejects the update for good.
    let mut orphan = device.get("c2");
    orphan.remote_id = Some("srv-404".into());
    device.local.put(orphan).unwrap();
    device.edit("c2", json!({"name": "Transit"}));

    let result = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.failed, 1);
    let stats = device.context.sync_statistics().unwrap();
    assert_eq!(stats.failed_entities, vec!["c2".to_string()]);
    assert!(device.get("c2").sync_error_message.unwrap().contains("rejected"));

    // Forget the bogus id and retry.
    let mut fixed = device.get("c2");
    fixed.remote_id = None;
    device.local.put(fixed).unwrap();
    assert_eq!(device.context.retry_failed().unwrap(), 1);
    assert_eq!(device.get("c2").sync_status, SyncStatus::NeedsUpload);

    let result = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.succeeded, 1);
    assert!(device.context.sync_statistics().unwrap().failed_entities.is_empty());
}

#[tokio::test]
async fn concurrent_requests_share_one_cycle() {
    let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(50)));
    let clock = Arc::new(ManualClock::new(START));
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Category, "c1", json!({"name": "Food"}));

    let (first, second) = tokio::join!(
        device.context.run_sync_cycle(),
        device.context.run_sync_cycle()
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first, second);
    assert_eq!(first.succeeded, 1);
    assert_eq!(remote.push_calls(), 1);

    // The slot is free again afterwards.
    let third = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(third.succeeded, 0);
}

#[tokio::test]
async fn concurrency_limit_is_respected() {
    let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(20)));
    let clock = Arc::new(ManualClock::new(START));
    let device =
        Device::with_config("device-a", &remote, &clock, |c| c.with_concurrency_limit(3));
    for i in 0..12 {
        device.create(EntityType::Category, &format!("c{i}"), json!({"name": format!("c{i}")}));
    }

    let result = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(result.succeeded, 12);
    assert!(remote.max_in_flight() <= 3);
    assert!(remote.max_in_flight() >= 2);
}

#[tokio::test]
async fn cancel_stops_at_batch_boundary() {
    let remote = Arc::new(InMemoryRemote::new().with_latency(Duration::from_millis(100)));
    let clock = Arc::new(ManualClock::new(START));
    let device = Arc::new(Device::new("device-a", &remote, &clock));
    for i in 0..3 {
        device.create(EntityType::Category, &format!("c{i}"), json!({"name": format!("c{i}")}));
    }
    device.create(EntityType::Trip, "t1", json!({"title": "Lisbon"}));

    let running = {
        let device = device.clone();
        tokio::spawn(async move { device.context.run_sync_cycle().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    device.context.cancel_sync();

    let result = running.await.unwrap();
    assert!(matches!(result, Err(SyncError::Cancelled)));

    let queue = device.context.queue();
    assert!(queue
        .operations()
        .iter()
        .all(|op| op.status != OperationStatus::InProgress));
    assert_eq!(
        queue.operations_for_entity("t1").pop().unwrap().status,
        OperationStatus::Pending
    );
    assert!(queue.last_sync_timestamp().is_none());

    let resumed = device.context.run_sync_cycle().await.unwrap();
    assert_eq!(resumed.succeeded, 1);
}

// ============================================================================
// Files and persistence
// ============================================================================

#[tokio::test]
async fn attachments_wait_for_their_files() {
    let (remote, clock) = setup();
    let device = Device::new("device-a", &remote, &clock);
    device.create(EntityType::Trip, "t1", json!({"title": "Lisbon"}));
    device.create(EntityType::Note, "n1", json!({"tripId": "t1", "body": "day one"}));
    device.create(
        EntityType::Attachment,
        "a1",
        json!({"noteId": "n1", "fileName": "tram.jpg", "localPath": "/tmp/tram.jpg"}),
    );

    device.context.run_sync_cycle().await.unwrap();
    let attachment = device.get("a1");
    assert_eq!(attachment.sync_status, SyncStatus::FilesPending);

    let server = remote.entity(attachment.remote_id.as_deref().unwrap()).unwrap();
    assert!(server.payload.get("localPath").is_none());

    device.context.mark_files_uploaded("a1").unwrap();
    assert_eq!(device.get("a1").sync_status, SyncStatus::InSync);
    assert_eq!(device.context.tracker().status("a1"), Some(SyncStatus::InSync));
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync-state.json");
    let (remote, clock) = setup();
    let local = Arc::new(MemoryLocalStore::new());

    {
        let context = SyncContext::builder(remote.clone(), local.clone())
            .config(SyncConfig::new("device-a"))
            .storage(Arc::new(JsonFileStorage::new(&path)))
            .clock(clock.clone())
            .build()
            .unwrap();
        for id in ["c1", "c2"] {
            let entity = SyncableEntity::new(EntityType::Category, json!({"name": id}))
                .with_local_id(id);
            context
                .enqueue_local_change(entity, OperationKind::Create)
                .unwrap();
        }
    }
    assert!(path.exists());

    let context = SyncContext::builder(remote.clone(), local.clone())
        .config(SyncConfig::new("device-a"))
        .storage(Arc::new(JsonFileStorage::new(&path)))
        .clock(clock)
        .build()
        .unwrap();
    assert_eq!(context.queue().pending_count(), 2);
    assert_eq!(context.tracker().status("c1"), Some(SyncStatus::NeedsUpload));

    let result = context.run_sync_cycle().await.unwrap();
    assert_eq!(result.succeeded, 2);
    assert_eq!(remote.entities().len(), 2);
}
