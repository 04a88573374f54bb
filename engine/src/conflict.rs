//! Conflict detection and resolution.
//!
//! A conflict arises when the remote store rejects a write because its
//! version moved on, or when a download meets an entity with unsynced local
//! changes. The [`ConflictDetector`] decides whether the two sides really
//! diverge; the [`ConflictResolver`] produces a single resolved entity under
//! a [`ResolutionStrategy`].
//!
//! # Strategies
//!
//! - `LastWriteWins`: later `updated_at` wins wholesale, ties favor local
//! - `FieldLevelMerge`: each differing field is taken from the side that
//!   wrote it last; the result gets `version = max(local, remote) + 1`
//! - `DevicePriority`: the side whose origin device scores higher wins
//! - `ManualResolution`: nothing is applied; the entity waits for an
//!   explicit resolution

use crate::{
    error::SyncResult, ConflictId, DeviceId, EntityId, EntityType, SyncableEntity, Timestamp,
    Version,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Updates closer together than this are treated as the same write.
pub const CLOCK_SKEW_TOLERANCE_MS: u64 = 1_000;

/// Shape of a detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    /// One or two fields differ
    SimpleUpdate,
    /// More than two fields differ
    ComplexUpdate,
    /// One side deleted the entity while the other kept it
    DeletionConflict,
}

/// How to pick a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    LastWriteWins,
    FieldLevelMerge,
    DevicePriority,
    ManualResolution,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriteWins => "lastWriteWins",
            ResolutionStrategy::FieldLevelMerge => "fieldLevelMerge",
            ResolutionStrategy::DevicePriority => "devicePriority",
            ResolutionStrategy::ManualResolution => "manualResolution",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side a resolution took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Winner {
    Local,
    Remote,
    /// Fields from both sides, or an externally supplied payload
    Merged,
    /// Waiting for manual resolution
    Undecided,
}

/// Outcome of [`ConflictDetector::detect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetection {
    pub has_conflict: bool,
    /// Differing payload fields, sorted
    pub conflicted_fields: Vec<String>,
    pub conflict_type: Option<ConflictType>,
}

impl ConflictDetection {
    fn none(conflicted_fields: Vec<String>) -> Self {
        Self {
            has_conflict: false,
            conflicted_fields,
            conflict_type: None,
        }
    }

    fn found(conflict_type: ConflictType, conflicted_fields: Vec<String>) -> Self {
        Self {
            has_conflict: true,
            conflicted_fields,
            conflict_type: Some(conflict_type),
        }
    }
}

/// Outcome of [`ConflictResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResult {
    pub resolved_entity: SyncableEntity,
    pub strategy: ResolutionStrategy,
    pub winner: Winner,
    /// Human-readable audit line
    pub details: String,
}

impl ConflictResult {
    /// True if the resolution left the entity waiting for a manual decision.
    pub fn is_deferred(&self) -> bool {
        self.winner == Winner::Undecided
    }
}

/// Compares the two sides of a possible conflict.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    skew_tolerance_ms: u64,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self {
            skew_tolerance_ms: CLOCK_SKEW_TOLERANCE_MS,
        }
    }
}

impl ConflictDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skew_tolerance(mut self, millis: u64) -> Self {
        self.skew_tolerance_ms = millis;
        self
    }

    /// Detect whether `local` and `remote` diverge.
    ///
    /// The result is symmetric: swapping the arguments yields the same
    /// `conflicted_fields` and `conflict_type`.
    pub fn detect(&self, local: &SyncableEntity, remote: &SyncableEntity) -> ConflictDetection {
        let fields = differing_fields(local, remote);

        if local.updated_at.abs_diff(remote.updated_at) < self.skew_tolerance_ms {
            return ConflictDetection::none(fields);
        }

        if local.deleted != remote.deleted {
            return ConflictDetection::found(ConflictType::DeletionConflict, fields);
        }
        if local.deleted {
            return ConflictDetection::none(Vec::new());
        }

        match fields.len() {
            0 => ConflictDetection::none(fields),
            1 | 2 => ConflictDetection::found(ConflictType::SimpleUpdate, fields),
            _ => ConflictDetection::found(ConflictType::ComplexUpdate, fields),
        }
    }
}

/// Payload fields whose values differ, excluding device-local fields.
/// A field present on one side only counts as differing.
pub fn differing_fields(a: &SyncableEntity, b: &SyncableEntity) -> Vec<String> {
    let left = a.fields();
    let right = b.fields();
    let local_only = a.handler().local_only;

    left.keys()
        .chain(right.keys())
        .filter(|name| !local_only.contains(&name.as_str()))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|name| left.get(*name) != right.get(*name))
        .cloned()
        .collect()
}

/// Applies a [`ResolutionStrategy`] to a local/remote pair.
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    device_priorities: BTreeMap<DeviceId, i32>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure the scores used by `DevicePriority`.
    pub fn with_device_priorities(mut self, priorities: BTreeMap<DeviceId, i32>) -> Self {
        self.device_priorities = priorities;
        self
    }

    /// Score of a device; unknown devices score 0.
    pub fn device_score(&self, device: &str) -> i32 {
        self.device_priorities.get(device).copied().unwrap_or(0)
    }

    /// Resolve a conflict between `local` and `remote`.
    ///
    /// `remote` must already carry the local id and local references.
    pub fn resolve(
        &self,
        local: &SyncableEntity,
        remote: &SyncableEntity,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ConflictResult> {
        let result = match strategy {
            ResolutionStrategy::LastWriteWins => {
                if remote.updated_at > local.updated_at {
                    whole(local, remote, Winner::Remote, strategy, "remote written later")
                } else {
                    whole(local, remote, Winner::Local, strategy, "local written later or same time")
                }
            }
            ResolutionStrategy::DevicePriority => {
                let local_score = self.device_score(&local.origin_device);
                let remote_score = self.device_score(&remote.origin_device);
                let details = format!(
                    "device '{}' scores {local_score}, device '{}' scores {remote_score}",
                    local.origin_device, remote.origin_device
                );
                if remote_score > local_score {
                    whole(local, remote, Winner::Remote, strategy, details)
                } else {
                    whole(local, remote, Winner::Local, strategy, details)
                }
            }
            ResolutionStrategy::FieldLevelMerge => {
                if local.deleted != remote.deleted {
                    let mut result =
                        self.resolve(local, remote, ResolutionStrategy::LastWriteWins)?;
                    result.strategy = strategy;
                    result.details = format!("deletion cannot be merged, {}", result.details);
                    result
                } else {
                    merge_fields(local, remote)
                }
            }
            ResolutionStrategy::ManualResolution => {
                let mut parked = local.clone();
                parked.sync_status = crate::SyncStatus::Conflict;
                ConflictResult {
                    resolved_entity: parked,
                    strategy,
                    winner: Winner::Undecided,
                    details: "awaiting manual resolution".to_string(),
                }
            }
        };

        tracing::debug!(
            entity_id = %local.local_id,
            strategy = %strategy,
            winner = ?result.winner,
            "conflict resolved"
        );
        Ok(result)
    }

    /// Resolve with an externally supplied payload.
    pub fn resolve_with_payload(
        &self,
        local: &SyncableEntity,
        remote: &SyncableEntity,
        payload: Value,
        now: Timestamp,
    ) -> SyncResult<ConflictResult> {
        let mut resolved = local.clone();
        resolved.payload = payload;
        resolved.validate_for_sync()?;
        resolved.deleted = false;
        resolved.remote_id = remote.remote_id.clone().or_else(|| local.remote_id.clone());
        resolved.version = local.version.max(remote.version);
        resolved.stamp_all_fields(now.max(local.updated_at).max(remote.updated_at));

        Ok(ConflictResult {
            resolved_entity: resolved,
            strategy: ResolutionStrategy::ManualResolution,
            winner: Winner::Merged,
            details: "manual payload supplied".to_string(),
        })
    }
}

/// Take one side wholesale, keeping local identity and device-local fields.
fn whole(
    local: &SyncableEntity,
    remote: &SyncableEntity,
    winner: Winner,
    strategy: ResolutionStrategy,
    details: impl Into<String>,
) -> ConflictResult {
    let mut resolved = match winner {
        Winner::Remote => {
            let mut taken = remote.clone();
            keep_local_only_fields(local, &mut taken);
            taken
        }
        _ => local.clone(),
    };
    resolved.local_id = local.local_id.clone();
    resolved.remote_id = remote.remote_id.clone().or_else(|| local.remote_id.clone());
    resolved.version = local.version.max(remote.version);

    ConflictResult {
        resolved_entity: resolved,
        strategy,
        winner,
        details: details.into(),
    }
}

fn merge_fields(local: &SyncableEntity, remote: &SyncableEntity) -> ConflictResult {
    let mut merged: Map<String, Value> = local.fields();
    let remote_fields = remote.fields();
    let mut field_timestamps = local.field_timestamps.clone();
    let (mut from_local, mut from_remote) = (Vec::new(), Vec::new());

    for name in differing_fields(local, remote) {
        let local_ts = local.field_timestamp(&name);
        let remote_ts = remote.field_timestamp(&name);
        if remote_ts > local_ts {
            match remote_fields.get(&name) {
                Some(value) => merged.insert(name.clone(), value.clone()),
                None => merged.remove(&name),
            };
            from_remote.push(name.clone());
        } else {
            from_local.push(name.clone());
        }
        field_timestamps.insert(name, local_ts.max(remote_ts));
    }

    for (name, ts) in &remote.field_timestamps {
        let entry = field_timestamps.entry(name.clone()).or_insert(*ts);
        *entry = (*entry).max(*ts);
    }

    let winner = match (from_local.is_empty(), from_remote.is_empty()) {
        (_, true) => Winner::Local,
        (true, false) => Winner::Remote,
        (false, false) => Winner::Merged,
    };

    let mut resolved = local.clone();
    resolved.payload = Value::Object(merged);
    resolved.field_timestamps = field_timestamps;
    resolved.remote_id = remote.remote_id.clone().or_else(|| local.remote_id.clone());
    resolved.updated_at = local.updated_at.max(remote.updated_at);
    resolved.version = local.version.max(remote.version) + 1;

    ConflictResult {
        resolved_entity: resolved,
        strategy: ResolutionStrategy::FieldLevelMerge,
        winner,
        details: format!(
            "local fields {:?}, remote fields {:?}",
            from_local, from_remote
        ),
    }
}

pub(crate) fn keep_local_only_fields(local: &SyncableEntity, target: &mut SyncableEntity) {
    let local_fields = local.fields();
    if let Value::Object(fields) = &mut target.payload {
        for name in local.handler().local_only {
            if let Some(value) = local_fields.get(*name) {
                fields.insert((*name).to_string(), value.clone());
            }
        }
    }
}

/// Audit record of one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub local_version: Version,
    pub remote_version: Version,
    pub local_payload: Value,
    pub remote_payload: Value,
    pub conflicted_fields: Vec<String>,
    pub conflict_type: ConflictType,
    pub strategy: ResolutionStrategy,
    pub resolved_payload: Option<Value>,
    pub resolved_at: Option<Timestamp>,
    pub resolved_by: Option<String>,
    pub created_at: Timestamp,
    /// Audit line of the last decision
    pub details: String,
    /// Remote side as seen when the conflict was detected
    pub remote_snapshot: SyncableEntity,
}

impl ConflictRecord {
    /// Open a record for a detected conflict.
    pub fn new(
        local: &SyncableEntity,
        remote: &SyncableEntity,
        detection: &ConflictDetection,
        strategy: ResolutionStrategy,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            entity_type: local.entity_type,
            entity_id: local.local_id.clone(),
            local_version: local.version,
            remote_version: remote.version,
            local_payload: local.payload.clone(),
            remote_payload: remote.payload.clone(),
            conflicted_fields: detection.conflicted_fields.clone(),
            conflict_type: detection
                .conflict_type
                .unwrap_or(ConflictType::SimpleUpdate),
            strategy,
            resolved_payload: None,
            resolved_at: None,
            resolved_by: None,
            created_at,
            details: String::new(),
            remote_snapshot: remote.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Record the decision and close the record.
    pub fn close(&mut self, result: &ConflictResult, resolved_by: impl Into<String>, at: Timestamp) {
        self.strategy = result.strategy;
        self.resolved_payload = Some(result.resolved_entity.payload.clone());
        self.resolved_at = Some(at);
        self.resolved_by = Some(resolved_by.into());
        self.details = result.details.clone();
    }
}
