//! Operation types for expressing queued mutations.
//!
//! Changes are expressed as operations, not direct mutations. An operation is
//! validated and stamped by the queue (version, checksum, enqueue time), then
//! carried through prediction, transmission, retry and acknowledgement.

use crate::codec;
use crate::retry::BackoffStrategy;
use crate::{EntityId, EntityKey, EntityType, OperationId, Record, Timestamp, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Default number of retries before an operation fails for good.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Dispatch priority. Declaration order is ascending, so `Critical` is the max.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Background,
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// All priorities, highest first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Background,
    ];

    /// Numeric rank, 0 for background up to 4 for critical.
    pub fn rank(self) -> u8 {
        match self {
            Priority::Background => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Critical => 4,
        }
    }

    /// Priority for a rank, saturating at critical.
    pub fn from_rank(rank: u8) -> Self {
        match rank {
            0 => Priority::Background,
            1 => Priority::Low,
            2 => Priority::Normal,
            3 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Background => "background",
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// What the operation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Re-sync the local copy from the remote; never mutates the remote
    Pull,
}

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Local state of the entity before the operation's optimistic write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PriorState {
    /// The record did not exist locally
    Absent,
    /// The record existed with this content, possibly as a tombstone
    Present(Record),
}

/// Telemetry accumulated over an operation's attempts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub created_at: Timestamp,
    pub first_attempt_at: Option<Timestamp>,
    pub last_attempt_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    /// Cumulative time spent in remote calls
    pub total_duration_ms: u64,
    pub success_count: u32,
    pub failure_count: u32,
    pub bytes_transferred: u64,
    /// Compressed size over original size, when the payload was compressed
    pub compression_ratio: Option<f64>,
}

impl ExecutionStats {
    fn record_attempt(&mut self, now: Timestamp) {
        self.first_attempt_at.get_or_insert(now);
        self.last_attempt_at = Some(now);
    }

    /// Account for a successful transmission.
    pub fn record_success(
        &mut self,
        now: Timestamp,
        duration_ms: u64,
        bytes: u64,
        compression_ratio: Option<f64>,
    ) {
        self.success_count += 1;
        self.total_duration_ms += duration_ms;
        self.bytes_transferred += bytes;
        self.completed_at = Some(now);
        if compression_ratio.is_some() {
            self.compression_ratio = compression_ratio;
        }
    }

    /// Account for a failed transmission.
    pub fn record_failure(&mut self, duration_ms: u64) {
        self.failure_count += 1;
        self.total_duration_ms += duration_ms;
    }
}

/// A single pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation ID
    pub id: OperationId,
    /// Target entity type
    pub entity_type: EntityType,
    /// Target entity ID
    pub entity_id: EntityId,
    /// Create, update, delete or pull
    pub kind: OperationKind,
    /// Payload; `Null` for deletes and pulls
    #[serde(default)]
    pub data: serde_json::Value,
    /// Compressed encoding of `data` from the last transmission attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_data: Option<Vec<u8>>,
    /// Hex SHA-256 of the canonical encoding of `data`
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub priority: Priority,
    /// Operations that must complete before this one dispatches
    #[serde(default)]
    pub dependencies: BTreeSet<OperationId>,
    /// Per-entity version assigned at enqueue
    #[serde(default)]
    version: Version,
    /// Remote version the edit was made against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_time: Option<Timestamp>,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Per-operation timeout for the remote call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub stats: ExecutionStats,
    #[serde(default)]
    pub enqueued_at: Timestamp,
    /// Re-read the remote version before sending
    #[serde(default)]
    pub requires_validation: bool,
    /// Cancelled while in flight; undo once the remote acknowledges
    #[serde(default)]
    pub rollback_on_completion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_state: Option<PriorState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Operation {
    /// Create a new operation with a random id.
    pub fn new(
        kind: OperationKind,
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            kind,
            data,
            compressed_data: None,
            checksum: String::new(),
            priority: Priority::default(),
            dependencies: BTreeSet::new(),
            version: 0,
            base_version: None,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            next_retry_time: None,
            backoff: BackoffStrategy::default(),
            timeout_ms: None,
            stats: ExecutionStats::default(),
            enqueued_at: 0,
            requires_validation: false,
            rollback_on_completion: false,
            prior_state: None,
            last_error: None,
        }
    }

    /// Create operation.
    pub fn create(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(OperationKind::Create, entity_type, entity_id, data)
    }

    /// Update operation.
    pub fn update(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        data: serde_json::Value,
    ) -> Self {
        Self::new(OperationKind::Update, entity_type, entity_id, data)
    }

    /// Delete operation.
    pub fn delete(entity_type: impl Into<EntityType>, entity_id: impl Into<EntityId>) -> Self {
        Self::new(
            OperationKind::Delete,
            entity_type,
            entity_id,
            serde_json::Value::Null,
        )
    }

    /// Pull operation: refresh the local copy from the remote.
    pub fn pull(entity_type: impl Into<EntityType>, entity_id: impl Into<EntityId>) -> Self {
        Self::new(
            OperationKind::Pull,
            entity_type,
            entity_id,
            serde_json::Value::Null,
        )
    }

    pub fn with_id(mut self, id: impl Into<OperationId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency that must complete first.
    pub fn depends_on(mut self, id: impl Into<OperationId>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_base_version(mut self, version: Version) -> Self {
        self.base_version = Some(version);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Per-entity version; zero until the queue assigns one.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Assign the version once. Later calls are ignored.
    pub(crate) fn assign_version(&mut self, version: Version) {
        if self.version == 0 {
            self.version = version;
        }
    }

    /// `(entity_type, entity_id)` pair.
    pub fn entity_key(&self) -> EntityKey {
        (self.entity_type.clone(), self.entity_id.clone())
    }

    /// Whether this operation targets the given entity.
    pub fn targets(&self, entity_type: &str, entity_id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id == entity_id
    }

    /// Key identifying semantically identical mutations.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}/{}/{:?}/{}",
            self.entity_type, self.entity_id, self.kind, self.checksum
        )
    }

    /// Recompute the checksum from the current payload.
    pub fn refresh_checksum(&mut self) {
        self.checksum = codec::checksum(&self.data);
    }

    /// True if the stored checksum matches the payload.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == codec::checksum(&self.data)
    }

    /// Whether the operation changes the remote store.
    pub fn mutates_remote(&self) -> bool {
        !matches!(self.kind, OperationKind::Pull)
    }

    pub(crate) fn mark_processing(&mut self, now: Timestamp) {
        self.status = OperationStatus::Processing;
        self.stats.record_attempt(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Low > Priority::Background);
        assert_eq!(Priority::ALL[0], Priority::Critical);
    }

    #[test]
    fn priority_rank_roundtrip() {
        for p in Priority::ALL {
            assert_eq!(Priority::from_rank(p.rank()), p);
        }
        assert_eq!(Priority::from_rank(200), Priority::Critical);
    }

    #[test]
    fn builder() {
        let op = Operation::update("card", "c1", json!({"title": "A"}))
            .with_id("op-1")
            .with_priority(Priority::High)
            .depends_on("op-0")
            .with_base_version(3)
            .with_max_retries(2)
            .with_timeout(500);

        assert_eq!(op.id, "op-1");
        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(op.priority, Priority::High);
        assert!(op.dependencies.contains("op-0"));
        assert_eq!(op.base_version, Some(3));
        assert_eq!(op.max_retries, 2);
        assert_eq!(op.timeout_ms, Some(500));
        assert_eq!(op.status, OperationStatus::Pending);
    }

    #[test]
    fn version_is_assigned_once() {
        let mut op = Operation::create("card", "c1", json!({}));
        assert_eq!(op.version(), 0);
        op.assign_version(4);
        op.assign_version(9);
        assert_eq!(op.version(), 4);
    }

    #[test]
    fn checksum_tracks_payload() {
        let mut op = Operation::create("card", "c1", json!({"title": "A"}));
        assert!(!op.verify_checksum());
        op.refresh_checksum();
        assert!(op.verify_checksum());

        op.data = json!({"title": "B"});
        assert!(!op.verify_checksum());
    }

    #[test]
    fn dedup_key_ignores_id() {
        let mut a = Operation::update("card", "c1", json!({"title": "A"})).with_id("a");
        let mut b = Operation::update("card", "c1", json!({"title": "A"})).with_id("b");
        a.refresh_checksum();
        b.refresh_checksum();
        assert_eq!(a.dedup_key(), b.dedup_key());

        let mut c = Operation::update("card", "c1", json!({"title": "C"}));
        c.refresh_checksum();
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn pull_does_not_mutate_remote() {
        assert!(!Operation::pull("card", "c1").mutates_remote());
        assert!(Operation::delete("card", "c1").mutates_remote());
    }

    #[test]
    fn serialization_keeps_version() {
        let mut op = Operation::create("card", "c1", json!({"title": "A"})).with_id("op-1");
        op.assign_version(7);

        let json = serde_json::to_string(&op).unwrap();
        assert!(json.contains("\"kind\":\"create\""));
        assert!(json.contains("\"entityType\":\"card\""));

        let parsed: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.version(), 7);
        assert_eq!(op, parsed);
    }
}
