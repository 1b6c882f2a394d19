//! Snapshot types for persisting and restoring engine state.
//!
//! A snapshot holds everything the engine needs to pick up after a restart:
//! the live queue with its retry schedule and version cache, conflicts and
//! their resolutions, and the bounded consistency history. Network estimates
//! are not persisted.

use crate::conflict::ConflictRecord;
use crate::consistency::{Alert, ConsistencyCheckResult};
use crate::queue::QueueState;
use crate::{error::Result, Error, OperationStatus, SchemaVersion, Timestamp};
use serde::{Deserialize, Serialize};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the engine state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    /// Snapshot format version
    pub format_version: u32,
    /// Schema version at time of snapshot
    pub schema_version: SchemaVersion,
    pub taken_at: Timestamp,
    /// Queue contents; operations waiting on a retry keep their
    /// `next_retry_time`
    pub queue: QueueState,
    /// Open and resolved conflicts
    #[serde(default)]
    pub conflicts: Vec<ConflictRecord>,
    #[serde(default)]
    pub check_history: Vec<ConsistencyCheckResult>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl EngineSnapshot {
    /// Create a new empty snapshot.
    pub fn new(schema_version: SchemaVersion, taken_at: Timestamp) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            schema_version,
            taken_at,
            queue: QueueState::default(),
            conflicts: Vec::new(),
            check_history: Vec::new(),
            alerts: Vec::new(),
        }
    }

    /// Operations not yet completed or failed.
    pub fn pending_count(&self) -> usize {
        self.queue
            .operations
            .iter()
            .filter(|op| {
                matches!(
                    op.status,
                    OperationStatus::Pending | OperationStatus::Processing
                )
            })
            .count()
    }

    /// Conflicts without a resolution.
    pub fn open_conflicts(&self) -> usize {
        self.conflicts.iter().filter(|c| !c.is_resolved()).count()
    }

    /// Check the snapshot can be loaded under the given schema version.
    pub fn validate(&self, schema_version: SchemaVersion) -> Result<()> {
        if self.schema_version != schema_version {
            return Err(Error::InvalidSnapshot(format!(
                "schema version {} does not match engine schema version {}",
                self.schema_version, schema_version
            )));
        }
        Ok(())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}

/// Metadata about a snapshot (without the full data).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    pub schema_version: SchemaVersion,
    pub taken_at: Timestamp,
    pub pending_count: usize,
    pub open_conflicts: usize,
    pub alert_count: usize,
}

impl From<&EngineSnapshot> for SnapshotMetadata {
    fn from(snapshot: &EngineSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            schema_version: snapshot.schema_version,
            taken_at: snapshot.taken_at,
            pending_count: snapshot.pending_count(),
            open_conflicts: snapshot.open_conflicts(),
            alert_count: snapshot.alerts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictType, VersionSnapshot};
    use crate::Operation;
    use serde_json::json;

    fn sample() -> EngineSnapshot {
        let mut snapshot = EngineSnapshot::new(1, 5_000);
        let mut waiting = Operation::update("card", "c1", json!({"title": "A"})).with_id("op-1");
        waiting.retry_count = 2;
        waiting.next_retry_time = Some(9_000);
        snapshot.queue.operations.push(waiting);
        snapshot.conflicts.push(ConflictRecord::new(
            "card",
            "c2",
            ConflictType::ConcurrentModification,
            VersionSnapshot::new(json!({"title": "mine"}), 2, 4_000),
            VersionSnapshot::new(json!({"title": "theirs"}), 3, 4_100),
            4_200,
        ));
        snapshot
    }

    #[test]
    fn json_roundtrip() {
        let snapshot = sample();
        let restored = EngineSnapshot::from_json(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(snapshot, restored);
        assert_eq!(restored.queue.operations[0].next_retry_time, Some(9_000));
    }

    #[test]
    fn metadata() {
        let metadata = SnapshotMetadata::from(&sample());
        assert_eq!(metadata.format_version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(metadata.pending_count, 1);
        assert_eq!(metadata.open_conflicts, 1);
        assert_eq!(metadata.alert_count, 0);
    }

    #[test]
    fn reject_future_format_version() {
        let json = r#"{
            "formatVersion": 999,
            "schemaVersion": 1,
            "takenAt": 0,
            "queue": {"operations": []}
        }"#;

        let result = EngineSnapshot::from_json(json);
        assert!(matches!(result, Err(Error::InvalidSnapshot(_))));
    }

    #[test]
    fn schema_version_must_match() {
        let snapshot = EngineSnapshot::new(2, 0);
        assert!(snapshot.validate(2).is_ok());
        assert!(matches!(snapshot.validate(1), Err(Error::InvalidSnapshot(_))));
    }

    #[test]
    fn missing_optional_sections_default() {
        let json = r#"{
            "formatVersion": 1,
            "schemaVersion": 1,
            "takenAt": 0,
            "queue": {"operations": []}
        }"#;
        let snapshot = EngineSnapshot::from_json(json).unwrap();
        assert!(snapshot.conflicts.is_empty());
        assert!(snapshot.alerts.is_empty());
    }
}
