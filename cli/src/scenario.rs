//! Scenario replay.
//!
//! A scenario file describes a schema, the records each side already holds
//! and the local operations to queue:
//!
//! ```json
//! {
//!   "schema": {"version": 1, "entities": {"card": {"name": "card", "fields": [...]}}},
//!   "remote": [{"entityType": "card", "id": "c1", "version": 3, "data": {...}, "updatedAt": 0}],
//!   "local": [],
//!   "operations": [{"entityType": "card", "entityId": "c1", "kind": "update", "data": {...}}]
//! }
//! ```
//!
//! The scenario runs against the in-memory store and remote.

use crate::error::CliError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_engine::{
    Alert, CheckStatus, CheckType, ConflictRecord, EngineConfig, MemoryRemote, MemoryStore,
    LocalStore, Operation, OperationId, OperationKind, Priority, QueueStats, Record, Schema,
    SyncEngine, SyncSummary, Version,
};
use tracing::{debug, info, warn};

/// Parsed scenario file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub schema: Schema,
    /// Records already on the remote
    #[serde(default)]
    pub remote: Vec<Record>,
    /// Records already in the local store
    #[serde(default)]
    pub local: Vec<Record>,
    #[serde(default)]
    pub operations: Vec<OperationInput>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CliError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// An operation as written in a scenario file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInput {
    #[serde(default)]
    pub id: Option<OperationId>,
    pub entity_type: String,
    pub entity_id: String,
    pub kind: OperationKind,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<OperationId>,
    #[serde(default)]
    pub base_version: Option<Version>,
}

impl From<OperationInput> for Operation {
    fn from(input: OperationInput) -> Self {
        let mut op = Operation::new(input.kind, input.entity_type, input.entity_id, input.data)
            .with_priority(input.priority);
        if let Some(id) = input.id {
            op = op.with_id(id);
        }
        if let Some(base) = input.base_version {
            op = op.with_base_version(base);
        }
        for dep in input.depends_on {
            op = op.depends_on(dep);
        }
        op
    }
}

/// How a replay runs.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Sync passes; later passes pick up retries and repairs
    pub rounds: usize,
    pub full_check: bool,
    /// Where to write the engine snapshot afterwards
    pub snapshot: Option<PathBuf>,
}

/// Operation refused by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejected {
    pub index: usize,
    pub error: String,
}

/// Consistency outcome for one entity type.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSummary {
    pub entity_type: String,
    pub status: CheckStatus,
    /// Checks that did not come back consistent
    pub findings: Vec<CheckType>,
}

/// Everything printed after a replay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub syncs: Vec<SyncSummary>,
    pub queue: QueueStats,
    pub open_conflicts: Vec<ConflictRecord>,
    pub checks: Vec<CheckSummary>,
    pub alerts: Vec<Alert>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<Rejected>,
}

/// Run a scenario end to end.
pub async fn replay(
    scenario: Scenario,
    config: EngineConfig,
    options: ReplayOptions,
) -> Result<Report, CliError> {
    let store = Arc::new(MemoryStore::new());
    let remote = Arc::new(MemoryRemote::new());
    for record in scenario.remote {
        remote.seed(record);
    }
    for record in scenario.local {
        let collection = record.entity_type.clone();
        store.put(&collection, record).await?;
    }

    let engine = SyncEngine::with_config(scenario.schema, store, remote, config);
    let mut events = engine.subscribe();
    let listener = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(event = ?event, "engine event");
        }
    });

    let mut rejected = Vec::new();
    for (index, input) in scenario.operations.into_iter().enumerate() {
        if let Err(err) = engine.add_operation(input.into()).await {
            warn!(index, error = %err, "operation rejected");
            rejected.push(Rejected {
                index,
                error: err.to_string(),
            });
        }
    }

    let mut syncs = Vec::with_capacity(options.rounds);
    for round in 0..options.rounds.max(1) {
        let summary = engine.trigger_sync().await?;
        info!(round, completed = summary.completed, "sync round finished");
        syncs.push(summary);
    }

    let reports = if options.full_check {
        engine.perform_full_check().await?
    } else {
        engine.perform_quick_check().await?
    };
    let checks = reports
        .iter()
        .map(|report| CheckSummary {
            entity_type: report.entity_type.clone(),
            status: report.status(),
            findings: report
                .results
                .iter()
                .filter(|r| r.status != CheckStatus::Consistent)
                .map(|r| r.check_type)
                .collect(),
        })
        .collect();

    let report = Report {
        syncs,
        queue: engine.queue_stats().await,
        open_conflicts: engine.conflicts().await,
        checks,
        alerts: engine.alerts().await,
        rejected,
    };

    if let Some(path) = &options.snapshot {
        let json = engine.export_state().await.to_json_pretty()?;
        std::fs::write(path, json).map_err(|source| CliError::Io {
            path: path.clone(),
            source,
        })?;
        info!(path = %path.display(), "snapshot written");
    }

    drop(engine);
    let _ = listener.await;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn scenario_json() -> serde_json::Value {
        json!({
            "schema": {
                "version": 1,
                "entities": {
                    "card": {
                        "name": "card",
                        "fields": [
                            {"name": "title", "fieldType": "string", "required": true}
                        ]
                    }
                }
            },
            "remote": [
                {"entityType": "card", "id": "c1", "version": 2, "data": {"title": "old"}, "updatedAt": 0}
            ],
            "local": [
                {"entityType": "card", "id": "c1", "version": 2, "data": {"title": "old"}, "updatedAt": 0}
            ],
            "operations": [
                {"entityType": "card", "entityId": "c1", "kind": "update", "data": {"title": "new"}},
                {"id": "op-2", "entityType": "card", "entityId": "c2", "kind": "create", "data": {"title": "B"}, "priority": "high"},
                {"entityType": "card", "entityId": "c3", "kind": "create", "data": {}}
            ]
        })
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", scenario_json()).unwrap();
        let scenario = Scenario::load(file.path()).unwrap();
        assert_eq!(scenario.operations.len(), 3);
        assert_eq!(scenario.remote[0].version, 2);

        let op: Operation = scenario.operations[1].clone().into();
        assert_eq!(op.id, "op-2");
        assert_eq!(op.priority, Priority::High);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = Scenario::load(Path::new("/nonexistent/scenario.json")).unwrap_err();
        assert!(matches!(err, CliError::Io { .. }));
    }

    #[tokio::test]
    async fn replay_syncs_and_checks() {
        let scenario: Scenario = serde_json::from_value(scenario_json()).unwrap();
        let report = replay(
            scenario,
            EngineConfig::default(),
            ReplayOptions {
                rounds: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report.syncs[0].completed, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].index, 2);
        assert_eq!(report.queue.pending, 0);
        assert!(report.open_conflicts.is_empty());
        assert!(report
            .checks
            .iter()
            .all(|c| c.status == CheckStatus::Consistent));
    }

    #[tokio::test]
    async fn bundled_board_scenario() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios/board.json");
        let scenario = Scenario::load(&path).unwrap();
        let report = replay(
            scenario,
            EngineConfig::default(),
            ReplayOptions {
                rounds: 2,
                full_check: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(report.rejected.is_empty());
        assert_eq!(report.syncs[0].conflicts, 1);
        assert!(report.open_conflicts.is_empty());
        assert_eq!(report.queue.failed, 0);
        assert_eq!(report.queue.pending, 0);
    }

    #[tokio::test]
    async fn replay_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut scenario: Scenario = serde_json::from_value(scenario_json()).unwrap();
        // Dependency that never arrives keeps the first operation queued
        scenario.operations[0].depends_on.push("missing".into());

        let report = replay(
            scenario,
            EngineConfig::default(),
            ReplayOptions {
                rounds: 1,
                snapshot: Some(path.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(report.queue.blocked, 1);

        let raw = std::fs::read_to_string(&path).unwrap();
        let snapshot = tether_engine::EngineSnapshot::from_json(&raw).unwrap();
        assert_eq!(snapshot.pending_count(), 1);
    }
}
