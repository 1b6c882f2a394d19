//! Conflicts: detection records, prediction and resolution.
//!
//! A [`ConflictRecord`] captures both sides of a disagreement about one
//! entity, plus the last version both sides agreed on when it is known.
//! The [`ConflictPredictor`] flags risky operations before they are sent; the
//! [`ConflictResolver`] settles conflicts after they are detected.

pub mod merge;
pub mod predictor;
pub mod resolver;

pub use merge::{MergePolicy, ScalarPolicy, ThreeWayMerge};
pub use predictor::{ConflictPrediction, ConflictPredictor, PredictorWeights, PreventiveAction};
pub use resolver::{
    AcceptLocal, AcceptRemote, ConflictResolver, ManualResolution, MergeResolution, Proposal,
    ResolutionHandler,
};

use crate::{EntityId, EntityType, OperationId, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Kind of disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Both sides edited the same entity since the common base
    ConcurrentModification,
    /// One side deleted what the other updated
    DeleteUpdate,
    /// Stores disagree without a known pair of edits (found by the checker)
    DataInconsistency,
    /// Same-entity operations not ordered by their dependencies
    DependencyConflict,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConflictType::ConcurrentModification => "concurrent-modification",
            ConflictType::DeleteUpdate => "delete-update",
            ConflictType::DataInconsistency => "data-inconsistency",
            ConflictType::DependencyConflict => "dependency-conflict",
        };
        f.write_str(name)
    }
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    AcceptLocal,
    #[default]
    AcceptRemote,
    Merge,
    Manual,
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResolutionStrategy::AcceptLocal => "accept-local",
            ResolutionStrategy::AcceptRemote => "accept-remote",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept-local" => Ok(ResolutionStrategy::AcceptLocal),
            "accept-remote" => Ok(ResolutionStrategy::AcceptRemote),
            "merge" => Ok(ResolutionStrategy::Merge),
            "manual" => Ok(ResolutionStrategy::Manual),
            other => Err(format!("unknown resolution strategy: {other}")),
        }
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    /// Content; `Null` when deleted or absent
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
    pub version: Version,
    #[serde(default)]
    pub deleted: bool,
}

impl VersionSnapshot {
    pub fn new(data: serde_json::Value, version: Version, timestamp: Timestamp) -> Self {
        Self {
            data,
            timestamp,
            version,
            deleted: false,
        }
    }

    /// Snapshot of a deleted (or missing) record.
    pub fn tombstone(version: Version, timestamp: Timestamp) -> Self {
        Self {
            data: serde_json::Value::Null,
            timestamp,
            version,
            deleted: true,
        }
    }
}

/// Final decision on a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub strategy: ResolutionStrategy,
    /// Value to commit; `None` when the entity ends up deleted
    pub resolved: Option<serde_json::Value>,
    pub deleted: bool,
    /// Who decided: a handler name or `user`
    pub resolved_by: String,
    pub explanation: String,
    pub resolved_at: Timestamp,
}

/// A detected conflict on one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Operation that ran into the conflict, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<OperationId>,
    pub local: VersionSnapshot,
    pub remote: VersionSnapshot,
    /// Last version both sides agreed on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<VersionSnapshot>,
    pub conflict_type: ConflictType,
    pub detected_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl ConflictRecord {
    /// New unresolved conflict with a random id.
    pub fn new(
        entity_type: impl Into<EntityType>,
        entity_id: impl Into<EntityId>,
        conflict_type: ConflictType,
        local: VersionSnapshot,
        remote: VersionSnapshot,
        detected_at: Timestamp,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation_id: None,
            local,
            remote,
            base: None,
            conflict_type,
            detected_at,
            resolution: None,
        }
    }

    pub fn with_operation(mut self, operation_id: impl Into<OperationId>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_base(mut self, base: VersionSnapshot) -> Self {
        self.base = Some(base);
        self
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}
