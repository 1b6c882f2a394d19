//! Post-sync consistency checking.
//!
//! Compares the local store with the remote for one entity type and reports
//! each kind of disagreement as a [`ConsistencyCheckResult`]. A quick check
//! only needs the remote's [`RemoteSummary`](crate::remote::RemoteSummary);
//! a full check also reads remote records.
//!
//! The checker never writes to either store. Fixable results carry
//! [`Repair`]s, which the engine turns into corrective operations.

pub mod checker;
pub mod checks;

pub use checker::{CheckInputs, CheckReport, ConsistencyChecker};
pub use checks::{CheckContext, CheckOutcome, ConsistencyCheck};

use crate::{EntityId, EntityType, Timestamp};
use serde::{Deserialize, Serialize};

/// What a check compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    Structural,
    Referential,
    Data,
    Timestamp,
    Version,
    Count,
    Checksum,
    Business,
}

impl CheckType {
    /// Checks run by a quick check.
    pub const QUICK: [CheckType; 3] = [CheckType::Version, CheckType::Count, CheckType::Structural];

    /// Checks run by a full check.
    pub const FULL: [CheckType; 8] = [
        CheckType::Version,
        CheckType::Count,
        CheckType::Structural,
        CheckType::Referential,
        CheckType::Data,
        CheckType::Timestamp,
        CheckType::Checksum,
        CheckType::Business,
    ];

    /// Whether the check needs full remote records.
    pub fn needs_remote_records(self) -> bool {
        matches!(
            self,
            CheckType::Data | CheckType::Timestamp | CheckType::Checksum
        )
    }
}

impl std::fmt::Display for CheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CheckType::Structural => "structural",
            CheckType::Referential => "referential",
            CheckType::Data => "data",
            CheckType::Timestamp => "timestamp",
            CheckType::Version => "version",
            CheckType::Count => "count",
            CheckType::Checksum => "checksum",
            CheckType::Business => "business",
        };
        f.write_str(name)
    }
}

/// Outcome of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Consistent,
    Warning,
    Inconsistent,
    /// The check itself could not run
    Error,
}

/// How much a finding matters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Repair plan for a fixable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FixStrategy {
    /// Overwrite local copies with the remote ones
    PullRemote,
    /// Send local copies to the remote
    PushLocal,
    /// Per record, whichever side is newer
    NewerWins,
}

/// Which way a record is copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepairDirection {
    PullRemote,
    PushLocal,
}

/// Repair for one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repair {
    pub entity_id: EntityId,
    pub direction: RepairDirection,
}

impl Repair {
    pub fn pull(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            direction: RepairDirection::PullRemote,
        }
    }

    pub fn push(entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_id: entity_id.into(),
            direction: RepairDirection::PushLocal,
        }
    }
}

/// Immutable record of one check run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCheckResult {
    pub id: String,
    pub entity_type: EntityType,
    pub check_type: CheckType,
    pub status: CheckStatus,
    pub severity: Severity,
    /// Check-specific findings
    pub details: serde_json::Value,
    pub auto_fixable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix_strategy: Option<FixStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<Repair>,
    pub checked_at: Timestamp,
}

impl ConsistencyCheckResult {
    /// Whether this result should raise an alert.
    pub fn needs_alert(&self) -> bool {
        (self.status == CheckStatus::Inconsistent && !self.auto_fixable)
            || self.severity == Severity::Critical
            || self.status == CheckStatus::Error
    }
}

/// Raised for results that need attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub entity_type: EntityType,
    pub check_type: CheckType,
    pub severity: Severity,
    pub message: String,
    /// Result that raised the alert, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    pub created_at: Timestamp,
}

/// Checker state per entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckerState {
    #[default]
    Idle,
    Checking,
    Consistent,
    Warning,
    Inconsistent,
    Error,
}

impl From<CheckStatus> for CheckerState {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Consistent => CheckerState::Consistent,
            CheckStatus::Warning => CheckerState::Warning,
            CheckStatus::Inconsistent => CheckerState::Inconsistent,
            CheckStatus::Error => CheckerState::Error,
        }
    }
}
