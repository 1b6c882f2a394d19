//! The individual consistency checks.

use super::{CheckStatus, CheckType, FixStrategy, Repair, RepairDirection, Severity};
use crate::config::ConsistencyConfig;
use crate::remote::RemoteSummary;
use crate::{codec, EntityId, EntityType, Record, Schema};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Everything a check may look at.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    pub entity_type: &'a str,
    pub schema: &'a Schema,
    /// Local records of the entity type, tombstones included
    pub local: &'a [Record],
    pub summary: &'a RemoteSummary,
    /// Remote records; only loaded for full checks
    pub remote: Option<&'a [Record]>,
    /// Local records of every entity type, for reference lookups
    pub related: &'a HashMap<EntityType, Vec<Record>>,
    /// Entities with operations still queued
    pub pending: &'a HashSet<EntityId>,
    /// Records chosen for checksum comparison
    pub sample: &'a [EntityId],
    pub config: &'a ConsistencyConfig,
}

impl<'a> CheckContext<'a> {
    /// Active local records.
    pub fn active_local(&self) -> impl Iterator<Item = &'a Record> + 'a {
        self.local.iter().filter(|r| r.is_active())
    }

    fn local_record(&self, id: &str) -> Option<&'a Record> {
        self.local.iter().find(|r| r.id == id)
    }

    fn remote_records(&self) -> Option<HashMap<&'a str, &'a Record>> {
        self.remote
            .map(|records| records.iter().map(|r| (r.id.as_str(), r)).collect())
    }

    fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }
}

/// What one check found.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub status: CheckStatus,
    pub severity: Severity,
    pub details: Value,
    pub auto_fixable: bool,
    pub fix_strategy: Option<FixStrategy>,
    pub repairs: Vec<Repair>,
}

impl CheckOutcome {
    pub fn consistent(details: Value) -> Self {
        Self {
            status: CheckStatus::Consistent,
            severity: Severity::Low,
            details,
            auto_fixable: false,
            fix_strategy: None,
            repairs: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Error,
            severity: Severity::High,
            details: json!({ "error": message.into() }),
            auto_fixable: false,
            fix_strategy: None,
            repairs: Vec::new(),
        }
    }

    fn inconsistent(severity: Severity, details: Value) -> Self {
        Self {
            status: CheckStatus::Inconsistent,
            severity,
            details,
            auto_fixable: false,
            fix_strategy: None,
            repairs: Vec::new(),
        }
    }

    /// Attach repairs; the result becomes auto-fixable when `fixable` holds.
    fn with_repairs(mut self, repairs: Vec<Repair>, fixable: bool) -> Self {
        self.auto_fixable = fixable && !repairs.is_empty();
        self.fix_strategy = if self.auto_fixable {
            fix_strategy(&repairs)
        } else {
            None
        };
        self.repairs = repairs;
        self
    }
}

fn fix_strategy(repairs: &[Repair]) -> Option<FixStrategy> {
    let pulls = repairs
        .iter()
        .filter(|r| r.direction == RepairDirection::PullRemote)
        .count();
    match (pulls, repairs.len() - pulls) {
        (0, 0) => None,
        (_, 0) => Some(FixStrategy::PullRemote),
        (0, _) => Some(FixStrategy::PushLocal),
        _ => Some(FixStrategy::NewerWins),
    }
}

/// Direction that copies the newer side over the older one.
fn newer_side(local: &Record, remote: &Record) -> RepairDirection {
    if remote.version > local.version {
        RepairDirection::PullRemote
    } else if local.version > remote.version || local.updated_at > remote.updated_at {
        RepairDirection::PushLocal
    } else {
        RepairDirection::PullRemote
    }
}

fn repair(id: &str, direction: RepairDirection) -> Repair {
    Repair {
        entity_id: id.to_string(),
        direction,
    }
}

/// One kind of consistency check.
pub trait ConsistencyCheck: Send + Sync + std::fmt::Debug {
    fn check_type(&self) -> CheckType;

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome;
}

/// The eight built-in checks.
pub fn default_checks() -> Vec<Box<dyn ConsistencyCheck>> {
    vec![
        Box::new(VersionCheck),
        Box::new(CountCheck),
        Box::new(StructuralCheck),
        Box::new(ReferentialCheck),
        Box::new(DataCheck),
        Box::new(TimestampCheck),
        Box::new(ChecksumCheck),
        Box::new(BusinessRuleCheck),
    ]
}

/// Local record versions against the remote summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct VersionCheck;

impl ConsistencyCheck for VersionCheck {
    fn check_type(&self) -> CheckType {
        CheckType::Version
    }

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let mut mismatched = Vec::new();
        let mut missing_local = Vec::new();
        let mut missing_remote = Vec::new();
        let mut repairs = Vec::new();
        // Acknowledged records the remote no longer has: applying that
        // deletion locally is destructive and never automatic.
        let mut removed_remotely = 0usize;

        let mut local_active = HashSet::new();
        for record in ctx.active_local() {
            local_active.insert(record.id.as_str());
            if ctx.is_pending(&record.id) {
                continue;
            }
            match ctx.summary.versions.get(&record.id) {
                Some(&remote) if remote != record.version => {
                    mismatched.push(json!({
                        "id": record.id,
                        "localVersion": record.version,
                        "remoteVersion": remote,
                    }));
                    repairs.push(if remote > record.version {
                        Repair::pull(&record.id)
                    } else {
                        Repair::push(&record.id)
                    });
                }
                Some(_) => {}
                None if record.version == 0 => {
                    missing_remote.push(record.id.clone());
                    repairs.push(Repair::push(&record.id));
                }
                None => {
                    missing_remote.push(record.id.clone());
                    removed_remotely += 1;
                }
            }
        }

        for (id, version) in &ctx.summary.versions {
            if local_active.contains(id.as_str()) || ctx.is_pending(id) {
                continue;
            }
            missing_local.push(json!({ "id": id, "remoteVersion": version }));
            repairs.push(Repair::pull(id));
        }

        if mismatched.is_empty() && missing_local.is_empty() && missing_remote.is_empty() {
            return CheckOutcome::consistent(json!({ "checked": local_active.len() }));
        }

        let severity = if removed_remotely > 0 {
            Severity::High
        } else {
            Severity::Medium
        };
        CheckOutcome::inconsistent(
            severity,
            json!({
                "mismatched": mismatched,
                "missingLocal": missing_local,
                "missingRemote": missing_remote,
            }),
        )
        .with_repairs(repairs, removed_remotely == 0)
    }
}

/// Active record counts on both sides.
#[derive(Debug, Default, Clone, Copy)]
pub struct CountCheck;

impl ConsistencyCheck for CountCheck {
    fn check_type(&self) -> CheckType {
        CheckType::Count
    }

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let local_ids: BTreeSet<&str> = ctx.active_local().map(|r| r.id.as_str()).collect();
        let remote_ids: BTreeSet<&str> = ctx.summary.versions.keys().map(String::as_str).collect();
        let local_count = local_ids.len();
        let remote_count = ctx.summary.count;
        let difference = local_count.abs_diff(remote_count);

        let mut details = json!({
            "localCount": local_count,
            "remoteCount": remote_count,
            "difference": difference,
        });
        if difference == 0 {
            return CheckOutcome::consistent(details);
        }

        let unexplained: Vec<&str> = local_ids
            .symmetric_difference(&remote_ids)
            .copied()
            .filter(|id| !ctx.is_pending(id))
            .collect();
        details["pendingExplained"] = json!(unexplained.is_empty());

        // Queued operations already carry the fix; no alert for these.
        if unexplained.is_empty() {
            return CheckOutcome {
                auto_fixable: true,
                ..CheckOutcome::inconsistent(Severity::Low, details)
            };
        }

        details["unexplained"] = json!(unexplained);
        CheckOutcome::inconsistent(Severity::High, details)
    }
}

/// Local payloads against the schema.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralCheck;

impl ConsistencyCheck for StructuralCheck {
    fn check_type(&self) -> CheckType {
        CheckType::Structural
    }

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let Some(entity) = ctx.schema.get_entity(ctx.entity_type) else {
            return CheckOutcome {
                severity: Severity::Critical,
                ..CheckOutcome::error(format!("no schema for {}", ctx.entity_type))
            };
        };

        let mut violations = Vec::new();
        let mut repairs = Vec::new();
        let mut all_on_remote = true;
        for record in ctx.active_local() {
            if let Err(err) = entity.validate_payload(&record.data) {
                violations.push(json!({ "id": record.id, "error": err.to_string() }));
                if ctx.summary.versions.contains_key(&record.id) {
                    repairs.push(Repair::pull(&record.id));
                } else {
                    all_on_remote = false;
                }
            }
        }

        if violations.is_empty() {
            return CheckOutcome::consistent(json!({ "violations": [] }));
        }
        CheckOutcome::inconsistent(Severity::High, json!({ "violations": violations }))
            .with_repairs(repairs, all_on_remote)
    }
}

/// References to other records resolve locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferentialCheck;

impl ConsistencyCheck for ReferentialCheck {
    fn check_type(&self) -> CheckType {
        CheckType::Referential
    }

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let Some(entity) = ctx.schema.get_entity(ctx.entity_type) else {
            return CheckOutcome::error(format!("no schema for {}", ctx.entity_type));
        };

        let exists = |target: &str, id: &str| {
            let in_related = ctx
                .related
                .get(target)
                .is_some_and(|records| records.iter().any(|r| r.id == id && r.is_active()));
            let in_self = target == ctx.entity_type
                && ctx.local.iter().any(|r| r.id == id && r.is_active());
            in_related || in_self
        };

        let mut dangling = Vec::new();
        for record in ctx.active_local() {
            for (field, target) in entity.reference_fields() {
                let Some(Value::String(id)) = record.data.get(&field.name) else {
                    continue;
                };
                if !exists(target.as_str(), id.as_str()) {
                    dangling.push(json!({
                        "id": record.id,
                        "field": field.name,
                        "target": target,
                        "targetId": id,
                    }));
                }
            }
        }

        if dangling.is_empty() {
            CheckOutcome::consistent(json!({ "dangling": [] }))
        } else {
            CheckOutcome::inconsistent(Severity::High, json!({ "dangling": dangling }))
        }
    }
}

/// Field-level comparison of records present on both sides.
#[derive(Debug, Default, Clone, Copy)]
pub struct DataCheck;

impl ConsistencyCheck for DataCheck {
    fn check_type(&self) -> CheckType {
        CheckType::Data
    }

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let Some(remote) = ctx.remote_records() else {
            return CheckOutcome::error("remote records unavailable");
        };

        let mut differences = Vec::new();
        let mut repairs = Vec::new();
        for local in ctx.active_local() {
            if ctx.is_pending(&local.id) {
                continue;
            }
            let Some(theirs) = remote.get(local.id.as_str()).filter(|r| r.is_active()) else {
                continue;
            };
            if local.data == theirs.data {
                continue;
            }
            differences.push(json!({
                "id": local.id,
                "fields": diff_fields(&local.data, &theirs.data),
            }));
            repairs.push(repair(&local.id, newer_side(local, theirs)));
        }

        if differences.is_empty() {
            return CheckOutcome::consistent(json!({ "differences": [] }));
        }
        CheckOutcome::inconsistent(Severity::Medium, json!({ "differences": differences }))
            .with_repairs(repairs, true)
    }
}

/// Top-level fields whose values differ.
fn diff_fields(local: &Value, remote: &Value) -> Vec<String> {
    match (local.as_object(), remote.as_object()) {
        (Some(l), Some(r)) => {
            let keys: BTreeSet<&String> = l.keys().chain(r.keys()).collect();
            keys.into_iter()
                .filter(|k| l.get(*k) != r.get(*k))
                .cloned()
                .collect()
        }
        _ => vec!["$".to_string()],
    }
}

/// Update timestamps of identical versions.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampCheck;

impl ConsistencyCheck for TimestampCheck {
    fn check_type(&self) -> CheckType {
        CheckType::Timestamp
    }

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let Some(remote) = ctx.remote_records() else {
            return CheckOutcome::error("remote records unavailable");
        };

        let threshold = ctx.config.timestamp_drift_ms;
        let mut drifted = Vec::new();
        for local in ctx.active_local() {
            let Some(theirs) = remote.get(local.id.as_str()) else {
                continue;
            };
            if theirs.version != local.version {
                continue;
            }
            let drift = local.updated_at.abs_diff(theirs.updated_at);
            if drift > threshold {
                drifted.push(json!({ "id": local.id, "driftMs": drift }));
            }
        }

        let details = json!({ "drifted": drifted, "thresholdMs": threshold });
        if drifted.is_empty() {
            CheckOutcome::consistent(details)
        } else {
            CheckOutcome {
                status: CheckStatus::Warning,
                ..CheckOutcome::consistent(details)
            }
        }
    }
}

/// Payload checksums of a random sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChecksumCheck;

impl ConsistencyCheck for ChecksumCheck {
    fn check_type(&self) -> CheckType {
        CheckType::Checksum
    }

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let Some(remote) = ctx.remote_records() else {
            return CheckOutcome::error("remote records unavailable");
        };

        let mut mismatched = Vec::new();
        let mut repairs = Vec::new();
        let mut sampled = 0usize;
        for id in ctx.sample {
            let (Some(local), Some(theirs)) = (ctx.local_record(id), remote.get(id.as_str())) else {
                continue;
            };
            if !local.is_active() || !theirs.is_active() {
                continue;
            }
            sampled += 1;
            let (ours, remote_sum) = (codec::checksum(&local.data), codec::checksum(&theirs.data));
            if ours != remote_sum {
                mismatched.push(json!({
                    "id": id,
                    "localChecksum": ours,
                    "remoteChecksum": remote_sum,
                }));
                repairs.push(repair(id, newer_side(local, theirs)));
            }
        }

        if mismatched.is_empty() {
            return CheckOutcome::consistent(json!({ "sampled": sampled, "mismatched": [] }));
        }
        CheckOutcome::inconsistent(
            Severity::High,
            json!({ "sampled": sampled, "mismatched": mismatched }),
        )
        .with_repairs(repairs, true)
    }
}

/// Hierarchy cycles, duplicate unique values and null required fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusinessRuleCheck;

impl ConsistencyCheck for BusinessRuleCheck {
    fn check_type(&self) -> CheckType {
        CheckType::Business
    }

    fn run(&self, ctx: &CheckContext<'_>) -> CheckOutcome {
        let Some(entity) = ctx.schema.get_entity(ctx.entity_type) else {
            return CheckOutcome::error(format!("no schema for {}", ctx.entity_type));
        };
        let records: Vec<&Record> = ctx.active_local().collect();

        let cycles = match &entity.hierarchy_field {
            Some(field) => hierarchy_cycles(&records, field),
            None => Vec::new(),
        };

        let mut duplicates = Vec::new();
        for field in entity.fields.iter().filter(|f| f.unique) {
            let mut seen: BTreeMap<String, Vec<&str>> = BTreeMap::new();
            for record in &records {
                match record.data.get(&field.name) {
                    None | Some(Value::Null) => {}
                    Some(value) => seen
                        .entry(value.to_string())
                        .or_default()
                        .push(record.id.as_str()),
                }
            }
            for (value, ids) in seen.into_iter().filter(|(_, ids)| ids.len() > 1) {
                duplicates.push(json!({ "field": field.name, "value": value, "ids": ids }));
            }
        }

        let mut null_required = Vec::new();
        for record in &records {
            for field in entity.fields.iter().filter(|f| f.required) {
                if matches!(record.data.get(&field.name), None | Some(Value::Null)) {
                    null_required.push(json!({ "id": record.id, "field": field.name }));
                }
            }
        }

        let details = json!({
            "cycles": cycles,
            "duplicates": duplicates,
            "nullRequired": null_required,
        });
        let severity = if !cycles.is_empty() {
            Severity::Critical
        } else if !duplicates.is_empty() {
            Severity::High
        } else if !null_required.is_empty() {
            Severity::Medium
        } else {
            return CheckOutcome::consistent(details);
        };
        CheckOutcome::inconsistent(severity, details)
    }
}

/// Records whose parent chain loops back on itself, as sorted groups.
fn hierarchy_cycles(records: &[&Record], field: &str) -> Vec<Vec<EntityId>> {
    let parents: HashMap<&str, &str> = records
        .iter()
        .filter_map(|r| {
            r.data
                .get(field)
                .and_then(Value::as_str)
                .map(|parent| (r.id.as_str(), parent))
        })
        .collect();

    let mut cycles: BTreeSet<Vec<EntityId>> = BTreeSet::new();
    for start in parents.keys() {
        let mut path: Vec<&str> = vec![*start];
        let mut current = *start;
        while let Some(&parent) = parents.get(current) {
            if let Some(pos) = path.iter().position(|id| *id == parent) {
                let mut cycle: Vec<EntityId> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.sort();
                cycles.insert(cycle);
                break;
            }
            path.push(parent);
            current = parent;
        }
    }
    cycles.into_iter().collect()
}
