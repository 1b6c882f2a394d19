//! Runs registered checks and keeps their history.

use super::checks::{default_checks, CheckContext, ConsistencyCheck};
use super::{Alert, CheckStatus, CheckType, CheckerState, ConsistencyCheckResult, Repair};
use crate::config::ConsistencyConfig;
use crate::remote::RemoteSummary;
use crate::{EntityId, EntityType, Record, Schema, Timestamp};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Data gathered by the engine for one entity type.
#[derive(Debug, Clone, Default)]
pub struct CheckInputs {
    pub entity_type: EntityType,
    /// Local records of the entity type, tombstones included
    pub local: Vec<Record>,
    pub summary: RemoteSummary,
    /// Remote records; `None` for a quick check
    pub remote: Option<Vec<Record>>,
    /// Local records of every entity type
    pub related: HashMap<EntityType, Vec<Record>>,
    /// Entities with queued operations
    pub pending: HashSet<EntityId>,
}

/// Results of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckReport {
    pub entity_type: EntityType,
    pub results: Vec<ConsistencyCheckResult>,
    pub alerts: Vec<Alert>,
}

impl CheckReport {
    /// Worst status across all results.
    pub fn status(&self) -> CheckStatus {
        self.results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(CheckStatus::Consistent)
    }

    /// Result of one check type, if it ran.
    pub fn result(&self, check_type: CheckType) -> Option<&ConsistencyCheckResult> {
        self.results.iter().find(|r| r.check_type == check_type)
    }

    /// Repairs from auto-fixable results, one per entity.
    pub fn repairs(&self) -> Vec<Repair> {
        let mut seen = HashSet::new();
        self.results
            .iter()
            .filter(|r| r.auto_fixable)
            .flat_map(|r| r.repairs.iter())
            .filter(|r| seen.insert(r.entity_id.clone()))
            .cloned()
            .collect()
    }
}

/// Consistency checker for every entity type.
#[derive(Debug)]
pub struct ConsistencyChecker {
    config: ConsistencyConfig,
    checks: BTreeMap<CheckType, Box<dyn ConsistencyCheck>>,
    states: HashMap<EntityType, CheckerState>,
    outcomes: HashMap<EntityType, CheckerState>,
    history: VecDeque<ConsistencyCheckResult>,
    alerts: VecDeque<Alert>,
    rng: StdRng,
}

impl ConsistencyChecker {
    /// Checker with the built-in checks registered.
    pub fn new(config: ConsistencyConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let checks = default_checks()
            .into_iter()
            .map(|check| (check.check_type(), check))
            .collect();

        Self {
            config,
            checks,
            states: HashMap::new(),
            outcomes: HashMap::new(),
            history: VecDeque::new(),
            alerts: VecDeque::new(),
            rng,
        }
    }

    /// Register a check, replacing the one of the same type.
    pub fn with_check(mut self, check: Box<dyn ConsistencyCheck>) -> Self {
        self.checks.insert(check.check_type(), check);
        self
    }

    pub fn config(&self) -> &ConsistencyConfig {
        &self.config
    }

    /// Mark an entity type as being checked.
    pub fn begin(&mut self, entity_type: &str) {
        self.states
            .insert(entity_type.to_string(), CheckerState::Checking);
    }

    /// Current state; `Idle` outside a run.
    pub fn state(&self, entity_type: &str) -> CheckerState {
        self.states.get(entity_type).copied().unwrap_or_default()
    }

    /// State the last finished run ended in.
    pub fn last_outcome(&self, entity_type: &str) -> Option<CheckerState> {
        self.outcomes.get(entity_type).copied()
    }

    /// Run the given checks against one entity type.
    pub fn run(
        &mut self,
        check_types: &[CheckType],
        inputs: CheckInputs,
        schema: &Schema,
        now: Timestamp,
    ) -> CheckReport {
        self.begin(&inputs.entity_type);
        let sample = self.sample(&inputs);

        let ctx = CheckContext {
            entity_type: &inputs.entity_type,
            schema,
            local: &inputs.local,
            summary: &inputs.summary,
            remote: inputs.remote.as_deref(),
            related: &inputs.related,
            pending: &inputs.pending,
            sample: &sample,
            config: &self.config,
        };

        let mut results = Vec::new();
        for check_type in check_types {
            let Some(check) = self.checks.get(check_type) else {
                warn!(check = %check_type, "no check registered");
                continue;
            };
            let outcome = check.run(&ctx);
            debug!(
                entity_type = %inputs.entity_type,
                check = %check_type,
                status = ?outcome.status,
                "check finished"
            );
            results.push(ConsistencyCheckResult {
                id: uuid::Uuid::new_v4().to_string(),
                entity_type: inputs.entity_type.clone(),
                check_type: *check_type,
                status: outcome.status,
                severity: outcome.severity,
                details: outcome.details,
                auto_fixable: outcome.auto_fixable,
                fix_strategy: outcome.fix_strategy,
                repairs: outcome.repairs,
                checked_at: now,
            });
        }

        let mut alerts = Vec::new();
        for result in results.iter().filter(|r| r.needs_alert()) {
            let alert = Alert {
                id: uuid::Uuid::new_v4().to_string(),
                entity_type: result.entity_type.clone(),
                check_type: result.check_type,
                severity: result.severity,
                message: format!(
                    "{} check for {} is {:?}",
                    result.check_type, result.entity_type, result.status
                ),
                result_id: Some(result.id.clone()),
                created_at: now,
            };
            warn!(
                entity_type = %alert.entity_type,
                check = %alert.check_type,
                severity = ?alert.severity,
                "consistency alert"
            );
            alerts.push(alert);
        }

        let report = CheckReport {
            entity_type: inputs.entity_type,
            results,
            alerts,
        };
        let outcome = CheckerState::from(report.status());
        info!(entity_type = %report.entity_type, outcome = ?outcome, "consistency check complete");
        self.outcomes.insert(report.entity_type.clone(), outcome);
        self.states
            .insert(report.entity_type.clone(), CheckerState::Idle);

        for result in &report.results {
            self.push_history(result.clone());
        }
        for alert in &report.alerts {
            self.push_alert(alert.clone());
        }
        report
    }

    /// End a run whose inputs could not be gathered.
    pub fn abort(&mut self, entity_type: &str) {
        self.states
            .insert(entity_type.to_string(), CheckerState::Idle);
        self.outcomes
            .insert(entity_type.to_string(), CheckerState::Error);
    }

    /// Raise an alert that did not come from a check result.
    pub fn raise(&mut self, alert: Alert) {
        warn!(entity_type = %alert.entity_type, message = %alert.message, "alert raised");
        self.push_alert(alert);
    }

    /// Random sample of ids present on both sides and not pending.
    fn sample(&mut self, inputs: &CheckInputs) -> Vec<EntityId> {
        if inputs.remote.is_none() {
            return Vec::new();
        }
        let mut candidates: Vec<&EntityId> = inputs
            .local
            .iter()
            .filter(|r| r.is_active())
            .map(|r| &r.id)
            .filter(|id| inputs.summary.versions.contains_key(*id) && !inputs.pending.contains(*id))
            .collect();
        candidates.sort();

        let mut sample: Vec<EntityId> = candidates
            .choose_multiple(&mut self.rng, self.config.checksum_sample_size)
            .map(|id| (*id).clone())
            .collect();
        sample.sort();
        sample
    }

    fn push_history(&mut self, result: ConsistencyCheckResult) {
        self.history.push_back(result);
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }

    fn push_alert(&mut self, alert: Alert) {
        self.alerts.push_back(alert);
        while self.alerts.len() > self.config.alert_limit {
            self.alerts.pop_front();
        }
    }

    /// Past results, oldest first.
    pub fn history(&self) -> Vec<ConsistencyCheckResult> {
        self.history.iter().cloned().collect()
    }

    /// Alerts, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.iter().cloned().collect()
    }

    /// Reload history and alerts, trimming to the configured limits.
    pub fn restore(&mut self, history: Vec<ConsistencyCheckResult>, alerts: Vec<Alert>) {
        self.history.clear();
        self.alerts.clear();
        for result in history {
            self.push_history(result);
        }
        for alert in alerts {
            self.push_alert(alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::{CheckOutcome, Severity};
    use crate::{EntitySchema, FieldDef, FieldType};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(1).with_entity(EntitySchema::new(
            "card",
            vec![FieldDef::required("title", FieldType::String)],
        ))
    }

    fn card(id: &str, version: u64) -> Record {
        Record::new("card", id, json!({"title": id}), version, 1_000)
    }

    fn seeded(config: ConsistencyConfig) -> ConsistencyChecker {
        ConsistencyChecker::new(ConsistencyConfig {
            seed: Some(7),
            ..config
        })
    }

    fn inputs(local: Vec<Record>, remote: Vec<Record>, full: bool) -> CheckInputs {
        CheckInputs {
            entity_type: "card".into(),
            summary: RemoteSummary::from_records("card", &remote),
            remote: full.then_some(remote),
            local,
            ..Default::default()
        }
    }

    #[test]
    fn quick_check_reports_count_difference() {
        let mut checker = seeded(ConsistencyConfig::default());
        let report = checker.run(
            &CheckType::QUICK,
            inputs(vec![card("c1", 1), card("c2", 1)], vec![card("c1", 1)], false),
            &schema(),
            10,
        );

        let count = report.result(CheckType::Count).unwrap();
        assert_eq!(count.status, CheckStatus::Inconsistent);
        assert_eq!(count.details["difference"], 1);
        assert_eq!(report.status(), CheckStatus::Inconsistent);
        assert!(!report.alerts.is_empty());
        assert_eq!(checker.alerts().len(), report.alerts.len());
        assert_eq!(checker.state("card"), CheckerState::Idle);
        assert_eq!(checker.last_outcome("card"), Some(CheckerState::Inconsistent));
    }

    #[test]
    fn fixable_results_yield_repairs_without_alerts() {
        let mut checker = seeded(ConsistencyConfig::default());
        let report = checker.run(
            &CheckType::QUICK,
            inputs(vec![card("c1", 1)], vec![card("c1", 2)], false),
            &schema(),
            10,
        );

        assert!(report.alerts.is_empty());
        assert_eq!(report.repairs(), vec![Repair::pull("c1")]);
    }

    #[test]
    fn full_check_samples_bounded() {
        let mut checker = seeded(ConsistencyConfig {
            checksum_sample_size: 3,
            ..Default::default()
        });
        let records: Vec<_> = (0..10).map(|i| card(&format!("c{i}"), 1)).collect();
        let report = checker.run(
            &CheckType::FULL,
            inputs(records.clone(), records, true),
            &schema(),
            10,
        );

        assert_eq!(report.results.len(), 8);
        assert_eq!(report.status(), CheckStatus::Consistent);
        let checksum = report.result(CheckType::Checksum).unwrap();
        assert_eq!(checksum.details["sampled"], 3);
    }

    #[test]
    fn history_and_alerts_are_bounded() {
        let mut checker = seeded(ConsistencyConfig {
            history_limit: 4,
            alert_limit: 2,
            ..Default::default()
        });
        for now in 0..3 {
            checker.run(
                &CheckType::QUICK,
                inputs(vec![card("c1", 1), card("c2", 1)], vec![card("c1", 1)], false),
                &schema(),
                now,
            );
        }
        assert_eq!(checker.history().len(), 4);
        assert_eq!(checker.alerts().len(), 2);
        assert_eq!(checker.history().last().unwrap().checked_at, 2);
    }

    #[derive(Debug)]
    struct AlwaysWarn;

    impl ConsistencyCheck for AlwaysWarn {
        fn check_type(&self) -> CheckType {
            CheckType::Count
        }

        fn run(&self, _ctx: &CheckContext<'_>) -> CheckOutcome {
            CheckOutcome {
                status: CheckStatus::Warning,
                severity: Severity::Low,
                ..CheckOutcome::consistent(json!({}))
            }
        }
    }

    #[test]
    fn registered_check_replaces_builtin() {
        let mut checker = seeded(ConsistencyConfig::default()).with_check(Box::new(AlwaysWarn));
        let report = checker.run(&[CheckType::Count], inputs(vec![], vec![], false), &schema(), 0);
        assert_eq!(report.status(), CheckStatus::Warning);
        assert_eq!(checker.last_outcome("card"), Some(CheckerState::Warning));
    }

    #[test]
    fn restore_trims_to_limits() {
        let mut checker = seeded(ConsistencyConfig {
            alert_limit: 1,
            ..Default::default()
        });
        let alert = |id: &str| Alert {
            id: id.into(),
            entity_type: "card".into(),
            check_type: CheckType::Count,
            severity: Severity::High,
            message: String::new(),
            result_id: None,
            created_at: 0,
        };
        checker.restore(Vec::new(), vec![alert("a1"), alert("a2")]);
        assert_eq!(checker.alerts().len(), 1);
        assert_eq!(checker.alerts()[0].id, "a2");
    }
}
