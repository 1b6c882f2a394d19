//! Conflict prediction.
//!
//! Scores queued operations for conflict risk before they are sent. Signals
//! add up to a probability that is scaled by what the predictor has learned
//! about each `(entity_type, conflict_type)` pair:
//!
//! | signal                                         | weight |
//! |------------------------------------------------|--------|
//! | two operations on the same entity              | 0.4    |
//! | enqueued within the time window (5 s)          | 0.3    |
//! | based on a version older than the remote's     | 0.3    |
//! | delete racing an update (floor)                | 0.9    |
//!
//! Learning scales the summed score but never below a pair's floor: 0.5 for
//! same-entity edits inside the window, the `delete_update` weight for a
//! delete racing an update. Predictions at or above the risk threshold carry
//! a preventive action.

use super::{ConflictType, ResolutionStrategy};
use crate::{EntityId, EntityKey, EntityType, Operation, OperationId, OperationKind, Priority, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Learning never scales a probability beyond these bounds.
const LEARNING_FACTOR_MIN: f64 = 0.5;
const LEARNING_FACTOR_MAX: f64 = 1.5;

/// Lowest probability for two edits of one entity inside the time window.
const IN_WINDOW_FLOOR: f64 = 0.5;

/// Signal weights and thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictorWeights {
    pub same_entity: f64,
    pub time_window: f64,
    pub stale_base: f64,
    pub delete_update: f64,
    pub window_ms: u64,
    pub risk_threshold: f64,
}

impl Default for PredictorWeights {
    fn default() -> Self {
        Self {
            same_entity: 0.4,
            time_window: 0.3,
            stale_base: 0.3,
            delete_update: 0.9,
            window_ms: 5_000,
            risk_threshold: 0.7,
        }
    }
}

/// What to do about a risky operation before it is sent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum PreventiveAction {
    #[default]
    None,
    /// Raise the earlier operation so it is sent first
    #[serde(rename_all = "camelCase")]
    ElevatePriority {
        operation_id: OperationId,
        priority: Priority,
    },
    /// Re-read the remote version before sending
    #[serde(rename_all = "camelCase")]
    ForceValidation { operation_id: OperationId },
    /// Make `operation_id` wait for `after`
    #[serde(rename_all = "camelCase")]
    ReorderDependencies {
        operation_id: OperationId,
        after: OperationId,
    },
}

/// A predicted conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictPrediction {
    pub operation_ids: Vec<OperationId>,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub conflict_type: ConflictType,
    /// In [0, 1]
    pub probability: f64,
    pub suggested_resolution: ResolutionStrategy,
    pub action: PreventiveAction,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    predicted: u64,
    observed: u64,
}

/// Scores operations for conflict risk and learns from outcomes.
#[derive(Debug, Clone)]
pub struct ConflictPredictor {
    weights: PredictorWeights,
    learning: bool,
    tallies: HashMap<(EntityType, ConflictType), Tally>,
    counted: HashSet<(Vec<OperationId>, ConflictType)>,
    latest: Vec<ConflictPrediction>,
}

impl Default for ConflictPredictor {
    fn default() -> Self {
        Self::new(PredictorWeights::default())
    }
}

impl ConflictPredictor {
    pub fn new(weights: PredictorWeights) -> Self {
        Self {
            weights,
            learning: true,
            tallies: HashMap::new(),
            counted: HashSet::new(),
            latest: Vec::new(),
        }
    }

    /// Enable or disable learning from outcomes.
    pub fn with_learning(mut self, learning: bool) -> Self {
        self.learning = learning;
        self
    }

    pub fn weights(&self) -> &PredictorWeights {
        &self.weights
    }

    /// Predictions from the last [`predict`](Self::predict) call.
    pub fn latest(&self) -> &[ConflictPrediction] {
        &self.latest
    }

    /// Score `operations` (in enqueue order) against the last known remote
    /// versions. Returns predictions sorted by descending probability.
    ///
    /// `operations` is the full live set: risky pairs involving operations
    /// missing from it are no longer remembered as counted.
    pub fn predict(
        &mut self,
        operations: &[&Operation],
        remote_versions: &HashMap<EntityKey, Version>,
    ) -> Vec<ConflictPrediction> {
        let mut by_entity: BTreeMap<EntityKey, Vec<&Operation>> = BTreeMap::new();
        for op in operations {
            by_entity.entry(op.entity_key()).or_default().push(op);
        }
        let by_id: HashMap<&str, &Operation> =
            operations.iter().map(|op| (op.id.as_str(), *op)).collect();

        let mut predictions = Vec::new();
        for (key, ops) in &by_entity {
            let remote_version = remote_versions.get(key).copied();

            for (i, earlier) in ops.iter().enumerate() {
                for later in &ops[i + 1..] {
                    if let Some(p) = self.score_pair(earlier, later, remote_version, &by_id) {
                        predictions.push(p);
                    }
                }
            }

            if ops.len() == 1 {
                if let Some(p) = self.score_stale(ops[0], remote_version) {
                    predictions.push(p);
                }
            }
        }

        predictions.sort_by(|a, b| b.probability.total_cmp(&a.probability));

        self.counted
            .retain(|(ids, _)| ids.iter().all(|id| by_id.contains_key(id.as_str())));
        for p in &predictions {
            if p.probability >= self.weights.risk_threshold
                && self.counted.insert((p.operation_ids.clone(), p.conflict_type))
            {
                self.tally(&p.entity_type, p.conflict_type).predicted += 1;
            }
        }

        self.latest = predictions.clone();
        predictions
    }

    fn score_pair(
        &self,
        earlier: &Operation,
        later: &Operation,
        remote_version: Option<Version>,
        by_id: &HashMap<&str, &Operation>,
    ) -> Option<ConflictPrediction> {
        if earlier.kind == OperationKind::Pull || later.kind == OperationKind::Pull {
            return None;
        }

        let w = &self.weights;
        let mut score = w.same_entity;
        let mut floor = 0.0;
        let mut reasons = vec!["operations target the same entity".to_string()];

        if later.enqueued_at.abs_diff(earlier.enqueued_at) <= w.window_ms {
            score += w.time_window;
            floor = IN_WINDOW_FLOOR;
            reasons.push(format!("enqueued within {} ms", w.window_ms));
        }

        if is_stale(earlier, remote_version) || is_stale(later, remote_version) {
            score += w.stale_base;
            reasons.push("based on an outdated remote version".to_string());
        }

        let deletes = |op: &Operation| op.kind == OperationKind::Delete;
        let conflict_type = if deletes(earlier) != deletes(later) {
            score = score.max(w.delete_update);
            floor = w.delete_update;
            reasons.push("delete races an update".to_string());
            ConflictType::DeleteUpdate
        } else if (!earlier.dependencies.is_empty() || !later.dependencies.is_empty())
            && !depends_on(later, &earlier.id, by_id)
        {
            reasons.push("not ordered by dependencies".to_string());
            ConflictType::DependencyConflict
        } else {
            ConflictType::ConcurrentModification
        };

        let probability = self
            .scaled(&earlier.entity_type, conflict_type, score)
            .max(floor.min(1.0));
        let action = if probability >= w.risk_threshold {
            match conflict_type {
                ConflictType::DeleteUpdate | ConflictType::DependencyConflict
                    if !depends_on(later, &earlier.id, by_id) =>
                {
                    PreventiveAction::ReorderDependencies {
                        operation_id: later.id.clone(),
                        after: earlier.id.clone(),
                    }
                }
                _ if earlier.priority < later.priority => PreventiveAction::ElevatePriority {
                    operation_id: earlier.id.clone(),
                    priority: later.priority,
                },
                _ => PreventiveAction::ForceValidation {
                    operation_id: later.id.clone(),
                },
            }
        } else {
            PreventiveAction::None
        };

        Some(ConflictPrediction {
            operation_ids: vec![earlier.id.clone(), later.id.clone()],
            entity_type: earlier.entity_type.clone(),
            entity_id: earlier.entity_id.clone(),
            conflict_type,
            probability,
            suggested_resolution: suggested(conflict_type),
            action,
            reasons,
        })
    }

    fn score_stale(
        &self,
        op: &Operation,
        remote_version: Option<Version>,
    ) -> Option<ConflictPrediction> {
        if !op.mutates_remote() || !is_stale(op, remote_version) {
            return None;
        }

        let w = &self.weights;
        let conflict_type = if op.kind == OperationKind::Delete {
            ConflictType::DeleteUpdate
        } else {
            ConflictType::ConcurrentModification
        };
        let score = w.same_entity + w.stale_base;
        let probability = self.scaled(&op.entity_type, conflict_type, score);
        let action = if probability >= w.risk_threshold {
            PreventiveAction::ForceValidation {
                operation_id: op.id.clone(),
            }
        } else {
            PreventiveAction::None
        };

        Some(ConflictPrediction {
            operation_ids: vec![op.id.clone()],
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            conflict_type,
            probability,
            suggested_resolution: suggested(conflict_type),
            action,
            reasons: vec!["remote changed since the edit's base version".to_string()],
        })
    }

    fn scaled(&self, entity_type: &str, conflict_type: ConflictType, score: f64) -> f64 {
        (score * self.learning_factor(entity_type, conflict_type)).clamp(0.0, 1.0)
    }

    /// Multiplier learned for an entity type and conflict type.
    pub fn learning_factor(&self, entity_type: &str, conflict_type: ConflictType) -> f64 {
        if !self.learning {
            return 1.0;
        }
        match self.tallies.get(&(entity_type.to_string(), conflict_type)) {
            Some(t) if t.predicted > 0 || t.observed > 0 => ((t.observed as f64 + 1.0)
                / (t.predicted as f64 + 1.0))
                .clamp(LEARNING_FACTOR_MIN, LEARNING_FACTOR_MAX),
            _ => 1.0,
        }
    }

    /// Feed back an observed conflict.
    pub fn record_outcome(&mut self, entity_type: &str, conflict_type: ConflictType) {
        if !self.learning {
            return;
        }
        let tally = self.tally(entity_type, conflict_type);
        tally.observed += 1;
        debug!(
            entity_type,
            conflict_type = %conflict_type,
            observed = tally.observed,
            predicted = tally.predicted,
            "recorded conflict outcome"
        );
    }

    fn tally(&mut self, entity_type: &str, conflict_type: ConflictType) -> &mut Tally {
        self.tallies
            .entry((entity_type.to_string(), conflict_type))
            .or_default()
    }
}

fn is_stale(op: &Operation, remote_version: Option<Version>) -> bool {
    matches!((op.base_version, remote_version), (Some(base), Some(remote)) if base < remote)
}

/// Whether `op` transitively depends on `target`.
fn depends_on(op: &Operation, target: &str, by_id: &HashMap<&str, &Operation>) -> bool {
    let mut stack: Vec<&str> = op.dependencies.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if !seen.insert(id) {
            continue;
        }
        if let Some(dep) = by_id.get(id) {
            stack.extend(dep.dependencies.iter().map(String::as_str));
        }
    }
    false
}

fn suggested(conflict_type: ConflictType) -> ResolutionStrategy {
    match conflict_type {
        ConflictType::ConcurrentModification => ResolutionStrategy::Merge,
        ConflictType::DeleteUpdate => ResolutionStrategy::Manual,
        ConflictType::DataInconsistency => ResolutionStrategy::AcceptRemote,
        ConflictType::DependencyConflict => ResolutionStrategy::AcceptLocal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(id: &str, entity: &str, at: u64) -> Operation {
        let mut op = Operation::update("card", entity, json!({"title": id})).with_id(id);
        op.enqueued_at = at;
        op
    }

    fn predict(predictor: &mut ConflictPredictor, ops: &[Operation]) -> Vec<ConflictPrediction> {
        let refs: Vec<&Operation> = ops.iter().collect();
        predictor.predict(&refs, &HashMap::new())
    }

    #[test]
    fn same_entity_within_window_is_concurrent_modification() {
        let mut predictor = ConflictPredictor::default();
        let ops = [update("a", "c1", 1_000), update("b", "c1", 3_000)];

        let predictions = predict(&mut predictor, &ops);

        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!(p.conflict_type, ConflictType::ConcurrentModification);
        assert!((p.probability - 0.7).abs() < 1e-9);
        assert!(p.probability >= 0.5);
        assert_eq!(p.operation_ids, vec!["a", "b"]);
        assert_eq!(
            p.action,
            PreventiveAction::ForceValidation {
                operation_id: "b".into()
            }
        );
    }

    #[test]
    fn outside_window_scores_lower() {
        let mut predictor = ConflictPredictor::new(PredictorWeights::default());
        let ops = [update("a", "c1", 0), update("b", "c1", 60_000)];

        let predictions = predict(&mut predictor, &ops);
        assert!((predictions[0].probability - 0.4).abs() < 1e-9);
        assert_eq!(predictions[0].action, PreventiveAction::None);
    }

    #[test]
    fn different_entities_do_not_conflict() {
        let mut predictor = ConflictPredictor::default();
        let ops = [update("a", "c1", 0), update("b", "c2", 0)];
        assert!(predict(&mut predictor, &ops).is_empty());
    }

    #[test]
    fn delete_update_race_ignores_timing() {
        let mut predictor = ConflictPredictor::default();
        let mut delete = Operation::delete("card", "c1").with_id("d");
        delete.enqueued_at = 600_000;
        let ops = [update("u", "c1", 0), delete];

        let predictions = predict(&mut predictor, &ops);
        let p = &predictions[0];
        assert_eq!(p.conflict_type, ConflictType::DeleteUpdate);
        assert!(p.probability >= 0.9);
        assert_eq!(
            p.action,
            PreventiveAction::ReorderDependencies {
                operation_id: "d".into(),
                after: "u".into()
            }
        );
    }

    #[test]
    fn stale_base_is_flagged() {
        let mut predictor = ConflictPredictor::default();
        let op = update("a", "c1", 0).with_base_version(2);
        let remote: HashMap<EntityKey, Version> =
            [(("card".to_string(), "c1".to_string()), 5)].into_iter().collect();

        let predictions = predictor.predict(&[&op], &remote);
        assert_eq!(predictions.len(), 1);
        assert!((predictions[0].probability - 0.7).abs() < 1e-9);
        assert_eq!(
            predictions[0].action,
            PreventiveAction::ForceValidation {
                operation_id: "a".into()
            }
        );
    }

    #[test]
    fn lower_priority_earlier_op_is_elevated() {
        let mut predictor = ConflictPredictor::default();
        let ops = [
            update("a", "c1", 0).with_priority(Priority::Low),
            update("b", "c1", 10).with_priority(Priority::High),
        ];
        let predictions = predict(&mut predictor, &ops);
        assert_eq!(
            predictions[0].action,
            PreventiveAction::ElevatePriority {
                operation_id: "a".into(),
                priority: Priority::High
            }
        );
    }

    #[test]
    fn unordered_dependencies_are_dependency_conflict() {
        let mut predictor = ConflictPredictor::default();
        let ops = [
            update("a", "c1", 0),
            update("b", "c1", 10).depends_on("other"),
        ];
        let predictions = predict(&mut predictor, &ops);
        assert_eq!(predictions[0].conflict_type, ConflictType::DependencyConflict);

        let ordered = [update("a", "c1", 0), update("b", "c1", 10).depends_on("a")];
        let predictions = predict(&mut predictor, &ordered);
        assert_eq!(
            predictions[0].conflict_type,
            ConflictType::ConcurrentModification
        );
    }

    #[test]
    fn learning_scales_within_bounds() {
        let mut predictor = ConflictPredictor::default();
        let kind = ConflictType::ConcurrentModification;
        assert_eq!(predictor.learning_factor("card", kind), 1.0);

        for _ in 0..10 {
            predictor.record_outcome("card", kind);
        }
        assert_eq!(predictor.learning_factor("card", kind), 1.5);

        let mut quiet = ConflictPredictor::default();
        for i in 0..10u64 {
            let ops = [
                update(&format!("a{i}"), "c1", 0),
                update(&format!("b{i}"), "c1", 0),
            ];
            predict(&mut quiet, &ops);
        }
        assert_eq!(quiet.learning_factor("card", kind), 0.5);
    }

    #[test]
    fn repeated_predictions_count_once() {
        let mut predictor = ConflictPredictor::default();
        let ops = [update("a", "c1", 0), update("b", "c1", 0)];
        predict(&mut predictor, &ops);
        predict(&mut predictor, &ops);
        // one prediction, no observations: 1 / 2
        assert_eq!(
            predictor.learning_factor("card", ConflictType::ConcurrentModification),
            0.5
        );
        assert_eq!(predictor.latest().len(), 1);
    }

    #[test]
    fn in_window_pairs_stay_likely_after_quiet_history() {
        let mut predictor = ConflictPredictor::default();
        for i in 0..20u64 {
            let at = i * 100_000;
            let ops = [
                update(&format!("a{i}"), "c1", at),
                update(&format!("b{i}"), "c1", at + 2_000),
            ];
            let predictions = predict(&mut predictor, &ops);
            assert_eq!(
                predictions[0].conflict_type,
                ConflictType::ConcurrentModification
            );
            assert!(predictions[0].probability >= 0.5, "round {i}");
        }
        assert_eq!(
            predictor.learning_factor("card", ConflictType::ConcurrentModification),
            0.5
        );
    }

    #[test]
    fn delete_update_race_stays_high_risk_after_quiet_history() {
        let mut predictor = ConflictPredictor::default();
        for i in 0..10u64 {
            let mut delete = Operation::delete("card", "c1").with_id(format!("d{i}"));
            delete.enqueued_at = 600_000;
            let ops = [update(&format!("u{i}"), "c1", 0), delete];

            let predictions = predict(&mut predictor, &ops);
            let p = &predictions[0];
            assert_eq!(p.conflict_type, ConflictType::DeleteUpdate);
            assert!(p.probability >= 0.9, "round {i}");
            assert!(matches!(
                p.action,
                PreventiveAction::ReorderDependencies { .. }
            ));
        }
    }

    #[test]
    fn counted_pairs_are_forgotten_once_operations_leave() {
        let mut predictor = ConflictPredictor::default();
        let ops = [update("a", "c1", 0), update("b", "c1", 0)];
        predict(&mut predictor, &ops);
        assert_eq!(predictor.counted.len(), 1);

        predict(&mut predictor, &[update("c", "c2", 0)]);
        assert!(predictor.counted.is_empty());
    }

    #[test]
    fn learning_can_be_disabled() {
        let mut predictor = ConflictPredictor::default().with_learning(false);
        predictor.record_outcome("card", ConflictType::DeleteUpdate);
        assert_eq!(
            predictor.learning_factor("card", ConflictType::DeleteUpdate),
            1.0
        );
    }
}
