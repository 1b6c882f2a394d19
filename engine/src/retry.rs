//! Retry and backoff.
//!
//! A failed transmission either gets a new `next_retry_time` (and sits in the
//! [`RetrySet`] until it is due) or becomes terminal. Delays grow with the
//! operation's [`BackoffStrategy`] and are spread with symmetric jitter.

use crate::{Error, Operation, OperationId, OperationStatus, Timestamp};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// How the base delay grows with the retry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffAlgorithm {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

/// Backoff parameters carried by each operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffStrategy {
    pub algorithm: BackoffAlgorithm,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random, in [0, 1]
    pub jitter_factor: f64,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self {
            algorithm: BackoffAlgorithm::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffStrategy {
    /// Exponential backoff with the given bounds.
    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_algorithm(mut self, algorithm: BackoffAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Delay before jitter for the given retry count (0-indexed).
    pub fn base_delay(&self, retry_count: u32) -> u64 {
        let initial = self.initial_delay_ms as f64;
        let max = self.max_delay_ms as f64;
        let delay = match self.algorithm {
            BackoffAlgorithm::Exponential => {
                initial * self.multiplier.max(1.0).powi(retry_count.min(i32::MAX as u32) as i32)
            }
            BackoffAlgorithm::Linear => initial * (retry_count as f64 + 1.0),
            BackoffAlgorithm::Fixed => initial,
        };
        delay.min(max) as u64
    }

    /// Delay with jitter applied. `unit` is a sample from uniform(-1, 1).
    pub fn jittered_delay(&self, retry_count: u32, unit: f64) -> u64 {
        let delay = self.base_delay(retry_count) as f64;
        let jitter = delay * self.jitter_factor * unit.clamp(-1.0, 1.0);
        (delay + jitter).max(0.0) as u64
    }

    /// Upper bound of any jittered delay.
    pub fn delay_ceiling(&self) -> u64 {
        let max = self.max_delay_ms as f64;
        (max + max * self.jitter_factor) as u64
    }
}

/// Outcome of [`RetryController::schedule_retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again once `next_retry_time` has passed.
    Retry {
        next_retry_time: Timestamp,
        delay_ms: u64,
    },
    /// Give up; the operation is failed with this error.
    Terminal { error: Error },
}

/// Decides whether and when a failed operation is retried.
#[derive(Debug)]
pub struct RetryController {
    rng: StdRng,
}

impl Default for RetryController {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryController {
    /// Controller seeded from system entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic controller for tests and replay.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Schedule the next attempt for `op` after it failed with `error`.
    ///
    /// Updates the operation's retry count, status, `next_retry_time` and
    /// `last_error` in place.
    pub fn schedule_retry(
        &mut self,
        op: &mut Operation,
        error: &Error,
        now: Timestamp,
    ) -> RetryDecision {
        op.last_error = Some(error.to_string());

        if !error.is_retryable() {
            op.status = OperationStatus::Failed;
            op.next_retry_time = None;
            return RetryDecision::Terminal {
                error: error.clone(),
            };
        }

        if op.retry_count >= op.max_retries {
            op.status = OperationStatus::Failed;
            op.next_retry_time = None;
            return RetryDecision::Terminal {
                error: Error::RetriesExhausted {
                    attempts: op.retry_count + 1,
                    last_error: error.to_string(),
                },
            };
        }

        let unit: f64 = self.rng.gen_range(-1.0..=1.0);
        let mut delay_ms = op.backoff.jittered_delay(op.retry_count, unit);
        if let Some(hint) = error.retry_after_ms() {
            delay_ms = delay_ms.max(hint);
        }

        op.retry_count += 1;
        op.status = OperationStatus::Pending;
        let next_retry_time = now.saturating_add(delay_ms);
        op.next_retry_time = Some(next_retry_time);

        debug!(
            op_id = %op.id,
            retry = op.retry_count,
            delay_ms,
            "scheduled retry"
        );

        RetryDecision::Retry {
            next_retry_time,
            delay_ms,
        }
    }
}

/// Operations waiting for their retry time, ordered by due time.
#[derive(Debug, Clone, Default)]
pub struct RetrySet {
    by_time: BTreeSet<(Timestamp, OperationId)>,
    by_id: HashMap<OperationId, Timestamp>,
}

impl RetrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or reschedule an operation.
    pub fn insert(&mut self, id: OperationId, at: Timestamp) {
        self.remove(&id);
        self.by_time.insert((at, id.clone()));
        self.by_id.insert(id, at);
    }

    /// Remove an operation; returns its due time if present.
    pub fn remove(&mut self, id: &str) -> Option<Timestamp> {
        let at = self.by_id.remove(id)?;
        self.by_time.remove(&(at, id.to_string()));
        Some(at)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Pop every entry due at or before `now`, earliest first.
    pub fn take_due(&mut self, now: Timestamp) -> Vec<OperationId> {
        let mut due = Vec::new();
        while let Some((at, _)) = self.by_time.first() {
            if *at > now {
                break;
            }
            if let Some((_, id)) = self.by_time.pop_first() {
                self.by_id.remove(&id);
                due.push(id);
            }
        }
        due
    }

    /// Earliest due time.
    pub fn next_due(&self) -> Option<Timestamp> {
        self.by_time.first().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Entries as `(id, due)` pairs, earliest first.
    pub fn entries(&self) -> Vec<(OperationId, Timestamp)> {
        self.by_time
            .iter()
            .map(|(at, id)| (id.clone(), *at))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op_with(backoff: BackoffStrategy, max_retries: u32) -> Operation {
        Operation::update("card", "c1", json!({"title": "A"}))
            .with_id("op-1")
            .with_backoff(backoff)
            .with_max_retries(max_retries)
    }

    #[test]
    fn exponential_base_delay() {
        let backoff = BackoffStrategy::exponential(100, 10_000).with_multiplier(2.0);
        assert_eq!(backoff.base_delay(0), 100);
        assert_eq!(backoff.base_delay(1), 200);
        assert_eq!(backoff.base_delay(2), 400);
        assert_eq!(backoff.base_delay(20), 10_000);
    }

    #[test]
    fn linear_and_fixed_delays() {
        let linear = BackoffStrategy::exponential(100, 1_000).with_algorithm(BackoffAlgorithm::Linear);
        assert_eq!(linear.base_delay(0), 100);
        assert_eq!(linear.base_delay(3), 400);
        assert_eq!(linear.base_delay(50), 1_000);

        let fixed = BackoffStrategy::exponential(250, 1_000).with_algorithm(BackoffAlgorithm::Fixed);
        assert_eq!(fixed.base_delay(0), 250);
        assert_eq!(fixed.base_delay(9), 250);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = BackoffStrategy::exponential(1_000, 8_000).with_jitter(0.25);
        assert_eq!(backoff.jittered_delay(3, 1.0), 10_000);
        assert_eq!(backoff.jittered_delay(3, -1.0), 6_000);
        assert_eq!(backoff.jittered_delay(0, 0.0), 1_000);
        assert_eq!(backoff.delay_ceiling(), 10_000);
    }

    #[test]
    fn transient_error_schedules_retry() {
        let mut controller = RetryController::with_seed(7);
        let mut op = op_with(BackoffStrategy::exponential(100, 1_000).with_jitter(0.0), 3);

        let decision = controller.schedule_retry(&mut op, &Error::Timeout, 10_000);

        assert_eq!(
            decision,
            RetryDecision::Retry {
                next_retry_time: 10_100,
                delay_ms: 100
            }
        );
        assert_eq!(op.retry_count, 1);
        assert_eq!(op.next_retry_time, Some(10_100));
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.last_error.as_deref(), Some("network timeout"));
    }

    #[test]
    fn rate_limit_hint_is_respected() {
        let mut controller = RetryController::with_seed(7);
        let mut op = op_with(BackoffStrategy::exponential(100, 1_000).with_jitter(0.0), 3);

        let decision = controller.schedule_retry(
            &mut op,
            &Error::RateLimited {
                retry_after_ms: Some(5_000),
            },
            0,
        );
        assert!(matches!(decision, RetryDecision::Retry { delay_ms: 5_000, .. }));
    }

    #[test]
    fn non_retryable_error_is_terminal() {
        let mut controller = RetryController::with_seed(7);
        let mut op = op_with(BackoffStrategy::default(), 3);
        let err = Error::PermissionDenied("read-only".into());

        let decision = controller.schedule_retry(&mut op, &err, 0);

        assert_eq!(decision, RetryDecision::Terminal { error: err });
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, 0);
    }

    #[test]
    fn exhaustion_is_terminal() {
        let mut controller = RetryController::with_seed(7);
        let mut op = op_with(BackoffStrategy::exponential(10, 100), 2);

        assert!(matches!(
            controller.schedule_retry(&mut op, &Error::Timeout, 0),
            RetryDecision::Retry { .. }
        ));
        assert!(matches!(
            controller.schedule_retry(&mut op, &Error::Timeout, 0),
            RetryDecision::Retry { .. }
        ));
        let decision = controller.schedule_retry(&mut op, &Error::Timeout, 0);
        assert!(matches!(
            decision,
            RetryDecision::Terminal {
                error: Error::RetriesExhausted { attempts: 3, .. }
            }
        ));
        assert_eq!(op.status, OperationStatus::Failed);
    }

    #[test]
    fn retry_set_orders_by_due_time() {
        let mut set = RetrySet::new();
        set.insert("b".into(), 200);
        set.insert("a".into(), 100);
        set.insert("c".into(), 300);
        assert_eq!(set.next_due(), Some(100));

        assert_eq!(set.take_due(250), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(set.len(), 1);
        assert!(set.contains("c"));
        assert!(set.take_due(250).is_empty());
    }

    #[test]
    fn retry_set_reschedule_replaces_entry() {
        let mut set = RetrySet::new();
        set.insert("a".into(), 100);
        set.insert("a".into(), 500);
        assert_eq!(set.len(), 1);
        assert!(set.take_due(200).is_empty());
        assert_eq!(set.remove("a"), Some(500));
        assert!(set.is_empty());
    }
}
