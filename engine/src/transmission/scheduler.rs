//! Priority-aware transmission scheduling.
//!
//! Operations handed over by the queue are admitted per priority class
//! against a share of the estimated bandwidth, aged so that low classes are
//! not starved, deduplicated, and grouped into batches sized by the current
//! network quality. Each batch takes one slot of the connection pool.

use super::network::{BandwidthEstimator, NetworkQuality, NetworkState};
use crate::config::TransmissionConfig;
use crate::{codec, EntityType, Operation, OperationId, Priority, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, trace};

/// Identifier of a transmission request.
pub type RequestId = String;

/// Admission parameters for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    pub priority: Priority,
    /// Bytes per second the request expects to use
    pub required_bandwidth: u64,
}

impl SubmitOptions {
    /// Operation priority, payload size as the bandwidth requirement.
    pub fn for_operation(op: &Operation) -> Self {
        Self {
            priority: op.priority,
            required_bandwidth: codec::canonical_bytes(&op.data).len() as u64,
        }
    }
}

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "admission")]
pub enum Admission {
    Queued,
    /// Over the class budget; re-admitted when budget frees up
    Deferred,
    /// Identical to a queued or in-flight request; completes with it
    #[serde(rename_all = "camelCase")]
    Duplicate { original: OperationId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub admission: Admission,
}

/// A queued transmission.
#[derive(Debug, Clone)]
pub struct TransmissionRequest {
    pub id: RequestId,
    pub operation: Operation,
    pub priority: Priority,
    pub required_bandwidth: u64,
    pub submitted_at: Timestamp,
    seq: u64,
}

/// Requests for one entity type sent together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub entity_type: EntityType,
    pub requests: Vec<TransmissionRequest>,
}

/// Output of one dispatch cycle.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub batches: Vec<Batch>,
    pub quality: NetworkQuality,
    pub batch_limit: usize,
    pub force_compression: bool,
}

impl Dispatch {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn request_count(&self) -> usize {
        self.batches.iter().map(|b| b.requests.len()).sum()
    }
}

/// Scheduler counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransmissionStats {
    pub queued: usize,
    pub deferred: usize,
    pub in_flight: usize,
    pub pool_size: usize,
    pub fairness_index: f64,
    pub network: NetworkState,
}

#[derive(Debug, Clone)]
struct InFlight {
    priority: Priority,
    required_bandwidth: u64,
    dedup_key: String,
    operation_id: OperationId,
    batch: u64,
}

#[derive(Debug)]
pub struct TransmissionScheduler {
    config: TransmissionConfig,
    queued: Vec<TransmissionRequest>,
    deferred: VecDeque<TransmissionRequest>,
    in_flight: HashMap<RequestId, InFlight>,
    /// Dedup key to the operation that owns it
    dedup: HashMap<String, OperationId>,
    duplicates: HashMap<OperationId, Vec<OperationId>>,
    /// Admitted bandwidth per class
    usage: BTreeMap<Priority, u64>,
    submitted: BTreeMap<Priority, u64>,
    served: BTreeMap<Priority, u64>,
    estimator: BandwidthEstimator,
    seq: u64,
    batches: u64,
}

impl TransmissionScheduler {
    pub fn new(config: TransmissionConfig) -> Self {
        let estimator =
            BandwidthEstimator::new(config.initial_bandwidth_bps, config.bandwidth_smoothing);
        Self {
            config,
            queued: Vec::new(),
            deferred: VecDeque::new(),
            in_flight: HashMap::new(),
            dedup: HashMap::new(),
            duplicates: HashMap::new(),
            usage: BTreeMap::new(),
            submitted: BTreeMap::new(),
            served: BTreeMap::new(),
            estimator,
            seq: 0,
            batches: 0,
        }
    }

    pub fn config(&self) -> &TransmissionConfig {
        &self.config
    }

    /// Hand an operation over for transmission.
    pub fn submit(
        &mut self,
        operation: Operation,
        options: SubmitOptions,
        now: Timestamp,
    ) -> SubmitReceipt {
        self.seq += 1;
        let request_id = format!("tx-{}", self.seq);

        let key = operation.dedup_key();
        if let Some(original) = self.dedup.get(&key).cloned() {
            debug!(op_id = %operation.id, original = %original, "duplicate transmission suppressed");
            self.duplicates
                .entry(original.clone())
                .or_default()
                .push(operation.id);
            return SubmitReceipt {
                request_id,
                admission: Admission::Duplicate { original },
            };
        }

        *self.submitted.entry(options.priority).or_default() += 1;
        self.dedup.insert(key, operation.id.clone());
        let request = TransmissionRequest {
            id: request_id.clone(),
            operation,
            priority: options.priority,
            required_bandwidth: options.required_bandwidth,
            submitted_at: now,
            seq: self.seq,
        };

        let admission = if self.fits(request.priority, request.required_bandwidth) {
            self.admit(request);
            Admission::Queued
        } else {
            trace!(request_id = %request.id, priority = %request.priority, "deferred over class budget");
            self.deferred.push_back(request);
            Admission::Deferred
        };
        SubmitReceipt {
            request_id,
            admission,
        }
    }

    /// Bandwidth budget of a priority class.
    pub fn class_budget(&self, priority: Priority) -> u64 {
        let share = self
            .config
            .class_shares
            .get(&priority)
            .copied()
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        (self.estimator.bandwidth_bps() as f64 * share) as u64
    }

    /// A class with nothing admitted takes any single request, so oversized
    /// requests are never stuck.
    fn fits(&self, priority: Priority, required: u64) -> bool {
        let used = self.usage.get(&priority).copied().unwrap_or(0);
        used == 0 || used.saturating_add(required) <= self.class_budget(priority)
    }

    fn admit(&mut self, request: TransmissionRequest) {
        *self.usage.entry(request.priority).or_default() += request.required_bandwidth;
        self.queued.push(request);
    }

    fn release_usage(&mut self, priority: Priority, bandwidth: u64) {
        if let Some(used) = self.usage.get_mut(&priority) {
            *used = used.saturating_sub(bandwidth);
        }
    }

    fn readmit_deferred(&mut self) {
        let mut still_deferred = VecDeque::new();
        while let Some(request) = self.deferred.pop_front() {
            if self.fits(request.priority, request.required_bandwidth) {
                self.admit(request);
            } else {
                still_deferred.push_back(request);
            }
        }
        self.deferred = still_deferred;
    }

    /// Priority after aging, capped at critical.
    pub fn effective_priority(&self, request: &TransmissionRequest, now: Timestamp) -> f64 {
        let interval = self.config.aging_interval_ms.max(1);
        let waited = now.saturating_sub(request.submitted_at) as f64 / interval as f64;
        (request.priority.rank() as f64 + waited).min(Priority::Critical.rank() as f64)
    }

    /// Pick the next batches to send.
    pub fn next_dispatch(&mut self, now: Timestamp) -> Dispatch {
        self.readmit_deferred();

        let quality = self.estimator.quality();
        let batch_limit = quality.batch_limit(self.config.max_batch_size);
        let force_compression = quality.forces_compression();
        let mut dispatch = Dispatch {
            batches: Vec::new(),
            quality,
            batch_limit,
            force_compression,
        };
        if batch_limit == 0 || self.queued.is_empty() {
            return dispatch;
        }

        let mut order: Vec<(f64, u64, usize)> = self
            .queued
            .iter()
            .enumerate()
            .map(|(i, r)| (self.effective_priority(r, now), r.seq, i))
            .collect();
        order.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut slots = self.config.pool_size.saturating_sub(self.in_flight_slots());
        let mut taken = vec![false; self.queued.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (pos, &(_, _, index)) in order.iter().enumerate() {
            if slots == 0 {
                break;
            }
            if taken[index] {
                continue;
            }
            taken[index] = true;
            let entity_type = &self.queued[index].operation.entity_type;
            let mut group = vec![index];
            for &(_, _, other) in &order[pos + 1..] {
                if group.len() >= batch_limit {
                    break;
                }
                if !taken[other] && self.queued[other].operation.entity_type == *entity_type {
                    taken[other] = true;
                    group.push(other);
                }
            }
            groups.push(group);
            slots -= 1;
        }

        let mut remaining: Vec<Option<TransmissionRequest>> =
            std::mem::take(&mut self.queued).into_iter().map(Some).collect();
        for group in groups {
            let requests: Vec<TransmissionRequest> = group
                .into_iter()
                .filter_map(|i| remaining[i].take())
                .collect();
            let Some(first) = requests.first() else {
                continue;
            };
            let entity_type = first.operation.entity_type.clone();
            self.batches += 1;
            for request in &requests {
                *self.served.entry(request.priority).or_default() += 1;
                self.in_flight.insert(
                    request.id.clone(),
                    InFlight {
                        priority: request.priority,
                        required_bandwidth: request.required_bandwidth,
                        dedup_key: request.operation.dedup_key(),
                        operation_id: request.operation.id.clone(),
                        batch: self.batches,
                    },
                );
            }
            dispatch.batches.push(Batch {
                entity_type,
                requests,
            });
        }
        self.queued = remaining.into_iter().flatten().collect();

        debug!(
            batches = dispatch.batches.len(),
            requests = dispatch.request_count(),
            quality = %quality,
            batch_limit,
            "dispatch cycle"
        );
        dispatch
    }

    /// Pool slots in use; the requests of a batch share one.
    fn in_flight_slots(&self) -> usize {
        self.in_flight
            .values()
            .map(|f| f.batch)
            .collect::<std::collections::HashSet<_>>()
            .len()
    }

    /// A request finished successfully. Returns the operations that were
    /// suppressed as its duplicates.
    pub fn complete(
        &mut self,
        request_id: &str,
        bytes: u64,
        duration_ms: u64,
    ) -> Vec<OperationId> {
        self.estimator.record_transfer(bytes, duration_ms);
        self.finish(request_id)
    }

    /// A request failed. Returns its suppressed duplicates, which share the
    /// outcome.
    pub fn release(&mut self, request_id: &str) -> Vec<OperationId> {
        self.finish(request_id)
    }

    fn finish(&mut self, request_id: &str) -> Vec<OperationId> {
        let Some(flight) = self.in_flight.remove(request_id) else {
            return Vec::new();
        };
        self.release_usage(flight.priority, flight.required_bandwidth);
        self.dedup.remove(&flight.dedup_key);
        self.duplicates
            .remove(&flight.operation_id)
            .unwrap_or_default()
    }

    /// Drop a request that has not been dispatched yet.
    pub fn cancel(&mut self, operation_id: &str) -> bool {
        let removed = if let Some(pos) = self
            .queued
            .iter()
            .position(|r| r.operation.id == operation_id)
        {
            let request = self.queued.remove(pos);
            self.release_usage(request.priority, request.required_bandwidth);
            Some(request)
        } else {
            self.deferred
                .iter()
                .position(|r| r.operation.id == operation_id)
                .and_then(|pos| self.deferred.remove(pos))
        };

        match removed {
            Some(request) => {
                self.dedup.remove(&request.operation.dedup_key());
                true
            }
            None => false,
        }
    }

    /// Whether an operation is queued, deferred or in flight here.
    pub fn holds(&self, operation_id: &str) -> bool {
        self.queued.iter().any(|r| r.operation.id == operation_id)
            || self.deferred.iter().any(|r| r.operation.id == operation_id)
            || self
                .in_flight
                .values()
                .any(|f| f.operation_id == operation_id)
    }

    /// Jain's fairness index over per-class service ratios; 1.0 is fair.
    pub fn fairness_index(&self) -> f64 {
        let ratios: Vec<f64> = self
            .submitted
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(p, &n)| self.served.get(p).copied().unwrap_or(0) as f64 / n as f64)
            .collect();
        let sum: f64 = ratios.iter().sum();
        let squares: f64 = ratios.iter().map(|x| x * x).sum();
        if ratios.is_empty() || squares == 0.0 {
            return 1.0;
        }
        sum * sum / (ratios.len() as f64 * squares)
    }

    pub fn update_network(&mut self, state: &NetworkState) {
        debug!(quality = %state.quality, online = state.online, "network state updated");
        self.estimator.apply(state);
    }

    pub fn network_state(&self) -> NetworkState {
        let budget = self.estimator.bandwidth_bps();
        let used: u64 = self.usage.values().sum();
        let utilization = if budget == 0 {
            0.0
        } else {
            used as f64 / budget as f64
        };
        self.estimator.state(utilization)
    }

    pub fn stats(&self) -> TransmissionStats {
        TransmissionStats {
            queued: self.queued.len(),
            deferred: self.deferred.len(),
            in_flight: self.in_flight.len(),
            pool_size: self.config.pool_size,
            fairness_index: self.fairness_index(),
            network: self.network_state(),
        }
    }
}
