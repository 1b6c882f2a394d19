//! Operation queue.
//!
//! Holds every live operation (pending, waiting for a retry, suspended on a
//! conflict, or in flight) and decides which one may be sent next:
//!
//! - highest priority first, FIFO within a priority
//! - never before all of its dependencies have completed
//! - never while an earlier operation on the same entity is still live
//!
//! The queue is bounded. When it is full, the newest operation of the lowest
//! priority is evicted to make room for a more important one.
//!
//! Same-entity ordering counts as a dependency edge: an operation waits for
//! the live operation enqueued before it on the same entity. Cycle detection
//! at enqueue and at dispatch follows these edges too.

use crate::retry::RetrySet;
use crate::{
    error::Result, EntityId, EntityKey, EntityType, Error, Operation, OperationId,
    OperationStatus, Priority, Timestamp, Version,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Default maximum number of live operations.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Default number of completed/failed operations kept for inspection.
pub const DEFAULT_HISTORY_LIMIT: usize = 1_000;

/// Default number of completed and failed ids remembered for dependency
/// checks. Ids still named by a live operation are kept past this window.
pub const DEFAULT_ID_WINDOW: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    op: Operation,
    seq: u64,
}

/// Result of a successful enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub id: OperationId,
    /// Operation pushed out to make room
    pub evicted: Option<Operation>,
    /// Dependents of the evicted operation that failed with it
    pub cascaded: Vec<Operation>,
}

/// How a dispatched operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    /// The remote accepted the operation
    Completed {
        remote_version: Version,
        bytes: u64,
        duration_ms: u64,
        compression_ratio: Option<f64>,
    },
    /// Put back until the retry time
    Retry { at: Timestamp, duration_ms: u64 },
    /// Terminal failure
    Failed { error: Error },
    /// Parked until the named conflict is resolved
    Suspend { conflict_id: String },
}

/// Operation state after an acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct Acked {
    pub op: Operation,
    /// Dependents failed as a consequence of a terminal failure
    pub cascaded: Vec<Operation>,
}

/// Result of [`OperationQueue::cancel`].
#[derive(Debug, Clone, PartialEq)]
pub enum Cancellation {
    /// Removed before dispatch
    Removed { op: Operation, cascaded: Vec<Operation> },
    /// Already in flight; rolled back once the remote acknowledges it
    RollbackOnCompletion,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub waiting_retry: usize,
    pub suspended: usize,
    /// Pending operations with unmet dependencies
    pub blocked: usize,
    pub completed: usize,
    pub failed: usize,
    pub by_priority: BTreeMap<Priority, usize>,
    pub capacity: usize,
}

/// Last known version of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityVersion {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub version: Version,
}

/// Serializable queue contents for restart recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    /// Live operations in enqueue order
    pub operations: Vec<Operation>,
    /// Suspended operation id to conflict id
    #[serde(default)]
    pub suspended: BTreeMap<OperationId, String>,
    #[serde(default)]
    pub entity_versions: Vec<EntityVersion>,
    /// Recently completed ids, oldest first
    #[serde(default)]
    pub completed_ids: Vec<OperationId>,
    #[serde(default)]
    pub failed_ids: Vec<OperationId>,
    #[serde(default)]
    pub failed: Vec<Operation>,
    #[serde(default)]
    pub completed_total: usize,
    #[serde(default)]
    pub failed_total: usize,
}

/// Bounded, dependency-aware priority queue of operations.
#[derive(Debug, Clone)]
pub struct OperationQueue {
    capacity: usize,
    history_limit: usize,
    id_window: usize,
    next_seq: u64,
    entries: HashMap<OperationId, Entry>,
    /// Live operations per entity, in enqueue order
    entity_order: HashMap<EntityKey, VecDeque<OperationId>>,
    retries: RetrySet,
    /// Entity to the operation currently on the wire for it
    in_flight: HashMap<EntityKey, OperationId>,
    suspended: HashMap<OperationId, String>,
    entity_versions: HashMap<EntityKey, Version>,
    completed_ids: IdWindow,
    completed: VecDeque<Operation>,
    completed_total: usize,
    failed_ids: IdWindow,
    failed: VecDeque<Operation>,
    failed_total: usize,
}

/// Bounded set of finished operation ids, oldest first.
#[derive(Debug, Clone, Default)]
struct IdWindow {
    ids: HashSet<OperationId>,
    order: VecDeque<OperationId>,
}

impl IdWindow {
    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: OperationId) {
        if self.ids.insert(id.clone()) {
            self.order.push_back(id);
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    /// Forget the oldest ids once over `limit`, down to half of it. Ids in
    /// `keep` move to the back instead.
    fn trim(&mut self, limit: usize, keep: impl Fn(&str) -> bool) {
        if self.order.len() <= limit {
            return;
        }
        let target = limit / 2;
        let mut budget = self.order.len();
        while self.order.len() > target && budget > 0 {
            budget -= 1;
            let Some(id) = self.order.pop_front() else {
                break;
            };
            if keep(&id) {
                self.order.push_back(id);
            } else {
                self.ids.remove(&id);
            }
        }
    }

    fn to_vec(&self) -> Vec<OperationId> {
        self.order.iter().cloned().collect()
    }
}

impl FromIterator<OperationId> for IdWindow {
    fn from_iter<I: IntoIterator<Item = OperationId>>(iter: I) -> Self {
        let mut window = IdWindow::default();
        for id in iter {
            window.insert(id);
        }
        window
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl OperationQueue {
    /// Create an empty queue holding at most `capacity` live operations.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history_limit: DEFAULT_HISTORY_LIMIT,
            id_window: DEFAULT_ID_WINDOW,
            next_seq: 0,
            entries: HashMap::new(),
            entity_order: HashMap::new(),
            retries: RetrySet::new(),
            in_flight: HashMap::new(),
            suspended: HashMap::new(),
            entity_versions: HashMap::new(),
            completed_ids: IdWindow::default(),
            completed: VecDeque::new(),
            completed_total: 0,
            failed_ids: IdWindow::default(),
            failed: VecDeque::new(),
            failed_total: 0,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// How many finished ids are remembered for dependency checks.
    pub fn with_id_window(mut self, window: usize) -> Self {
        self.id_window = window.max(1);
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an operation.
    ///
    /// Stamps the enqueue time, checksum and per-entity version. The caller is
    /// expected to have validated the payload against the schema.
    pub fn enqueue(&mut self, mut op: Operation, now: Timestamp) -> Result<Enqueued> {
        if self.entries.contains_key(&op.id)
            || self.completed_ids.contains(&op.id)
            || self.failed_ids.contains(&op.id)
        {
            return Err(Error::DuplicateOperation(op.id));
        }

        if let Some(dep) = op.dependencies.iter().find(|d| self.failed_ids.contains(*d)) {
            return Err(Error::DependencyFailed(dep.clone()));
        }

        let mut waits_on: Vec<OperationId> = op.dependencies.iter().cloned().collect();
        if let Some(previous) = self
            .entity_order
            .get(&op.entity_key())
            .and_then(|ids| ids.back())
        {
            waits_on.push(previous.clone());
        }
        if let Some(path) = self.cycle_through(&op.id, waits_on) {
            return Err(Error::DependencyCycle(path));
        }

        let mut evicted = None;
        let mut cascaded = Vec::new();
        if self.entries.len() >= self.capacity {
            let victim = self
                .eviction_candidate()
                .filter(|(_, priority)| op.priority > *priority)
                .map(|(id, _)| id);

            let Some(victim) = victim else {
                return Err(Error::QueueFull {
                    capacity: self.capacity,
                });
            };

            warn!(op_id = %victim, incoming = %op.id, "queue full, evicting operation");
            if let Some(mut gone) = self.remove_live(&victim) {
                gone.status = OperationStatus::Failed;
                gone.last_error = Some(format!("evicted to make room for {}", op.id));
                self.record_failed(gone.clone());
                cascaded = self.cascade_failure(&victim);
                evicted = Some(gone);
            }
        }

        let key = op.entity_key();
        let cached = self.entity_versions.get(&key).copied().unwrap_or(0);
        let version = cached.max(op.base_version.unwrap_or(0)) + 1;
        op.assign_version(version);
        self.entity_versions.insert(key.clone(), op.version());
        self.entity_order
            .entry(key)
            .or_default()
            .push_back(op.id.clone());

        op.refresh_checksum();
        op.status = OperationStatus::Pending;
        op.enqueued_at = now;
        op.stats.created_at = now;

        let id = op.id.clone();
        debug!(op_id = %id, priority = %op.priority, version = op.version(), "enqueued operation");

        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(at) = op.next_retry_time {
            self.retries.insert(id.clone(), at);
        }
        self.entries.insert(id.clone(), Entry { op, seq });

        Ok(Enqueued {
            id,
            evicted,
            cascaded,
        })
    }

    /// Take the next operation that may be sent, marking it as processing.
    pub fn dequeue_ready(&mut self, now: Timestamp) -> Option<Operation> {
        self.retries.take_due(now);

        let id = self
            .entries
            .values()
            .filter(|e| self.is_ready(e))
            .max_by_key(|e| (e.op.priority, std::cmp::Reverse(e.seq)))
            .map(|e| e.op.id.clone())?;

        let entry = self.entries.get_mut(&id)?;
        entry.op.mark_processing(now);
        entry.op.next_retry_time = None;
        self.in_flight
            .insert(entry.op.entity_key(), entry.op.id.clone());
        Some(entry.op.clone())
    }

    fn is_ready(&self, entry: &Entry) -> bool {
        let op = &entry.op;
        op.status == OperationStatus::Pending
            && !self.retries.contains(&op.id)
            && !self.suspended.contains_key(&op.id)
            && !self.in_flight.contains_key(&op.entity_key())
            && self.dependencies_met(op)
            && self.is_entity_head(op)
    }

    /// Whether no earlier live operation targets the same entity.
    fn is_entity_head(&self, op: &Operation) -> bool {
        self.entity_order
            .get(&op.entity_key())
            .and_then(|ids| ids.front())
            == Some(&op.id)
    }

    /// Live operation enqueued just before `op` on the same entity.
    fn entity_predecessor(&self, op: &Operation) -> Option<&OperationId> {
        let ids = self.entity_order.get(&op.entity_key())?;
        let pos = ids.iter().position(|id| *id == op.id)?;
        ids.get(pos.checked_sub(1)?)
    }

    fn dependencies_met(&self, op: &Operation) -> bool {
        op.dependencies
            .iter()
            .all(|dep| self.completed_ids.contains(dep))
    }

    /// Record the outcome of a dispatched (or suspended) operation.
    pub fn ack(&mut self, id: &str, ack: Ack, now: Timestamp) -> Result<Acked> {
        if !self.entries.contains_key(id) {
            return Err(Error::OperationNotFound(id.to_string()));
        }

        match ack {
            Ack::Completed {
                remote_version,
                bytes,
                duration_ms,
                compression_ratio,
            } => {
                let mut op = self
                    .remove_live(id)
                    .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
                op.status = OperationStatus::Completed;
                op.last_error = None;
                op.stats
                    .record_success(now, duration_ms, bytes, compression_ratio);

                let version = self.entity_versions.entry(op.entity_key()).or_insert(0);
                *version = (*version).max(remote_version);

                self.completed_ids.insert(op.id.clone());
                self.completed_total += 1;
                self.trim_finished_ids();
                self.completed.push_back(op.clone());
                while self.completed.len() > self.history_limit {
                    self.completed.pop_front();
                }

                Ok(Acked {
                    op,
                    cascaded: Vec::new(),
                })
            }
            Ack::Retry { at, duration_ms } => {
                let entry = self
                    .entries
                    .get_mut(id)
                    .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
                self.in_flight.remove(&entry.op.entity_key());
                entry.op.status = OperationStatus::Pending;
                entry.op.next_retry_time = Some(at);
                entry.op.stats.record_failure(duration_ms);
                let op = entry.op.clone();
                self.retries.insert(op.id.clone(), at);
                Ok(Acked {
                    op,
                    cascaded: Vec::new(),
                })
            }
            Ack::Failed { error } => {
                let mut op = self
                    .remove_live(id)
                    .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
                op.status = OperationStatus::Failed;
                op.last_error = Some(error.to_string());
                op.stats.record_failure(0);
                warn!(op_id = %op.id, error = %error, "operation failed");

                self.record_failed(op.clone());
                let cascaded = self.cascade_failure(&op.id);
                Ok(Acked { op, cascaded })
            }
            Ack::Suspend { conflict_id } => {
                let entry = self
                    .entries
                    .get_mut(id)
                    .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
                self.in_flight.remove(&entry.op.entity_key());
                entry.op.status = OperationStatus::Pending;
                let op = entry.op.clone();
                info!(op_id = %op.id, conflict_id = %conflict_id, "operation suspended on conflict");
                self.suspended.insert(op.id.clone(), conflict_id);
                Ok(Acked {
                    op,
                    cascaded: Vec::new(),
                })
            }
        }
    }

    /// Release a suspended operation back into the ready set.
    pub fn resume(&mut self, id: &str) -> Result<()> {
        if !self.entries.contains_key(id) {
            return Err(Error::OperationNotFound(id.to_string()));
        }
        self.suspended.remove(id);
        Ok(())
    }

    /// Put a dequeued operation back as pending without counting an attempt.
    pub fn requeue(&mut self, id: &str) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        if entry.op.status == OperationStatus::Processing {
            self.in_flight.remove(&entry.op.entity_key());
            entry.op.status = OperationStatus::Pending;
        }
        Ok(())
    }

    /// Conflict an operation is suspended on.
    pub fn suspended_on(&self, id: &str) -> Option<&str> {
        self.suspended.get(id).map(String::as_str)
    }

    /// Cancel an operation.
    pub fn cancel(&mut self, id: &str) -> Result<Cancellation> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

        if entry.op.status == OperationStatus::Processing {
            entry.op.rollback_on_completion = true;
            return Ok(Cancellation::RollbackOnCompletion);
        }

        let mut op = self
            .remove_live(id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        op.status = OperationStatus::Failed;
        op.last_error = Some(Error::Cancelled(op.id.clone()).to_string());
        info!(op_id = %op.id, "operation cancelled");

        self.record_failed(op.clone());
        let cascaded = self.cascade_failure(&op.id);
        Ok(Cancellation::Removed { op, cascaded })
    }

    /// Raise an operation's priority. Never lowers it.
    pub fn elevate(&mut self, id: &str, priority: Priority) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) if entry.op.priority < priority => {
                debug!(op_id = %id, from = %entry.op.priority, to = %priority, "elevated priority");
                entry.op.priority = priority;
                true
            }
            _ => false,
        }
    }

    /// Require a remote version re-read before the operation is sent.
    pub fn require_validation(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.op.requires_validation = true;
                true
            }
            None => false,
        }
    }

    /// Make `id` wait for `dependency`. Rejects edges that would close a cycle.
    pub fn add_dependency(&mut self, id: &str, dependency: &str) -> Result<()> {
        if !self.entries.contains_key(id) {
            return Err(Error::OperationNotFound(id.to_string()));
        }
        if id == dependency {
            return Err(Error::DependencyCycle(vec![id.to_string(), id.to_string()]));
        }

        if let Some(path) = self.cycle_through(id, vec![dependency.to_string()]) {
            return Err(Error::DependencyCycle(path));
        }

        if let Some(entry) = self.entries.get_mut(id) {
            entry.op.dependencies.insert(dependency.to_string());
        }
        Ok(())
    }

    /// Path `id -> dep -> ... -> id` if letting `id` wait on `waits_on`
    /// closes a cycle. Walks explicit dependencies and same-entity order.
    fn cycle_through(&self, id: &str, waits_on: Vec<OperationId>) -> Option<Vec<OperationId>> {
        let mut stack: Vec<Vec<OperationId>> = waits_on
            .into_iter()
            .map(|d| vec![id.to_string(), d])
            .collect();
        let mut seen = HashSet::new();

        while let Some(path) = stack.pop() {
            let last = path.last()?.clone();
            if last == id {
                return Some(path);
            }
            if !seen.insert(last.clone()) {
                continue;
            }
            if let Some(entry) = self.entries.get(&last) {
                let previous = self.entity_predecessor(&entry.op);
                for next in entry.op.dependencies.iter().chain(previous) {
                    let mut extended = path.clone();
                    extended.push(next.clone());
                    stack.push(extended);
                }
            }
        }
        None
    }

    /// Fail every live operation caught in a dependency cycle.
    ///
    /// Runs a topological pass over the live dependency graph, same-entity
    /// order included. Operations left over once both roots and leaves are
    /// peeled off lie on (or between) cycles; they fail, and their dependents
    /// fail with them.
    pub fn fail_dependency_cycles(&mut self) -> Vec<Operation> {
        let live: HashSet<&OperationId> = self.entries.keys().collect();
        let mut deps: HashMap<&OperationId, HashSet<&OperationId>> = HashMap::new();
        let mut dependents: HashMap<&OperationId, HashSet<&OperationId>> = HashMap::new();
        for (id, entry) in &self.entries {
            let inner: HashSet<&OperationId> = entry
                .op
                .dependencies
                .iter()
                .chain(self.entity_predecessor(&entry.op))
                .filter(|d| live.contains(d))
                .collect();
            for d in &inner {
                dependents.entry(*d).or_default().insert(id);
            }
            deps.insert(id, inner);
        }

        let mut remaining: HashSet<&OperationId> = live.clone();
        // Peel roots, then leaves, until nothing changes.
        loop {
            let removable: Vec<&OperationId> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    let no_deps = deps
                        .get(id)
                        .map_or(true, |d| d.iter().all(|x| !remaining.contains(x)));
                    let no_dependents = dependents
                        .get(id)
                        .map_or(true, |d| d.iter().all(|x| !remaining.contains(x)));
                    no_deps || no_dependents
                })
                .collect();
            if removable.is_empty() {
                break;
            }
            for id in removable {
                remaining.remove(id);
            }
        }

        let mut on_cycle: Vec<OperationId> = remaining.into_iter().cloned().collect();
        on_cycle.sort();
        if on_cycle.is_empty() {
            return Vec::new();
        }

        warn!(ops = ?on_cycle, "dependency cycle detected at dispatch");
        let error = Error::DependencyCycle(on_cycle.clone());
        let mut failed = Vec::new();
        for id in &on_cycle {
            if let Some(mut op) = self.remove_live(id) {
                op.status = OperationStatus::Failed;
                op.last_error = Some(error.to_string());
                self.record_failed(op.clone());
                failed.push(op);
            }
        }
        for id in &on_cycle {
            failed.extend(self.cascade_failure(id));
        }
        failed
    }

    fn eviction_candidate(&self) -> Option<(OperationId, Priority)> {
        self.entries
            .values()
            .filter(|e| {
                e.op.status == OperationStatus::Pending && !self.suspended.contains_key(&e.op.id)
            })
            .min_by_key(|e| (e.op.priority, std::cmp::Reverse(e.seq)))
            .map(|e| (e.op.id.clone(), e.op.priority))
    }

    fn remove_live(&mut self, id: &str) -> Option<Operation> {
        let entry = self.entries.remove(id)?;
        self.retries.remove(id);
        self.suspended.remove(id);
        let key = entry.op.entity_key();
        if self.in_flight.get(&key) == Some(&entry.op.id) {
            self.in_flight.remove(&key);
        }
        if let Some(ids) = self.entity_order.get_mut(&key) {
            ids.retain(|other| *other != entry.op.id);
            if ids.is_empty() {
                self.entity_order.remove(&key);
            }
        }
        Some(entry.op)
    }

    fn record_failed(&mut self, op: Operation) {
        self.failed_ids.insert(op.id.clone());
        self.failed_total += 1;
        self.trim_finished_ids();
        self.failed.push_back(op);
        while self.failed.len() > self.history_limit {
            self.failed.pop_front();
        }
    }

    /// Keep the finished-id windows bounded.
    fn trim_finished_ids(&mut self) {
        if self.completed_ids.len() <= self.id_window && self.failed_ids.len() <= self.id_window {
            return;
        }
        let referenced: HashSet<&str> = self
            .entries
            .values()
            .flat_map(|e| e.op.dependencies.iter().map(String::as_str))
            .collect();
        let keep = |id: &str| referenced.contains(id);
        self.completed_ids.trim(self.id_window, keep);
        self.failed_ids.trim(self.id_window, keep);
    }

    /// Fail every live operation that transitively depends on `root`.
    fn cascade_failure(&mut self, root: &str) -> Vec<Operation> {
        let mut casualties = Vec::new();
        let mut work = vec![root.to_string()];

        while let Some(failed_id) = work.pop() {
            let dependents: Vec<OperationId> = self
                .entries
                .values()
                .filter(|e| {
                    e.op.dependencies.contains(&failed_id)
                        && e.op.status != OperationStatus::Processing
                })
                .map(|e| e.op.id.clone())
                .collect();

            for id in dependents {
                if let Some(mut op) = self.remove_live(&id) {
                    op.status = OperationStatus::Failed;
                    op.last_error = Some(Error::DependencyFailed(failed_id.clone()).to_string());
                    debug!(op_id = %op.id, dependency = %failed_id, "dependency failed");
                    self.record_failed(op.clone());
                    work.push(op.id.clone());
                    casualties.push(op);
                }
            }
        }
        casualties
    }

    /// Live operation by id.
    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.entries.get(id).map(|e| &e.op)
    }

    /// Mutable access to a live operation (e.g. for the retry controller).
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Operation> {
        self.entries.get_mut(id).map(|e| &mut e.op)
    }

    /// Live operations in enqueue order.
    pub fn operations(&self) -> Vec<&Operation> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| &e.op).collect()
    }

    /// Ids of entities of `entity_type` with live operations.
    pub fn pending_entities(&self, entity_type: &str) -> HashSet<EntityId> {
        self.entries
            .values()
            .filter(|e| e.op.entity_type == entity_type)
            .map(|e| e.op.entity_id.clone())
            .collect()
    }

    /// Whether an operation has completed.
    pub fn is_completed(&self, id: &str) -> bool {
        self.completed_ids.contains(id)
    }

    /// Whether an operation has failed terminally.
    pub fn is_failed(&self, id: &str) -> bool {
        self.failed_ids.contains(id)
    }

    /// Recently completed operations, oldest first.
    pub fn completed(&self) -> impl Iterator<Item = &Operation> {
        self.completed.iter()
    }

    /// Recently failed operations, oldest first.
    pub fn failed(&self) -> impl Iterator<Item = &Operation> {
        self.failed.iter()
    }

    /// Last version known for an entity.
    pub fn entity_version(&self, entity_type: &str, entity_id: &str) -> Option<Version> {
        self.entity_versions
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .copied()
    }

    /// Earliest pending retry time.
    pub fn next_retry_at(&self) -> Option<Timestamp> {
        self.retries.next_due()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            completed: self.completed_total,
            failed: self.failed_total,
            capacity: self.capacity,
            waiting_retry: self.retries.len(),
            suspended: self.suspended.len(),
            ..QueueStats::default()
        };

        for entry in self.entries.values() {
            let op = &entry.op;
            *stats.by_priority.entry(op.priority).or_insert(0) += 1;
            match op.status {
                OperationStatus::Processing => stats.processing += 1,
                _ => {
                    stats.pending += 1;
                    if !self.dependencies_met(op) {
                        stats.blocked += 1;
                    }
                }
            }
        }
        stats
    }

    /// Capture the queue for persistence.
    pub fn snapshot(&self) -> QueueState {
        let mut entity_versions: Vec<EntityVersion> = self
            .entity_versions
            .iter()
            .map(|((entity_type, entity_id), version)| EntityVersion {
                entity_type: entity_type.clone(),
                entity_id: entity_id.clone(),
                version: *version,
            })
            .collect();
        entity_versions.sort_by(|a, b| {
            (&a.entity_type, &a.entity_id).cmp(&(&b.entity_type, &b.entity_id))
        });

        QueueState {
            operations: self.operations().into_iter().cloned().collect(),
            suspended: self
                .suspended
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            entity_versions,
            completed_ids: self.completed_ids.to_vec(),
            failed_ids: self.failed_ids.to_vec(),
            failed: self.failed.iter().cloned().collect(),
            completed_total: self.completed_total,
            failed_total: self.failed_total,
        }
    }

    /// Replace the queue contents with a persisted state.
    ///
    /// Operations that were in flight go back to pending; their remote outcome
    /// is unknown, so they are sent again.
    pub fn restore(&mut self, state: QueueState) {
        self.entries.clear();
        self.entity_order.clear();
        self.retries = RetrySet::new();
        self.in_flight.clear();
        self.next_seq = 0;

        for mut op in state.operations {
            if op.status == OperationStatus::Processing {
                op.status = OperationStatus::Pending;
            }
            if let Some(at) = op.next_retry_time {
                self.retries.insert(op.id.clone(), at);
            }
            let seq = self.next_seq;
            self.next_seq += 1;
            self.entity_order
                .entry(op.entity_key())
                .or_default()
                .push_back(op.id.clone());
            self.entries.insert(op.id.clone(), Entry { op, seq });
        }

        self.suspended = state.suspended.into_iter().collect();
        self.entity_versions = state
            .entity_versions
            .into_iter()
            .map(|v| ((v.entity_type, v.entity_id), v.version))
            .collect();
        self.completed_total = state.completed_total.max(state.completed_ids.len());
        self.completed_ids = state.completed_ids.into_iter().collect();
        self.completed.clear();
        self.failed_ids = state
            .failed_ids
            .into_iter()
            .chain(state.failed.iter().map(|op| op.id.clone()))
            .collect();
        self.failed_total = state.failed_total.max(self.failed_ids.len());
        self.failed = state.failed.into_iter().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn op(id: &str, entity: &str, priority: Priority) -> Operation {
        Operation::update("card", entity, json!({"title": id}))
            .with_id(id)
            .with_priority(priority)
    }

    fn complete(queue: &mut OperationQueue, id: &str) {
        queue
            .ack(
                id,
                Ack::Completed {
                    remote_version: 1,
                    bytes: 10,
                    duration_ms: 5,
                    compression_ratio: None,
                },
                0,
            )
            .unwrap();
    }

    #[test]
    fn dequeues_by_priority_then_fifo() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Low), 0).unwrap();
        queue.enqueue(op("b", "c2", Priority::High), 1).unwrap();
        queue.enqueue(op("c", "c3", Priority::High), 2).unwrap();

        assert_eq!(queue.dequeue_ready(10).unwrap().id, "b");
        assert_eq!(queue.dequeue_ready(10).unwrap().id, "c");
        assert_eq!(queue.dequeue_ready(10).unwrap().id, "a");
        assert!(queue.dequeue_ready(10).is_none());
    }

    #[test]
    fn enqueue_stamps_version_and_checksum() {
        let mut queue = OperationQueue::new(10);
        queue
            .enqueue(op("a", "c1", Priority::Normal).with_base_version(4), 100)
            .unwrap();
        queue.enqueue(op("b", "c1", Priority::Normal), 200).unwrap();

        let a = queue.get("a").unwrap();
        assert_eq!(a.version(), 5);
        assert!(a.verify_checksum());
        assert_eq!(a.enqueued_at, 100);
        assert_eq!(queue.get("b").unwrap().version(), 6);
        assert_eq!(queue.entity_version("card", "c1"), Some(6));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        assert!(matches!(
            queue.enqueue(op("a", "c2", Priority::Normal), 0),
            Err(Error::DuplicateOperation(id)) if id == "a"
        ));
    }

    #[test]
    fn dependency_holds_back_dependent() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("1", "c1", Priority::Critical), 0).unwrap();
        queue
            .enqueue(op("2", "c2", Priority::Low).depends_on("1"), 0)
            .unwrap();

        assert_eq!(queue.dequeue_ready(0).unwrap().id, "1");
        assert!(queue.dequeue_ready(0).is_none());
        assert_eq!(queue.stats().blocked, 1);

        complete(&mut queue, "1");
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "2");
    }

    #[test]
    fn forward_reference_waits() {
        let mut queue = OperationQueue::new(10);
        queue
            .enqueue(op("2", "c2", Priority::High).depends_on("1"), 0)
            .unwrap();
        assert!(queue.dequeue_ready(0).is_none());

        queue.enqueue(op("1", "c1", Priority::Low), 0).unwrap();
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "1");
    }

    #[test]
    fn cycle_rejected_at_enqueue() {
        let mut queue = OperationQueue::new(10);
        queue
            .enqueue(op("a", "c1", Priority::Normal).depends_on("b"), 0)
            .unwrap();
        let result = queue.enqueue(op("b", "c2", Priority::Normal).depends_on("a"), 0);
        assert!(matches!(
            result,
            Err(Error::DependencyCycle(path)) if path == vec!["b", "a", "b"]
        ));
    }

    #[test]
    fn add_dependency_is_cycle_checked() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue
            .enqueue(op("b", "c2", Priority::Normal).depends_on("a"), 0)
            .unwrap();

        assert!(matches!(
            queue.add_dependency("a", "b"),
            Err(Error::DependencyCycle(_))
        ));
        assert!(matches!(
            queue.add_dependency("a", "a"),
            Err(Error::DependencyCycle(_))
        ));
        queue.enqueue(op("c", "c3", Priority::Normal), 0).unwrap();
        queue.add_dependency("a", "c").unwrap();
        assert!(queue.get("a").unwrap().dependencies.contains("c"));
    }

    #[test]
    fn dispatch_pass_fails_restored_cycle() {
        let mut queue = OperationQueue::new(10);
        let state = QueueState {
            operations: vec![
                op("a", "c1", Priority::Normal).depends_on("b"),
                op("b", "c2", Priority::Normal).depends_on("a"),
                op("c", "c3", Priority::Normal).depends_on("a"),
                op("d", "c4", Priority::Normal),
            ],
            ..QueueState::default()
        };
        queue.restore(state);

        let failed = queue.fail_dependency_cycles();
        let mut ids: Vec<_> = failed.iter().map(|o| o.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(failed
            .iter()
            .find(|o| o.id == "c")
            .unwrap()
            .last_error
            .as_deref()
            .unwrap()
            .contains("dependency"));
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "d");
    }

    #[test]
    fn same_entity_order_closes_cycle_at_enqueue() {
        let mut queue = OperationQueue::new(10);
        queue
            .enqueue(op("a", "c1", Priority::Normal).depends_on("b"), 0)
            .unwrap();
        let result = queue.enqueue(op("b", "c1", Priority::Normal), 0);
        assert!(matches!(
            result,
            Err(Error::DependencyCycle(path)) if path == vec!["b", "a", "b"]
        ));
        assert_eq!(queue.len(), 1);

        queue.enqueue(op("x", "c1", Priority::Normal), 0).unwrap();
        assert!(matches!(
            queue.add_dependency("a", "x"),
            Err(Error::DependencyCycle(_))
        ));
    }

    #[test]
    fn dispatch_pass_fails_same_entity_cycle() {
        let mut queue = OperationQueue::new(10);
        queue.restore(QueueState {
            operations: vec![
                op("a", "c1", Priority::Normal).depends_on("b"),
                op("b", "c1", Priority::Normal),
                op("c", "c2", Priority::Normal),
            ],
            ..QueueState::default()
        });
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "c");

        let failed = queue.fail_dependency_cycles();
        let mut ids: Vec<_> = failed.iter().map(|o| o.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(queue.is_failed("a"));
        assert!(queue.is_failed("b"));
    }

    #[test]
    fn removing_entity_head_releases_next() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue.enqueue(op("b", "c1", Priority::Normal), 0).unwrap();
        queue.enqueue(op("c", "c1", Priority::Normal), 0).unwrap();

        queue.cancel("b").unwrap();
        queue.cancel("a").unwrap();
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "c");
    }

    #[test]
    fn finished_ids_stay_bounded() {
        let mut queue = OperationQueue::new(100).with_id_window(4);
        queue.enqueue(op("keep", "k", Priority::Normal), 0).unwrap();
        queue.dequeue_ready(0).unwrap();
        complete(&mut queue, "keep");
        queue
            .enqueue(
                op("waiting", "w", Priority::Normal)
                    .depends_on("keep")
                    .depends_on("later"),
                0,
            )
            .unwrap();

        for i in 0..20 {
            let id = format!("op{i}");
            queue.enqueue(op(&id, &id, Priority::Normal), 0).unwrap();
            queue.dequeue_ready(0).unwrap();
            complete(&mut queue, &id);
        }

        assert!(queue.completed_ids.len() <= 4);
        assert!(queue.is_completed("keep"));
        assert!(!queue.is_completed("op0"));
        assert_eq!(queue.stats().completed, 21);

        let restored_state = queue.snapshot();
        assert!(restored_state.completed_ids.len() <= 4);
        assert_eq!(restored_state.completed_total, 21);
    }

    #[test]
    fn failure_cascades_to_dependents() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue
            .enqueue(op("b", "c2", Priority::Normal).depends_on("a"), 0)
            .unwrap();
        queue
            .enqueue(op("c", "c3", Priority::Normal).depends_on("b"), 0)
            .unwrap();

        queue.dequeue_ready(0).unwrap();
        let acked = queue
            .ack(
                "a",
                Ack::Failed {
                    error: Error::PermissionDenied("no".into()),
                },
                0,
            )
            .unwrap();

        assert_eq!(acked.op.status, OperationStatus::Failed);
        assert_eq!(acked.cascaded.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.is_failed("c"));
        assert!(matches!(
            queue.enqueue(op("d", "c4", Priority::Normal).depends_on("a"), 0),
            Err(Error::DependencyFailed(dep)) if dep == "a"
        ));
    }

    #[test]
    fn full_queue_evicts_lowest_newest() {
        let mut queue = OperationQueue::new(3);
        queue.enqueue(op("low-old", "c1", Priority::Low), 0).unwrap();
        queue.enqueue(op("low-new", "c2", Priority::Low), 1).unwrap();
        queue.enqueue(op("normal", "c3", Priority::Normal), 2).unwrap();

        let result = queue.enqueue(op("high", "c4", Priority::High), 3).unwrap();
        assert_eq!(result.evicted.unwrap().id, "low-new");
        assert!(queue.get("low-old").is_some());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn full_queue_rejects_equal_priority() {
        let mut queue = OperationQueue::new(2);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue.enqueue(op("b", "c2", Priority::Normal), 0).unwrap();
        assert!(matches!(
            queue.enqueue(op("c", "c3", Priority::Normal), 0),
            Err(Error::QueueFull { capacity: 2 })
        ));
    }

    #[test]
    fn processing_op_is_never_evicted() {
        let mut queue = OperationQueue::new(1);
        queue.enqueue(op("a", "c1", Priority::Background), 0).unwrap();
        queue.dequeue_ready(0).unwrap();
        assert!(matches!(
            queue.enqueue(op("b", "c2", Priority::Critical), 0),
            Err(Error::QueueFull { .. })
        ));
    }

    #[test]
    fn one_in_flight_per_entity() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue.enqueue(op("b", "c1", Priority::Critical), 0).unwrap();
        queue.enqueue(op("c", "c2", Priority::Low), 0).unwrap();

        assert_eq!(queue.dequeue_ready(0).unwrap().id, "a");
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "c");
        assert!(queue.dequeue_ready(0).is_none());

        complete(&mut queue, "a");
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "b");
    }

    #[test]
    fn retry_waits_until_due() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue.dequeue_ready(0).unwrap();
        queue
            .ack(
                "a",
                Ack::Retry {
                    at: 1_000,
                    duration_ms: 3,
                },
                0,
            )
            .unwrap();

        assert_eq!(queue.stats().waiting_retry, 1);
        assert!(queue.dequeue_ready(999).is_none());
        let again = queue.dequeue_ready(1_000).unwrap();
        assert_eq!(again.id, "a");
        assert_eq!(again.stats.failure_count, 1);
    }

    #[test]
    fn suspended_op_waits_for_resume() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue.dequeue_ready(0).unwrap();
        queue
            .ack(
                "a",
                Ack::Suspend {
                    conflict_id: "k1".into(),
                },
                0,
            )
            .unwrap();

        assert_eq!(queue.suspended_on("a"), Some("k1"));
        assert!(queue.dequeue_ready(0).is_none());
        queue.resume("a").unwrap();
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "a");
    }

    #[test]
    fn cancel_pending_and_in_flight() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue.enqueue(op("b", "c2", Priority::Low), 0).unwrap();
        queue
            .enqueue(op("c", "c3", Priority::Low).depends_on("b"), 0)
            .unwrap();

        queue.dequeue_ready(0).unwrap();
        assert_eq!(
            queue.cancel("a").unwrap(),
            Cancellation::RollbackOnCompletion
        );
        assert!(queue.get("a").unwrap().rollback_on_completion);

        match queue.cancel("b").unwrap() {
            Cancellation::Removed { op, cascaded } => {
                assert_eq!(op.id, "b");
                assert_eq!(cascaded[0].id, "c");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            queue.cancel("zzz"),
            Err(Error::OperationNotFound(_))
        ));
    }

    #[test]
    fn requeue_releases_entity() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        assert_eq!(queue.dequeue_ready(0).unwrap().id, "a");
        assert!(queue.dequeue_ready(0).is_none());

        queue.requeue("a").unwrap();
        assert_eq!(queue.get("a").unwrap().status, OperationStatus::Pending);
        assert!(matches!(
            queue.cancel("a").unwrap(),
            Cancellation::Removed { .. }
        ));
    }

    #[test]
    fn elevate_only_raises() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        assert!(!queue.elevate("a", Priority::Low));
        assert!(queue.elevate("a", Priority::Critical));
        assert_eq!(queue.get("a").unwrap().priority, Priority::Critical);
    }

    #[test]
    fn stats_by_priority() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::High), 0).unwrap();
        queue.enqueue(op("b", "c2", Priority::High), 0).unwrap();
        queue.enqueue(op("c", "c3", Priority::Low), 0).unwrap();
        queue.dequeue_ready(0).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.by_priority[&Priority::High], 2);
        assert_eq!(stats.by_priority[&Priority::Low], 1);
        assert_eq!(stats.capacity, 10);
    }

    #[test]
    fn snapshot_restore_reverts_processing() {
        let mut queue = OperationQueue::new(10);
        queue.enqueue(op("a", "c1", Priority::Normal), 0).unwrap();
        queue.enqueue(op("b", "c2", Priority::Normal), 0).unwrap();
        queue.dequeue_ready(0).unwrap();

        let state = queue.snapshot();
        let json = serde_json::to_string(&state).unwrap();
        let parsed: QueueState = serde_json::from_str(&json).unwrap();

        let mut restored = OperationQueue::new(10);
        restored.restore(parsed);
        assert_eq!(restored.stats().processing, 0);
        assert_eq!(restored.stats().pending, 2);
        assert_eq!(restored.entity_version("card", "c1"), Some(1));
        assert_eq!(restored.dequeue_ready(0).unwrap().id, "a");
    }
}
