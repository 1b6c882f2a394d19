//! The sync engine.
//!
//! [`SyncEngine`] wires the operation queue, conflict predictor and resolver,
//! consistency checker and transmission scheduler to a [`LocalStore`] and a
//! [`RemoteBackend`]. All component state sits behind one async mutex, which
//! serializes every queue mutation; remote calls run outside it.
//!
//! Local writes are optimistic: [`SyncEngine::add_operation`] updates the
//! local store immediately and remembers the prior content so a terminal
//! failure or a cancellation can put it back.

use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::EngineConfig;
use crate::conflict::{
    ConflictPrediction, ConflictPredictor, ConflictRecord, ConflictResolution, ConflictResolver,
    ConflictType, PreventiveAction, ResolutionStrategy, VersionSnapshot,
};
use crate::consistency::{
    Alert, CheckInputs, CheckReport, CheckType, ConsistencyCheckResult, ConsistencyChecker,
    RepairDirection, Severity,
};
use crate::events::{EngineStatus, EventBus, EventReceiver, SyncEvent};
use crate::queue::{Ack, Cancellation, OperationQueue, QueueStats};
use crate::remote::{RemoteBackend, RemoteRequest, RemoteResponse, RemoteSummary};
use crate::retry::{BackoffStrategy, RetryController, RetryDecision};
use crate::snapshot::EngineSnapshot;
use crate::store::{LocalStore, STATE_COLLECTION};
use crate::transmission::{
    Admission, Batch, NetworkQuality, NetworkState, RequestId, SubmitOptions,
    TransmissionScheduler, TransmissionStats,
};
use crate::{
    error::{ErrorKind, Result},
    EntityKey, EntityType, Error, Operation, OperationId, OperationKind, OperationStatus, Origin,
    PriorState, Priority, Record, Schema, Timestamp, Version, DEFAULT_MAX_RETRIES,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Upper bound on dispatch rounds within one sync.
const MAX_DISPATCH_ROUNDS: usize = 64;

/// Record id of the persisted engine snapshot in [`STATE_COLLECTION`].
pub const STATE_RECORD_ID: &str = "engine";

/// What one call to [`SyncEngine::trigger_sync`] did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// Requests handed to the remote
    pub dispatched: usize,
    pub batches: usize,
    pub completed: usize,
    pub retried: usize,
    /// Terminal failures, cascaded dependents included
    pub failed: usize,
    pub conflicts: usize,
    /// Conflicts settled automatically
    pub resolved: usize,
    pub predictions: usize,
    pub preventive_actions: usize,
    pub bytes_sent: u64,
    /// Nothing ran because sync is paused
    pub skipped: bool,
    /// Local error that cut the sync short
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
struct EngineState {
    queue: OperationQueue,
    retry: RetryController,
    predictor: ConflictPredictor,
    resolver: ConflictResolver,
    checker: ConsistencyChecker,
    scheduler: TransmissionScheduler,
    /// Last remote version seen per entity
    remote_versions: HashMap<EntityKey, Version>,
    status: EngineStatus,
}

impl EngineState {
    fn new(config: &EngineConfig) -> Self {
        let resolver_config = &config.resolver;
        let mut resolver = ConflictResolver::new(resolver_config.default_strategy)
            .with_default_scalar_policy(resolver_config.default_scalar_policy);
        for (entity_type, strategy) in &resolver_config.strategies {
            resolver = resolver.with_strategy(entity_type.clone(), *strategy);
        }
        for (entity_type, scalar) in &resolver_config.scalar_policies {
            resolver = resolver.with_scalar_policy(entity_type.clone(), *scalar);
        }

        Self {
            queue: OperationQueue::new(config.queue.capacity)
                .with_history_limit(config.queue.history_limit),
            retry: config
                .retry
                .seed
                .map_or_else(RetryController::new, RetryController::with_seed),
            predictor: ConflictPredictor::new(config.predictor.weights.clone())
                .with_learning(config.predictor.learning),
            resolver,
            checker: ConsistencyChecker::new(config.consistency.clone()),
            scheduler: TransmissionScheduler::new(config.transmission.clone()),
            remote_versions: HashMap::new(),
            status: EngineStatus::Idle,
        }
    }

    /// Whether any live operation still targets the entity.
    fn has_live(&self, entity_type: &str, entity_id: &str) -> bool {
        self.queue
            .operations()
            .iter()
            .any(|op| op.targets(entity_type, entity_id))
    }
}

/// A request after its trip to the remote.
struct Transmitted {
    request_id: RequestId,
    op: Operation,
    result: Result<RemoteResponse>,
    /// Remote copy fetched after a conflict
    remote_copy: Option<Record>,
    bytes: u64,
    duration_ms: u64,
    compression_ratio: Option<f64>,
    compressed_data: Option<Vec<u8>>,
}

/// Offline-first sync engine.
pub struct SyncEngine {
    schema: Arc<Schema>,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteBackend>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    state: Mutex<EngineState>,
    /// Held for the duration of a sync so runs never overlap
    sync_guard: Mutex<()>,
    paused: AtomicBool,
    events: EventBus,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("schema_version", &self.schema.version)
            .field("paused", &self.is_paused())
            .field("subscribers", &self.events.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Engine with the default configuration.
    pub fn new(schema: Schema, store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteBackend>) -> Self {
        Self::with_config(schema, store, remote, EngineConfig::default())
    }

    pub fn with_config(
        schema: Schema,
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        config: EngineConfig,
    ) -> Self {
        let state = EngineState::new(&config);
        Self {
            schema: Arc::new(schema),
            store,
            remote,
            clock: Arc::new(SystemClock),
            config,
            state: Mutex::new(state),
            sync_guard: Mutex::new(()),
            paused: AtomicBool::new(false),
            events: EventBus::new(),
        }
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the conflict resolver, e.g. to register custom handlers.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.state.get_mut().resolver = resolver;
        self
    }

    /// Replace the consistency checker, e.g. to register custom checks.
    pub fn with_checker(mut self, checker: ConsistencyChecker) -> Self {
        self.state.get_mut().checker = checker;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register an event subscriber.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Validate, apply locally and queue a mutation.
    ///
    /// Validation, queue capacity and dependency errors are returned here;
    /// everything that happens on the wire is reported through events.
    pub async fn add_operation(&self, op: Operation) -> Result<OperationId> {
        self.schema.validate_operation(&op)?;
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        self.enqueue_locked(&mut state, op, now).await
    }

    async fn enqueue_locked(
        &self,
        state: &mut EngineState,
        mut op: Operation,
        now: Timestamp,
    ) -> Result<OperationId> {
        if op.max_retries == DEFAULT_MAX_RETRIES {
            op.max_retries = self.config.retry.max_retries;
        }
        if op.backoff == BackoffStrategy::default() {
            op.backoff = self.config.retry.backoff.clone();
        }

        let existing = self.store.get(&op.entity_type, &op.entity_id).await?;
        if op.base_version.is_none()
            && matches!(op.kind, OperationKind::Update | OperationKind::Delete)
        {
            op.base_version = existing.as_ref().map(|r| r.version).filter(|v| *v > 0);
        }
        op.prior_state = Some(existing.clone().map_or(PriorState::Absent, PriorState::Present));

        let enqueued = state.queue.enqueue(op.clone(), now)?;
        let eviction = match enqueued.evicted {
            Some(evicted) => {
                self.events.publish(SyncEvent::OperationEvicted {
                    operation_id: evicted.id.clone(),
                    replaced_by: enqueued.id.clone(),
                });
                self.fail_and_roll_back(state, evicted, enqueued.cascaded)
                    .await
            }
            None => Ok(()),
        };

        if let Err(err) = self.write_optimistic(&op, existing, now).await {
            warn!(op_id = %enqueued.id, error = %err, "local write failed, withdrawing operation");
            self.withdraw(state, &enqueued.id).await;
            return Err(err);
        }
        self.publish_status(&op.id, &op, OperationStatus::Pending, None);
        eviction?;
        Ok(enqueued.id)
    }

    /// Take back an operation whose local write never happened. Operations
    /// already waiting on it fail with it.
    async fn withdraw(&self, state: &mut EngineState, id: &str) {
        let cascaded = match state.queue.cancel(id) {
            Ok(Cancellation::Removed { cascaded, .. }) => cascaded,
            Ok(Cancellation::RollbackOnCompletion) => Vec::new(),
            Err(err) => {
                warn!(op_id = %id, error = %err, "could not withdraw operation");
                return;
            }
        };
        for casualty in &cascaded {
            self.publish_status(
                &casualty.id,
                casualty,
                OperationStatus::Failed,
                casualty.last_error.clone(),
            );
        }
        for casualty in cascaded.iter().rev() {
            if let Err(err) = self.roll_back(state, casualty).await {
                warn!(op_id = %casualty.id, error = %err, "rollback failed");
            }
        }
    }

    async fn write_optimistic(
        &self,
        op: &Operation,
        existing: Option<Record>,
        now: Timestamp,
    ) -> Result<()> {
        match op.kind {
            OperationKind::Create | OperationKind::Update => {
                let mut record = existing.unwrap_or_else(|| {
                    Record::new(&op.entity_type, &op.entity_id, serde_json::Value::Null, 0, now)
                });
                record.data = op.data.clone();
                record.deleted = false;
                record.updated_at = now;
                record.origin = Origin::Local;
                self.store.put(&op.entity_type, record).await
            }
            OperationKind::Delete => match existing {
                Some(mut record) if record.is_active() => {
                    record.mark_deleted(now);
                    record.origin = Origin::Local;
                    self.store.put(&op.entity_type, record).await
                }
                _ => Ok(()),
            },
            OperationKind::Pull => Ok(()),
        }
    }

    /// Put back what an operation overwrote, unless a later live operation
    /// on the same entity owns the local copy now.
    async fn roll_back(&self, state: &EngineState, op: &Operation) -> Result<()> {
        if !op.mutates_remote() || state.has_live(&op.entity_type, &op.entity_id) {
            return Ok(());
        }
        match &op.prior_state {
            Some(PriorState::Absent) => {
                debug!(op_id = %op.id, "rolling back optimistic create");
                self.store.delete(&op.entity_type, &op.entity_id).await
            }
            Some(PriorState::Present(record)) => {
                debug!(op_id = %op.id, "restoring prior local state");
                self.store.put(&op.entity_type, record.clone()).await
            }
            None => Ok(()),
        }
    }

    /// Report a terminal failure and undo its local effects, dependents first.
    async fn fail_and_roll_back(
        &self,
        state: &mut EngineState,
        op: Operation,
        cascaded: Vec<Operation>,
    ) -> Result<()> {
        for casualty in cascaded.iter().chain(std::iter::once(&op)) {
            self.publish_status(
                &casualty.id,
                casualty,
                OperationStatus::Failed,
                casualty.last_error.clone(),
            );
        }
        for casualty in cascaded.iter().rev() {
            self.roll_back(state, casualty).await?;
        }
        self.roll_back(state, &op).await
    }

    /// Cancel an operation.
    ///
    /// A queued operation is removed and its local write undone. One already
    /// on the wire is compensated once the remote acknowledges it.
    pub async fn cancel_operation(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.scheduler.cancel(id) {
            state.queue.requeue(id)?;
        }
        match state.queue.cancel(id)? {
            Cancellation::Removed { op, cascaded } => {
                self.fail_and_roll_back(&mut state, op, cascaded).await
            }
            Cancellation::RollbackOnCompletion => {
                info!(op_id = %id, "operation in flight, compensating on completion");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    pub fn pause_sync(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("sync paused");
            self.events.publish(SyncEvent::EngineStatusChanged {
                status: EngineStatus::Paused,
            });
        }
    }

    pub fn resume_sync(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("sync resumed");
            self.events.publish(SyncEvent::EngineStatusChanged {
                status: EngineStatus::Idle,
            });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Send everything that is ready, in rounds, until nothing more can go.
    pub async fn trigger_sync(&self) -> Result<SyncSummary> {
        let _run = self.sync_guard.lock().await;
        let started_at = self.clock.now();
        let mut summary = SyncSummary {
            started_at,
            ..SyncSummary::default()
        };

        if self.is_paused() {
            debug!("sync skipped while paused");
            summary.skipped = true;
            summary.finished_at = started_at;
            return Ok(summary);
        }

        {
            let mut state = self.state.lock().await;
            self.set_status(&mut state, EngineStatus::Syncing);
            self.events.publish(SyncEvent::SyncStarted {
                pending: state.queue.len(),
            });
        }

        let outcome = self.run_rounds(&mut summary).await;
        if let Err(err) = &outcome {
            warn!(error = %err, "sync cut short");
            summary.error = Some(err.to_string());
        }

        let mut state = self.state.lock().await;
        let status = if self.is_paused() {
            EngineStatus::Paused
        } else if state.scheduler.network_state().quality == NetworkQuality::Offline {
            EngineStatus::Offline
        } else {
            EngineStatus::Idle
        };
        self.set_status(&mut state, status);
        summary.finished_at = self.clock.now();
        info!(
            completed = summary.completed,
            retried = summary.retried,
            failed = summary.failed,
            conflicts = summary.conflicts,
            "sync finished"
        );
        self.events.publish(SyncEvent::SyncCompleted {
            summary: summary.clone(),
        });
        outcome.map(|()| summary)
    }

    /// Cycle sweep, prediction and dispatch rounds. Every outcome of a round
    /// is settled even when one fails; the first error is returned.
    async fn run_rounds(&self, summary: &mut SyncSummary) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            self.sweep_cycles(&mut state, summary).await?;
            self.predict(&mut state, summary);
        }

        for _ in 0..MAX_DISPATCH_ROUNDS {
            let dispatch = {
                let mut state = self.state.lock().await;
                self.stage(&mut state)
            };
            if dispatch.is_empty() {
                break;
            }
            debug!(
                batches = dispatch.batches.len(),
                requests = dispatch.request_count(),
                quality = %dispatch.quality,
                batch_limit = dispatch.batch_limit,
                "dispatching"
            );
            summary.batches += dispatch.batches.len();
            summary.dispatched += dispatch.request_count();

            let force_compression = dispatch.force_compression;
            let outcomes = futures::future::join_all(
                dispatch
                    .batches
                    .into_iter()
                    .map(|batch| self.transmit(batch, force_compression)),
            )
            .await;

            let mut state = self.state.lock().await;
            let mut first_error = None;
            for transmitted in outcomes.into_iter().flatten() {
                summary.bytes_sent += transmitted.bytes;
                if let Err(err) = self.settle(&mut state, transmitted, summary).await {
                    warn!(error = %err, "failed to settle outcome");
                    first_error.get_or_insert(err);
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
            if self.is_paused() {
                break;
            }
        }
        Ok(())
    }

    async fn sweep_cycles(&self, state: &mut EngineState, summary: &mut SyncSummary) -> Result<()> {
        let failed = state.queue.fail_dependency_cycles();
        if failed.is_empty() {
            return Ok(());
        }
        summary.failed += failed.len();
        for op in &failed {
            state
                .predictor
                .record_outcome(&op.entity_type, ConflictType::DependencyConflict);
            self.publish_status(&op.id, op, OperationStatus::Failed, op.last_error.clone());
        }
        for op in failed.iter().rev() {
            self.roll_back(state, op).await?;
        }
        Ok(())
    }

    /// Score live operations and apply preventive actions above the risk
    /// threshold.
    fn predict(&self, state: &mut EngineState, summary: &mut SyncSummary) {
        let operations = state.queue.operations();
        let predictions = state
            .predictor
            .predict(&operations, &state.remote_versions);
        drop(operations);

        summary.predictions = predictions.len();
        let threshold = state.predictor.weights().risk_threshold;
        for prediction in predictions.iter().filter(|p| p.probability >= threshold) {
            let applied = match &prediction.action {
                PreventiveAction::None => false,
                PreventiveAction::ElevatePriority {
                    operation_id,
                    priority,
                } => state.queue.elevate(operation_id, *priority),
                PreventiveAction::ForceValidation { operation_id } => {
                    state.queue.require_validation(operation_id)
                }
                PreventiveAction::ReorderDependencies {
                    operation_id,
                    after,
                } => match state.queue.add_dependency(operation_id, after) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(op_id = %operation_id, after = %after, error = %err, "reorder rejected");
                        false
                    }
                },
            };
            if applied {
                info!(
                    entity_type = %prediction.entity_type,
                    entity_id = %prediction.entity_id,
                    conflict_type = %prediction.conflict_type,
                    probability = prediction.probability,
                    "preventive action applied"
                );
                summary.preventive_actions += 1;
            }
        }
    }

    /// Move ready operations into the scheduler and pick the next batches.
    fn stage(&self, state: &mut EngineState) -> crate::transmission::Dispatch {
        let now = self.clock.now();
        while let Some(op) = state.queue.dequeue_ready(now) {
            self.publish_status(&op.id, &op, OperationStatus::Processing, None);
            let options = SubmitOptions::for_operation(&op);
            let op_id = op.id.clone();
            let receipt = state.scheduler.submit(op, options, now);
            if let Admission::Duplicate { original } = receipt.admission {
                debug!(op_id = %op_id, original = %original, "riding along with identical request");
            }
        }
        state.scheduler.next_dispatch(now)
    }

    /// Re-read the remote copy of an operation flagged for validation.
    async fn validate_remote(&self, op: &Operation) -> Result<()> {
        let Some(base) = op.base_version else {
            return Ok(());
        };
        match self.remote.fetch(&op.entity_type, &op.entity_id).await? {
            Some(current) if current.version != base => {
                if !current.is_active() && op.kind != OperationKind::Delete {
                    Err(Error::DeleteUpdateRace {
                        entity_type: op.entity_type.clone(),
                        entity_id: op.entity_id.clone(),
                    })
                } else {
                    Err(Error::ConcurrentModification {
                        entity_type: op.entity_type.clone(),
                        entity_id: op.entity_id.clone(),
                        base,
                        remote: current.version,
                    })
                }
            }
            _ => Ok(()),
        }
    }

    /// Encode and send one batch. Runs without the state lock.
    async fn transmit(&self, batch: Batch, force_compression: bool) -> Vec<Transmitted> {
        let policy = &self.config.transmission.compression;
        let mut done = Vec::new();
        let mut prepared = Vec::new();

        for request in batch.requests {
            let op = request.operation;
            if op.requires_validation {
                if let Err(err) = self.validate_remote(&op).await {
                    debug!(op_id = %op.id, error = %err, "pre-send validation failed");
                    done.push(Transmitted {
                        request_id: request.id,
                        op,
                        result: Err(err),
                        remote_copy: None,
                        bytes: 0,
                        duration_ms: 0,
                        compression_ratio: None,
                        compressed_data: None,
                    });
                    continue;
                }
            }

            let payload = codec::encode(&op.data, policy, force_compression).await;
            let remote_request = RemoteRequest {
                operation_id: op.id.clone(),
                entity_type: op.entity_type.clone(),
                entity_id: op.entity_id.clone(),
                kind: op.kind,
                payload,
                base_version: op.base_version,
                checksum: op.checksum.clone(),
            };
            prepared.push((request.id, op, remote_request));
        }

        if prepared.is_empty() {
            return done;
        }

        let timeout_ms = prepared
            .iter()
            .filter_map(|(_, op, _)| op.timeout_ms)
            .max()
            .unwrap_or(self.config.transmission.default_timeout_ms);
        let timeout = Duration::from_millis(timeout_ms);
        let requests: Vec<RemoteRequest> = prepared.iter().map(|(_, _, r)| r.clone()).collect();
        let count = requests.len();

        let started = Instant::now();
        let results: Vec<Result<RemoteResponse>> = if count == 1 {
            let call = requests
                .into_iter()
                .next()
                .map(|request| self.remote.execute(request));
            match call {
                Some(call) => vec![tokio::time::timeout(timeout, call)
                    .await
                    .unwrap_or(Err(Error::Timeout))],
                None => Vec::new(),
            }
        } else {
            match tokio::time::timeout(timeout, self.remote.execute_batch(requests)).await {
                Ok(results) => results,
                Err(_) => vec![Err(Error::Timeout); count],
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut results = results.into_iter();
        for (request_id, op, request) in prepared {
            let result = results
                .next()
                .unwrap_or_else(|| Err(Error::Unavailable("no response for request".into())));
            let remote_copy = match &result {
                Err(err) if err.kind() == ErrorKind::Conflict => self
                    .remote
                    .fetch(&op.entity_type, &op.entity_id)
                    .await
                    .ok()
                    .flatten(),
                _ => None,
            };
            done.push(Transmitted {
                request_id,
                bytes: request.payload.len() as u64,
                compression_ratio: request.payload.ratio(),
                compressed_data: request.payload.compressed.then_some(request.payload.bytes),
                op,
                result,
                remote_copy,
                duration_ms,
            });
        }
        done
    }

    /// Fold one remote outcome back into the engine state.
    async fn settle(
        &self,
        state: &mut EngineState,
        transmitted: Transmitted,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let Transmitted {
            request_id,
            op,
            result,
            remote_copy,
            bytes,
            duration_ms,
            compression_ratio,
            compressed_data,
        } = transmitted;
        let now = self.clock.now();

        match result {
            Ok(response) => {
                let duplicates = state.scheduler.complete(&request_id, bytes, duration_ms);
                let version = response.version;
                let completed = self
                    .complete(
                        state,
                        &op.id,
                        response,
                        Ack::Completed {
                            remote_version: version,
                            bytes,
                            duration_ms,
                            compression_ratio,
                        },
                        summary,
                    )
                    .await;
                for duplicate in duplicates {
                    if state.queue.get(&duplicate).is_some() {
                        let acked = state.queue.ack(
                            &duplicate,
                            Ack::Completed {
                                remote_version: version,
                                bytes: 0,
                                duration_ms: 0,
                                compression_ratio: None,
                            },
                            now,
                        )?;
                        summary.completed += 1;
                        self.publish_status(&acked.op.id, &acked.op, OperationStatus::Completed, None);
                    }
                }
                completed
            }
            Err(error) => {
                let duplicates = state.scheduler.release(&request_id);
                if let Some(live) = state.queue.get_mut(&op.id) {
                    live.compressed_data = compressed_data;
                }
                let handled = self
                    .handle_failure(state, op, error, remote_copy, duration_ms, summary)
                    .await;
                for duplicate in duplicates {
                    if state.queue.get(&duplicate).is_some() {
                        state.queue.ack(
                            &duplicate,
                            Ack::Retry {
                                at: now,
                                duration_ms: 0,
                            },
                            now,
                        )?;
                    }
                }
                handled
            }
        }
    }

    async fn complete(
        &self,
        state: &mut EngineState,
        op_id: &str,
        response: RemoteResponse,
        ack: Ack,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let now = self.clock.now();
        let acked = state.queue.ack(op_id, ack, now)?;
        let op = acked.op;
        debug!(op_id = %op.id, version = response.version, "operation acknowledged");

        state
            .remote_versions
            .insert(op.entity_key(), response.version);
        Self::rebase_followers(state, &op, response.version);
        summary.completed += 1;
        self.publish_status(&op.id, &op, OperationStatus::Completed, None);
        self.apply_remote_record(state, &op.entity_type, &op.entity_id, response.record)
            .await?;

        if op.rollback_on_completion {
            self.compensate(state, &op, response.version, now).await?;
        }
        Ok(())
    }

    /// Later edits of the same entity were made against the version this
    /// operation replaced; move them onto the version it produced.
    fn rebase_followers(state: &mut EngineState, op: &Operation, remote_version: Version) {
        let followers: Vec<OperationId> = state
            .queue
            .operations()
            .iter()
            .filter(|o| o.targets(&op.entity_type, &op.entity_id))
            .filter(|o| o.base_version == op.base_version)
            .map(|o| o.id.clone())
            .collect();
        for id in followers {
            if let Some(follower) = state.queue.get_mut(&id) {
                follower.base_version = Some(remote_version);
            }
        }
    }

    /// Store the canonical remote copy locally. While later local edits are
    /// still queued only the version is taken over.
    async fn apply_remote_record(
        &self,
        state: &EngineState,
        entity_type: &str,
        entity_id: &str,
        record: Record,
    ) -> Result<()> {
        let local = self.store.get(entity_type, entity_id).await?;
        if state.has_live(entity_type, entity_id) {
            if let Some(mut local) = local {
                local.version = local.version.max(record.version);
                self.store.put(entity_type, local).await?;
            }
            return Ok(());
        }
        if !record.is_active() && record.version == 0 && local.is_none() {
            return Ok(());
        }
        self.store.put(entity_type, record.from_remote()).await
    }

    /// Undo a cancelled operation that reached the remote anyway.
    async fn compensate(
        &self,
        state: &mut EngineState,
        op: &Operation,
        remote_version: Version,
        now: Timestamp,
    ) -> Result<()> {
        let compensation = match &op.prior_state {
            Some(PriorState::Present(prior)) if prior.is_active() => {
                let kind = if op.kind == OperationKind::Delete {
                    OperationKind::Create
                } else {
                    OperationKind::Update
                };
                Operation::new(kind, &op.entity_type, &op.entity_id, prior.data.clone())
            }
            _ if op.kind == OperationKind::Delete => return Ok(()),
            _ => Operation::delete(&op.entity_type, &op.entity_id),
        };
        let compensation = compensation
            .with_base_version(remote_version)
            .with_priority(op.priority);
        info!(op_id = %op.id, compensation = %compensation.id, "compensating cancelled operation");
        self.enqueue_locked(state, compensation, now).await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        state: &mut EngineState,
        op: Operation,
        error: Error,
        remote_copy: Option<Record>,
        duration_ms: u64,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let now = self.clock.now();
        match error.kind() {
            ErrorKind::Conflict => {
                return self
                    .handle_conflict(state, op, &error, remote_copy, summary)
                    .await;
            }
            ErrorKind::Integrity => {
                let alert = Alert {
                    id: uuid::Uuid::new_v4().to_string(),
                    entity_type: op.entity_type.clone(),
                    check_type: CheckType::Checksum,
                    severity: Severity::High,
                    message: format!("{} rejected: {error}", op.id),
                    result_id: None,
                    created_at: now,
                };
                state.checker.raise(alert.clone());
                self.events.publish(SyncEvent::AlertCreated { alert });
            }
            _ => {}
        }

        let decision = match state.queue.get_mut(&op.id) {
            Some(live) => state.retry.schedule_retry(live, &error, now),
            None => return Ok(()),
        };
        match decision {
            RetryDecision::Retry {
                next_retry_time,
                delay_ms,
            } => {
                let acked = state.queue.ack(
                    &op.id,
                    Ack::Retry {
                        at: next_retry_time,
                        duration_ms,
                    },
                    now,
                )?;
                summary.retried += 1;
                debug!(op_id = %op.id, delay_ms, error = %error, "retry scheduled");
                self.publish_status(
                    &acked.op.id,
                    &acked.op,
                    OperationStatus::Pending,
                    Some(error.to_string()),
                );
                Ok(())
            }
            RetryDecision::Terminal { error } => {
                let acked = state.queue.ack(&op.id, Ack::Failed { error }, now)?;
                summary.failed += 1 + acked.cascaded.len();
                self.fail_and_roll_back(state, acked.op, acked.cascaded)
                    .await
            }
        }
    }

    async fn handle_conflict(
        &self,
        state: &mut EngineState,
        op: Operation,
        error: &Error,
        remote_copy: Option<Record>,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let now = self.clock.now();
        let conflict_type = match error {
            Error::DeleteUpdateRace { .. } => ConflictType::DeleteUpdate,
            _ => ConflictType::ConcurrentModification,
        };

        let local = if op.kind == OperationKind::Delete {
            VersionSnapshot::tombstone(op.version(), op.enqueued_at)
        } else {
            VersionSnapshot::new(op.data.clone(), op.version(), op.enqueued_at)
        };
        let remote = match &remote_copy {
            Some(r) if r.is_active() => VersionSnapshot::new(r.data.clone(), r.version, r.updated_at),
            Some(r) => VersionSnapshot::tombstone(r.version, r.updated_at),
            None => VersionSnapshot::tombstone(0, now),
        };
        let mut conflict = ConflictRecord::new(
            &op.entity_type,
            &op.entity_id,
            conflict_type,
            local,
            remote,
            now,
        )
        .with_operation(&op.id);
        if let Some(PriorState::Present(base)) = &op.prior_state {
            if base.is_active() && Some(base.version) == op.base_version {
                conflict = conflict.with_base(VersionSnapshot::new(
                    base.data.clone(),
                    base.version,
                    base.updated_at,
                ));
            }
        }
        if let Some(r) = &remote_copy {
            state.remote_versions.insert(op.entity_key(), r.version);
        }

        state
            .predictor
            .record_outcome(&op.entity_type, conflict_type);
        summary.conflicts += 1;
        self.events.publish(SyncEvent::ConflictDetected {
            conflict: conflict.clone(),
        });

        let conflict_id = conflict.id.clone();
        let resolutions = state.resolver.resolve(vec![conflict], &self.schema, now);
        match resolutions.into_iter().next() {
            Some(resolution) => {
                summary.resolved += 1;
                self.apply_resolution(state, &conflict_id, resolution).await
            }
            None => {
                state.queue.ack(
                    &op.id,
                    Ack::Suspend {
                        conflict_id: conflict_id.clone(),
                    },
                    now,
                )?;
                self.publish_status(
                    &op.id,
                    &op,
                    OperationStatus::Pending,
                    Some(error.to_string()),
                );
                Ok(())
            }
        }
    }

    /// Carry out a resolution: adopt the remote copy, or push the resolved
    /// state on top of the remote version.
    async fn apply_resolution(
        &self,
        state: &mut EngineState,
        conflict_id: &str,
        resolution: ConflictResolution,
    ) -> Result<()> {
        let now = self.clock.now();
        let Some(conflict) = state.resolver.get(conflict_id).cloned() else {
            return Ok(());
        };
        self.events.publish(SyncEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            resolution: resolution.clone(),
        });

        let remote = &conflict.remote;
        let matches_remote = if resolution.deleted {
            remote.deleted
        } else {
            !remote.deleted && resolution.resolved.as_ref() == Some(&remote.data)
        };
        let live = conflict
            .operation_id
            .clone()
            .filter(|id| state.queue.get(id).is_some());

        if matches_remote {
            let mut record = Record::new(
                &conflict.entity_type,
                &conflict.entity_id,
                remote.data.clone(),
                remote.version,
                remote.timestamp,
            );
            record.deleted = remote.deleted;

            if let Some(id) = live {
                state.queue.resume(&id)?;
                let acked = state.queue.ack(
                    &id,
                    Ack::Completed {
                        remote_version: remote.version,
                        bytes: 0,
                        duration_ms: 0,
                        compression_ratio: None,
                    },
                    now,
                )?;
                Self::rebase_followers(state, &acked.op, remote.version);
                self.publish_status(&acked.op.id, &acked.op, OperationStatus::Completed, None);
            }
            return self
                .apply_remote_record(state, &conflict.entity_type, &conflict.entity_id, record)
                .await;
        }

        let (kind, data) = match &resolution.resolved {
            None => (OperationKind::Delete, serde_json::Value::Null),
            Some(value) if remote.deleted => (OperationKind::Create, value.clone()),
            Some(value) => (OperationKind::Update, value.clone()),
        };

        match live {
            Some(id) => {
                let processing = if let Some(op) = state.queue.get_mut(&id) {
                    op.kind = kind;
                    op.data = data.clone();
                    op.base_version = Some(remote.version);
                    op.requires_validation = false;
                    op.refresh_checksum();
                    op.status == OperationStatus::Processing
                } else {
                    false
                };
                state.queue.resume(&id)?;
                if processing {
                    state.queue.ack(
                        &id,
                        Ack::Retry {
                            at: now,
                            duration_ms: 0,
                        },
                        now,
                    )?;
                }
                debug!(op_id = %id, kind = ?kind, "operation rewritten with resolved state");
            }
            None => {
                let op = Operation::new(kind, &conflict.entity_type, &conflict.entity_id, data.clone())
                    .with_base_version(remote.version)
                    .with_priority(Priority::High);
                self.enqueue_locked(state, op, now).await?;
            }
        }

        let mut record = Record::new(
            &conflict.entity_type,
            &conflict.entity_id,
            data,
            remote.version,
            now,
        );
        record.deleted = kind == OperationKind::Delete;
        self.store.put(&conflict.entity_type, record).await
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Open conflicts.
    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.state.lock().await.resolver.open_conflicts()
    }

    /// Resolved conflicts, oldest first.
    pub async fn conflict_history(&self) -> Vec<ConflictRecord> {
        self.state.lock().await.resolver.history()
    }

    /// Settle an open conflict with a strategy.
    ///
    /// Resolving an already resolved conflict returns the earlier resolution
    /// and changes nothing.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<ConflictResolution> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if let Some(prior) = state.resolver.resolution(conflict_id) {
            return Ok(prior.clone());
        }
        let resolution =
            state
                .resolver
                .resolve_with_strategy(conflict_id, strategy, &self.schema, now)?;
        self.apply_resolution(&mut state, conflict_id, resolution.clone())
            .await?;
        Ok(resolution)
    }

    /// Settle an open conflict with a caller-supplied value.
    pub async fn resolve_conflict_with(
        &self,
        conflict_id: &str,
        value: serde_json::Value,
    ) -> Result<ConflictResolution> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if let Some(prior) = state.resolver.resolution(conflict_id) {
            return Ok(prior.clone());
        }
        let resolution = state
            .resolver
            .resolve_with_value(conflict_id, value, &self.schema, now)?;
        self.apply_resolution(&mut state, conflict_id, resolution.clone())
            .await?;
        Ok(resolution)
    }

    /// Predictions from the last sync.
    pub async fn predictions(&self) -> Vec<ConflictPrediction> {
        self.state.lock().await.predictor.latest().to_vec()
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    /// Version, count and structural checks for every entity type.
    pub async fn perform_quick_check(&self) -> Result<Vec<CheckReport>> {
        self.run_checks(&CheckType::QUICK, false).await
    }

    /// Every check for every entity type, with remote records fetched.
    pub async fn perform_full_check(&self) -> Result<Vec<CheckReport>> {
        self.run_checks(&CheckType::FULL, true).await
    }

    async fn run_checks(&self, check_types: &[CheckType], full: bool) -> Result<Vec<CheckReport>> {
        let entity_types = self.schema.entity_types();
        let mut related = HashMap::new();
        if full {
            for entity_type in &entity_types {
                related.insert(entity_type.clone(), self.store.scan_all(entity_type).await?);
            }
        }

        let mut reports = Vec::with_capacity(entity_types.len());
        for entity_type in entity_types {
            let pending = {
                let mut state = self.state.lock().await;
                state.checker.begin(&entity_type);
                state.queue.pending_entities(&entity_type)
            };

            let gathered = self.gather(&entity_type, full, &related).await;
            let mut state = self.state.lock().await;
            let (local, summary, remote) = match gathered {
                Ok(gathered) => gathered,
                Err(err) => {
                    warn!(entity_type = %entity_type, error = %err, "consistency check aborted");
                    state.checker.abort(&entity_type);
                    return Err(err);
                }
            };

            for (id, version) in &summary.versions {
                state
                    .remote_versions
                    .insert((entity_type.clone(), id.clone()), *version);
            }
            let inputs = CheckInputs {
                entity_type: entity_type.clone(),
                local,
                summary,
                remote,
                related: if full { related.clone() } else { HashMap::new() },
                pending,
            };
            let now = self.clock.now();
            let report = state.checker.run(check_types, inputs, &self.schema, now);
            for alert in &report.alerts {
                self.events.publish(SyncEvent::AlertCreated {
                    alert: alert.clone(),
                });
            }
            if self.config.consistency.auto_repair {
                self.enqueue_repairs(&mut state, &report, now).await?;
            }
            reports.push(report);
        }
        Ok(reports)
    }

    async fn gather(
        &self,
        entity_type: &str,
        full: bool,
        related: &HashMap<EntityType, Vec<Record>>,
    ) -> Result<(Vec<Record>, RemoteSummary, Option<Vec<Record>>)> {
        let local = match related.get(entity_type) {
            Some(records) => records.clone(),
            None => self.store.scan_all(entity_type).await?,
        };
        if full {
            let remote = self.remote.fetch_all(entity_type).await?;
            let summary = RemoteSummary::from_records(entity_type, &remote);
            Ok((local, summary, Some(remote)))
        } else {
            let summary = self.remote.summary(entity_type).await?;
            Ok((local, summary, None))
        }
    }

    /// Queue corrective operations for auto-fixable findings.
    async fn enqueue_repairs(
        &self,
        state: &mut EngineState,
        report: &CheckReport,
        now: Timestamp,
    ) -> Result<()> {
        let entity_type = &report.entity_type;
        for repair in report.repairs() {
            if state.has_live(entity_type, &repair.entity_id) {
                continue;
            }
            let op = match repair.direction {
                RepairDirection::PullRemote => Operation::pull(entity_type, &repair.entity_id),
                RepairDirection::PushLocal => {
                    let Some(local) = self.store.get(entity_type, &repair.entity_id).await? else {
                        continue;
                    };
                    let key = (entity_type.clone(), repair.entity_id.clone());
                    match (local.is_active(), state.remote_versions.get(&key).copied()) {
                        (false, _) => continue,
                        (true, Some(version)) => {
                            Operation::update(entity_type, &repair.entity_id, local.data)
                                .with_base_version(version)
                        }
                        (true, None) => Operation::create(entity_type, &repair.entity_id, local.data),
                    }
                }
            }
            .with_priority(Priority::Low);

            match self.enqueue_locked(state, op, now).await {
                Ok(id) => {
                    debug!(op_id = %id, entity_id = %repair.entity_id, direction = ?repair.direction, "repair queued")
                }
                Err(err) => {
                    warn!(entity_id = %repair.entity_id, error = %err, "repair not queued")
                }
            }
        }
        Ok(())
    }

    /// Retained alerts, oldest first.
    pub async fn alerts(&self) -> Vec<Alert> {
        self.state.lock().await.checker.alerts()
    }

    /// Retained check results, oldest first.
    pub async fn check_history(&self) -> Vec<ConsistencyCheckResult> {
        self.state.lock().await.checker.history()
    }

    // ------------------------------------------------------------------
    // Network and stats
    // ------------------------------------------------------------------

    /// Feed an observed network state to the scheduler.
    pub async fn update_network_state(&self, network: NetworkState) {
        let mut state = self.state.lock().await;
        state.scheduler.update_network(&network);
        let status = match (network.online, state.status) {
            (false, _) => Some(EngineStatus::Offline),
            (true, EngineStatus::Offline) => Some(EngineStatus::Idle),
            _ => None,
        };
        if let Some(status) = status {
            self.set_status(&mut state, status);
        }
    }

    pub async fn network_state(&self) -> NetworkState {
        self.state.lock().await.scheduler.network_state()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.state.lock().await.queue.stats()
    }

    pub async fn transmission_stats(&self) -> TransmissionStats {
        self.state.lock().await.scheduler.stats()
    }

    /// Live operation by id.
    pub async fn operation(&self, id: &str) -> Option<Operation> {
        self.state.lock().await.queue.get(id).cloned()
    }

    pub async fn status(&self) -> EngineStatus {
        self.state.lock().await.status
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Capture queue, conflicts and check history.
    pub async fn export_state(&self) -> EngineSnapshot {
        let state = self.state.lock().await;
        let mut snapshot = EngineSnapshot::new(self.schema.version, self.clock.now());
        snapshot.queue = state.queue.snapshot();
        snapshot.conflicts = state.resolver.snapshot();
        snapshot.check_history = state.checker.history();
        snapshot.alerts = state.checker.alerts();
        snapshot
    }

    /// Replace the engine state with a snapshot.
    ///
    /// Requests waiting in the scheduler are dropped; their operations are
    /// pending again in the restored queue.
    pub async fn import_state(&self, snapshot: EngineSnapshot) -> Result<()> {
        snapshot.validate(self.schema.version)?;
        let mut state = self.state.lock().await;
        let network = state.scheduler.network_state();

        state.remote_versions = snapshot
            .queue
            .entity_versions
            .iter()
            .map(|v| ((v.entity_type.clone(), v.entity_id.clone()), v.version))
            .collect();
        state.queue.restore(snapshot.queue);
        state.resolver.restore(snapshot.conflicts);
        state
            .checker
            .restore(snapshot.check_history, snapshot.alerts);
        state.scheduler = TransmissionScheduler::new(self.config.transmission.clone());
        state.scheduler.update_network(&network);
        info!(
            pending = state.queue.len(),
            conflicts = state.resolver.open_conflicts().len(),
            "engine state restored"
        );
        Ok(())
    }

    /// Save a snapshot into the local store.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.export_state().await;
        let data = serde_json::to_value(&snapshot)?;
        let record = Record::new(
            STATE_COLLECTION,
            STATE_RECORD_ID,
            data,
            snapshot.format_version.into(),
            snapshot.taken_at,
        );
        self.store.put(STATE_COLLECTION, record).await
    }

    /// Load the snapshot saved by [`SyncEngine::persist`], if there is one.
    pub async fn restore(&self) -> Result<bool> {
        let Some(record) = self.store.get(STATE_COLLECTION, STATE_RECORD_ID).await? else {
            return Ok(false);
        };
        let snapshot = EngineSnapshot::from_json(&record.data.to_string())?;
        self.import_state(snapshot).await?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Background loop
    // ------------------------------------------------------------------

    /// Run periodic sync and consistency checks until `shutdown` turns true
    /// or its sender is dropped.
    pub fn spawn_background(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let intervals = &self.config.sync;
            let mut sync_tick = ticker(intervals.sync_interval_ms);
            let mut quick_tick = ticker(intervals.quick_check_interval_ms);
            let mut full_tick = ticker(intervals.full_check_interval_ms);
            info!("background sync started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = sync_tick.tick() => {
                        if let Err(err) = self.trigger_sync().await {
                            warn!(error = %err, "background sync failed");
                        }
                    }
                    _ = quick_tick.tick() => {
                        if let Err(err) = self.perform_quick_check().await {
                            warn!(error = %err, "quick check failed");
                        }
                    }
                    _ = full_tick.tick() => {
                        if let Err(err) = self.perform_full_check().await {
                            warn!(error = %err, "full check failed");
                        }
                    }
                }
            }
            info!("background sync stopped");
        })
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn publish_status(
        &self,
        operation_id: &str,
        op: &Operation,
        status: OperationStatus,
        error: Option<String>,
    ) {
        self.events.publish(SyncEvent::OperationStatusChanged {
            operation_id: operation_id.to_string(),
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            status,
            error,
        });
    }

    fn set_status(&self, state: &mut EngineState, status: EngineStatus) {
        if state.status != status {
            debug!(from = ?state.status, to = ?status, "engine status changed");
            state.status = status;
            self.events
                .publish(SyncEvent::EngineStatusChanged { status });
        }
    }
}

fn ticker(period_ms: u64) -> tokio::time::Interval {
    let period = Duration::from_millis(period_ms.max(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
