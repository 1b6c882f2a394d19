//! Remote backend.
//!
//! The engine talks to the server through [`RemoteBackend`]. The backend owns
//! the canonical version of every record and rejects writes based on an
//! outdated version with a conflict error. [`MemoryRemote`] is an in-memory
//! backend with optimistic concurrency and failure injection.

use crate::clock::{Clock, SystemClock};
use crate::codec::EncodedPayload;
use crate::{
    error::Result, EntityId, EntityKey, EntityType, Error, OperationId, OperationKind, Record,
    Version,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// One operation on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    pub operation_id: OperationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub kind: OperationKind,
    pub payload: EncodedPayload,
    /// Remote version the edit was made against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    /// Checksum the operation carried when it was queued
    pub checksum: String,
}

/// Canonical record after the remote applied a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResponse {
    pub record: Record,
    pub version: Version,
}

/// Lightweight description of one entity type on the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSummary {
    pub entity_type: EntityType,
    /// Active (non-deleted) records
    pub count: usize,
    /// Version of every active record
    pub versions: BTreeMap<EntityId, Version>,
}

impl RemoteSummary {
    /// Summarize a set of records.
    pub fn from_records(entity_type: impl Into<EntityType>, records: &[Record]) -> Self {
        let versions: BTreeMap<EntityId, Version> = records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| (r.id.clone(), r.version))
            .collect();
        Self {
            entity_type: entity_type.into(),
            count: versions.len(),
            versions,
        }
    }
}

/// Server side of the sync.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Apply one operation.
    async fn execute(&self, request: RemoteRequest) -> Result<RemoteResponse>;

    /// Apply several operations in one round trip.
    async fn execute_batch(&self, requests: Vec<RemoteRequest>) -> Vec<Result<RemoteResponse>> {
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.execute(request).await);
        }
        responses
    }

    /// Current remote copy of a record, tombstones included.
    async fn fetch(&self, entity_type: &str, id: &str) -> Result<Option<Record>>;

    /// Every remote record of an entity type, tombstones included.
    async fn fetch_all(&self, entity_type: &str) -> Result<Vec<Record>>;

    /// Count and versions of active records.
    async fn summary(&self, entity_type: &str) -> Result<RemoteSummary> {
        let records = self.fetch_all(entity_type).await?;
        Ok(RemoteSummary::from_records(entity_type, &records))
    }
}

/// In-memory [`RemoteBackend`].
#[derive(Debug)]
pub struct MemoryRemote {
    records: DashMap<EntityKey, Record>,
    clock: Arc<dyn Clock>,
    failures: Mutex<VecDeque<Error>>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    requests: AtomicU64,
    batches: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            failures: Mutex::new(VecDeque::new()),
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    /// Store a record as-is, bypassing version checks.
    pub fn seed(&self, record: Record) {
        let record = record.from_remote();
        self.records
            .insert((record.entity_type.clone(), record.id.clone()), record);
    }

    /// Simulate another client editing a record. Returns the new version.
    pub fn apply_external_update(
        &self,
        entity_type: &str,
        id: &str,
        data: serde_json::Value,
    ) -> Version {
        let now = self.clock.now();
        let key = (entity_type.to_string(), id.to_string());
        let mut entry = self
            .records
            .entry(key)
            .or_insert_with(|| Record::new(entity_type, id, serde_json::Value::Null, 0, now));
        entry.version += 1;
        entry.data = data;
        entry.deleted = false;
        entry.updated_at = now;
        entry.origin = crate::Origin::Remote;
        entry.version
    }

    /// Simulate another client deleting a record. Returns the new version.
    pub fn apply_external_delete(&self, entity_type: &str, id: &str) -> Option<Version> {
        let now = self.clock.now();
        let mut entry = self
            .records
            .get_mut(&(entity_type.to_string(), id.to_string()))?;
        entry.version += 1;
        entry.mark_deleted(now);
        Some(entry.version)
    }

    /// Fail the next request with `error`. Queued failures are used in order.
    pub async fn fail_next(&self, error: Error) {
        self.failures.lock().await.push_back(error);
    }

    /// Reject every request with [`Error::Offline`] while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every request.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Current copy of a record.
    pub fn record(&self, entity_type: &str, id: &str) -> Option<Record> {
        self.records
            .get(&(entity_type.to_string(), id.to_string()))
            .map(|r| r.clone())
    }

    /// Requests received, batched or not.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Batch round trips received.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::SeqCst)
    }

    /// Payload bytes received on the wire.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::SeqCst)
    }

    async fn admit(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Offline);
        }
        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }
        Ok(())
    }

    fn apply(&self, request: &RemoteRequest, data: serde_json::Value) -> Result<RemoteResponse> {
        let now = self.clock.now();
        let key = (request.entity_type.clone(), request.entity_id.clone());
        let existing = self.records.get(&key).map(|r| r.clone());

        let concurrent = |current: &Record| Error::ConcurrentModification {
            entity_type: request.entity_type.clone(),
            entity_id: request.entity_id.clone(),
            base: request.base_version.unwrap_or(0),
            remote: current.version,
        };
        let race = || Error::DeleteUpdateRace {
            entity_type: request.entity_type.clone(),
            entity_id: request.entity_id.clone(),
        };
        let stale = |current: &Record| {
            request
                .base_version
                .is_some_and(|base| base != current.version)
        };

        let record = match (request.kind, existing) {
            (OperationKind::Pull, Some(current)) => current,
            (OperationKind::Pull, None) => {
                let mut missing =
                    Record::new(&request.entity_type, &request.entity_id, data, 0, now);
                missing.mark_deleted(now);
                missing.from_remote()
            }

            (OperationKind::Create, Some(current)) if current.is_active() => {
                return Err(concurrent(&current))
            }
            (OperationKind::Create, previous) => Record::new(
                &request.entity_type,
                &request.entity_id,
                data,
                previous.map_or(0, |p| p.version) + 1,
                now,
            ),

            (OperationKind::Update, Some(current)) if !current.is_active() => return Err(race()),
            (OperationKind::Update, Some(current)) if stale(&current) => {
                return Err(concurrent(&current))
            }
            (OperationKind::Update, current) => Record::new(
                &request.entity_type,
                &request.entity_id,
                data,
                current.map_or(0, |c| c.version) + 1,
                now,
            ),

            (OperationKind::Delete, Some(current)) if current.is_active() && stale(&current) => {
                return Err(race())
            }
            (OperationKind::Delete, Some(mut current)) => {
                if current.is_active() {
                    current.version += 1;
                    current.mark_deleted(now);
                }
                current
            }
            (OperationKind::Delete, None) => {
                let mut gone = Record::new(&request.entity_type, &request.entity_id, data, 0, now);
                gone.mark_deleted(now);
                gone
            }
        };

        let record = record.from_remote();
        if request.kind != OperationKind::Pull {
            self.records.insert(key, record.clone());
        }
        Ok(RemoteResponse {
            version: record.version,
            record,
        })
    }
}

#[async_trait]
impl RemoteBackend for MemoryRemote {
    async fn execute(&self, request: RemoteRequest) -> Result<RemoteResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.admit().await?;
        self.bytes_received
            .fetch_add(request.payload.len() as u64, Ordering::SeqCst);

        if request.payload.checksum != request.checksum {
            return Err(Error::ChecksumMismatch(request.operation_id.clone()));
        }
        let data = request
            .payload
            .decode()
            .map_err(|_| Error::ChecksumMismatch(request.operation_id.clone()))?;

        debug!(
            op_id = %request.operation_id,
            entity_type = %request.entity_type,
            entity_id = %request.entity_id,
            kind = ?request.kind,
            "remote executing request"
        );
        self.apply(&request, data)
    }

    async fn execute_batch(&self, requests: Vec<RemoteRequest>) -> Vec<Result<RemoteResponse>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut responses = Vec::with_capacity(requests.len());
        for request in requests {
            responses.push(self.execute(request).await);
        }
        responses
    }

    async fn fetch(&self, entity_type: &str, id: &str) -> Result<Option<Record>> {
        Ok(self.record(entity_type, id))
    }

    async fn fetch_all(&self, entity_type: &str) -> Result<Vec<Record>> {
        let mut records: Vec<Record> = self
            .records
            .iter()
            .filter(|r| r.key().0 == entity_type)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
