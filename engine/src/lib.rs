//! # Tether Engine
//!
//! An offline-first synchronization engine for local-first applications.
//!
//! Local mutations are applied optimistically to the local store and queued
//! as operations. The engine sends them to a remote backend when it can,
//! retries transient failures with backoff, predicts and resolves conflicts,
//! verifies that both sides agree afterwards and adapts how much it sends to
//! the network it is on.
//!
//! ## Design Principles
//!
//! - **Injected I/O**: the local database, the remote and the clock are trait
//!   objects ([`LocalStore`], [`RemoteBackend`], [`Clock`]) handed to the engine
//! - **One writer**: all engine state sits behind a single async mutex; remote
//!   calls run outside it
//! - **Nothing lost**: the queue, conflicts and check history can be
//!   snapshotted and restored across restarts
//!
//! ## Core Concepts
//!
//! ### Operations
//!
//! An [`Operation`] is a create, update, delete or pull of one entity. The
//! [`OperationQueue`] orders them by priority, holds back operations whose
//! dependencies have not completed, and never sends two operations on the same
//! entity at once.
//!
//! ### Conflicts
//!
//! Before a sync the [`ConflictPredictor`] scores risky operations and takes
//! preventive action. Conflicts the remote reports anyway go to the
//! [`ConflictResolver`], which settles them with a per entity type
//! [`ResolutionStrategy`] or leaves them open for the user.
//!
//! ### Consistency
//!
//! The [`ConsistencyChecker`] compares local and remote copies (counts,
//! versions, structure, references, content, checksums) and queues repairs
//! for what it can fix.
//!
//! ### Transmission
//!
//! The [`TransmissionScheduler`] groups operations into batches sized for the
//! current [`NetworkQuality`] and shares bandwidth between priority classes.
//!
//! ## Quick Start
//!
//! ```rust
//! use serde_json::json;
//! use std::sync::Arc;
//! use tether_engine::{
//!     EntitySchema, FieldDef, FieldType, MemoryRemote, MemoryStore, Operation, Schema,
//!     SyncEngine,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tether_engine::error::Result<()> {
//! // 1. Define a schema
//! let schema = Schema::new(1).with_entity(EntitySchema::new(
//!     "card",
//!     vec![
//!         FieldDef::required("title", FieldType::String),
//!         FieldDef::optional("done", FieldType::Bool),
//!     ],
//! ));
//!
//! // 2. Wire the engine to a store and a remote
//! let remote = Arc::new(MemoryRemote::new());
//! let engine = SyncEngine::new(schema, Arc::new(MemoryStore::new()), remote.clone());
//!
//! // 3. Queue a mutation and sync
//! engine
//!     .add_operation(Operation::create("card", "c1", json!({"title": "Write docs"})))
//!     .await?;
//! let summary = engine.trigger_sync().await?;
//! assert_eq!(summary.completed, 1);
//! assert_eq!(remote.record("card", "c1").map(|r| r.version), Some(1));
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! Use [`SyncEngine::export_state`] and [`SyncEngine::import_state`] with
//! [`EngineSnapshot`], or [`SyncEngine::persist`] and [`SyncEngine::restore`]
//! to keep the snapshot in the local store itself.

pub mod clock;
pub mod codec;
pub mod config;
pub mod conflict;
pub mod consistency;
pub mod engine;
pub mod error;
pub mod events;
pub mod operation;
pub mod queue;
pub mod record;
pub mod remote;
pub mod retry;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod transmission;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig};
pub use conflict::{
    ConflictPrediction, ConflictPredictor, ConflictRecord, ConflictResolution, ConflictResolver,
    ConflictType, MergePolicy, ResolutionStrategy, ScalarPolicy, VersionSnapshot,
};
pub use consistency::{
    Alert, CheckReport, CheckStatus, CheckType, ConsistencyCheckResult, ConsistencyChecker,
    Severity,
};
pub use engine::{SyncEngine, SyncSummary};
pub use error::{Error, ErrorKind};
pub use events::{EngineStatus, EventReceiver, SyncEvent};
pub use operation::{
    ExecutionStats, Operation, OperationKind, OperationStatus, PriorState, Priority,
    DEFAULT_MAX_RETRIES,
};
pub use queue::{OperationQueue, QueueStats};
pub use record::{Origin, Record};
pub use remote::{MemoryRemote, RemoteBackend, RemoteRequest, RemoteResponse, RemoteSummary};
pub use retry::{BackoffAlgorithm, BackoffStrategy, RetryController};
pub use schema::{EntitySchema, FieldDef, FieldType, Schema};
pub use snapshot::{EngineSnapshot, SnapshotMetadata, SNAPSHOT_FORMAT_VERSION};
pub use store::{LocalStore, MemoryStore};
pub use transmission::{NetworkQuality, NetworkState, TransmissionScheduler};

/// Type aliases for clarity
pub type EntityType = String;
pub type EntityId = String;
pub type OperationId = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;

/// `(entity_type, entity_id)`
pub type EntityKey = (EntityType, EntityId);
