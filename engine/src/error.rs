//! Error types for the Tether engine.
//!
//! Every fallible call in the engine returns [`Error`]. Errors are grouped into
//! an [`ErrorKind`] that decides how the engine routes them: transient errors
//! are retried, conflicts go to the resolver, integrity problems raise alerts,
//! fatal errors fail the operation, and local errors are reported straight
//! back to the caller.

use crate::{EntityId, EntityType, OperationId, Version};
use thiserror::Error;

/// How an error is routed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network timeout, temporary server error, rate limit. Retried with backoff.
    Transient,
    /// Concurrent modification or delete/update race. Routed to the resolver.
    Conflict,
    /// Checksum mismatch or structural/referential violation.
    Integrity,
    /// Schema violation, permission denial, retry exhaustion. No further automatic action.
    Fatal,
    /// Queue-level problems reported synchronously to the caller.
    Local,
}

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("unknown entity type: {0}")]
    UnknownEntityType(EntityType),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Queue errors
    #[error("operation already queued: {0}")]
    DuplicateOperation(OperationId),

    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<OperationId>),

    #[error("dependency {0} failed")]
    DependencyFailed(OperationId),

    #[error("operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("operation cancelled: {0}")]
    Cancelled(OperationId),

    // Transport errors
    #[error("network timeout")]
    Timeout,

    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("network offline")]
    Offline,

    // Conflict errors
    #[error("concurrent modification of {entity_type}/{entity_id}: based on version {base}, remote is at {remote}")]
    ConcurrentModification {
        entity_type: EntityType,
        entity_id: EntityId,
        base: Version,
        remote: Version,
    },

    #[error("delete/update race on {entity_type}/{entity_id}")]
    DeleteUpdateRace {
        entity_type: EntityType,
        entity_id: EntityId,
    },

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("conflict {0} requires a manual decision")]
    ManualResolutionRequired(String),

    // Integrity errors
    #[error("checksum mismatch for operation {0}")]
    ChecksumMismatch(OperationId),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    // Fatal errors
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    // State errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("compression error: {0}")]
    Compression(String),
}

impl Error {
    /// Classify the error for routing.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Timeout
            | Error::Unavailable(_)
            | Error::RateLimited { .. }
            | Error::Offline => ErrorKind::Transient,

            Error::ConcurrentModification { .. } | Error::DeleteUpdateRace { .. } => {
                ErrorKind::Conflict
            }

            Error::ChecksumMismatch(_) | Error::IntegrityViolation(_) => ErrorKind::Integrity,

            Error::UnknownEntityType(_)
            | Error::InvalidPayload(_)
            | Error::MissingRequiredField(_)
            | Error::TypeMismatch { .. }
            | Error::SchemaViolation(_)
            | Error::PermissionDenied(_)
            | Error::RetriesExhausted { .. }
            | Error::DependencyFailed(_)
            | Error::Cancelled(_)
            | Error::Compression(_) => ErrorKind::Fatal,

            Error::DuplicateOperation(_)
            | Error::QueueFull { .. }
            | Error::DependencyCycle(_)
            | Error::OperationNotFound(_)
            | Error::ConflictNotFound(_)
            | Error::ManualResolutionRequired(_)
            | Error::Storage(_)
            | Error::InvalidSnapshot(_) => ErrorKind::Local,
        }
    }

    /// Returns true if the retry controller may schedule another attempt.
    ///
    /// Integrity errors on the wire are retried with a freshly encoded payload.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient) || matches!(self, Error::ChecksumMismatch(_))
    }

    /// Server-provided minimum wait before the next attempt, if any.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Error::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidPayload(err.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::UnknownEntityType("cards".into());
        assert_eq!(err.to_string(), "unknown entity type: cards");

        let err = Error::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");

        let err = Error::TypeMismatch {
            field: "age".into(),
            expected: "Int".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'age': expected Int, got String"
        );
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::Timeout.kind(), ErrorKind::Transient);
        assert_eq!(
            Error::RateLimited {
                retry_after_ms: Some(500)
            }
            .kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            Error::DeleteUpdateRace {
                entity_type: "card".into(),
                entity_id: "c1".into()
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            Error::ChecksumMismatch("op-1".into()).kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            Error::PermissionDenied("nope".into()).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(Error::QueueFull { capacity: 4 }.kind(), ErrorKind::Local);
    }

    #[test]
    fn retryable_errors() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Unavailable("503".into()).is_retryable());
        assert!(Error::ChecksumMismatch("op".into()).is_retryable());
        assert!(!Error::SchemaViolation("bad".into()).is_retryable());
        assert!(!Error::PermissionDenied("no".into()).is_retryable());
        assert!(!Error::ConcurrentModification {
            entity_type: "card".into(),
            entity_id: "c1".into(),
            base: 1,
            remote: 2,
        }
        .is_retryable());
    }

    #[test]
    fn retry_after_hint() {
        let err = Error::RateLimited {
            retry_after_ms: Some(1500),
        };
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert_eq!(Error::Timeout.retry_after_ms(), None);
    }
}
