//! Engine events.
//!
//! Every subscriber gets its own unbounded channel. Subscribers that dropped
//! their receiver are pruned on the next publish.

use crate::conflict::{ConflictRecord, ConflictResolution};
use crate::consistency::Alert;
use crate::engine::SyncSummary;
use crate::{EntityId, EntityType, OperationId, OperationStatus};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;

/// Receiving end handed to subscribers.
pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

/// Overall engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    #[default]
    Idle,
    Syncing,
    Paused,
    Offline,
}

/// Something observers may care about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// An operation moved to a new status.
    OperationStatusChanged {
        operation_id: OperationId,
        entity_type: EntityType,
        entity_id: EntityId,
        status: OperationStatus,
        /// Error that caused a failure or retry
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    EngineStatusChanged { status: EngineStatus },

    ConflictDetected { conflict: ConflictRecord },

    ConflictResolved {
        conflict_id: String,
        resolution: ConflictResolution,
    },

    SyncStarted { pending: usize },

    SyncCompleted { summary: SyncSummary },

    AlertCreated { alert: Alert },

    /// Dropped from a full queue to make room for a higher priority one.
    OperationEvicted {
        operation_id: OperationId,
        replaced_by: OperationId,
    },
}

/// Fan-out of events to subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: DashMap<u64, mpsc::UnboundedSender<SyncEvent>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        tracing::debug!(subscriber = id, "event subscriber registered");
        rx
    }

    /// Send an event to every live subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: SyncEvent) -> usize {
        let mut sent = 0;
        self.subscribers.retain(|_, tx| {
            let ok = tx.send(event.clone()).is_ok();
            sent += usize::from(ok);
            ok
        });
        sent
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_and_prune() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(b);
        let sent = bus.publish(SyncEvent::SyncStarted { pending: 3 });
        assert_eq!(sent, 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.recv().await, Some(SyncEvent::SyncStarted { pending: 3 }));
    }

    #[test]
    fn event_serialization() {
        let event = SyncEvent::EngineStatusChanged {
            status: EngineStatus::Paused,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "engine_status_changed");
        assert_eq!(json["status"], "paused");
    }
}
