//! Record types exchanged with the local store and the remote backend.

use crate::{EntityId, EntityType, Timestamp, Version};
use serde::{Deserialize, Serialize};

/// Origin of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Created or modified locally
    #[default]
    Local,
    /// Received from remote/server
    Remote,
}

/// A data record as held by either side of the sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Entity type (collection) this record belongs to
    pub entity_type: EntityType,
    /// Unique identifier within the entity type
    pub id: EntityId,
    /// Remote-canonical version; 0 means never acknowledged by the remote
    pub version: Version,
    /// The actual data payload (JSON value)
    pub data: serde_json::Value,
    /// When the record was last updated (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub deleted: bool,
    /// Where the current content came from
    #[serde(default)]
    pub origin: Origin,
}

impl Record {
    /// Create a new local record.
    pub fn new(
        entity_type: impl Into<EntityType>,
        id: impl Into<EntityId>,
        data: serde_json::Value,
        version: Version,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            version,
            data,
            updated_at,
            deleted: false,
            origin: Origin::Local,
        }
    }

    /// Mark the record as having come from the remote side.
    pub fn from_remote(mut self) -> Self {
        self.origin = Origin::Remote;
        self
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Mark record as deleted (tombstone).
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.updated_at = timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_record() {
        let record = Record::new("card", "c1", json!({"title": "Todo"}), 0, 1000);

        assert_eq!(record.entity_type, "card");
        assert_eq!(record.id, "c1");
        assert_eq!(record.version, 0);
        assert_eq!(record.origin, Origin::Local);
        assert!(record.is_active());
    }

    #[test]
    fn delete_record() {
        let mut record = Record::new("card", "c1", json!({"title": "Todo"}), 3, 1000);
        record.mark_deleted(2000);

        assert!(!record.is_active());
        assert_eq!(record.updated_at, 2000);
        assert_eq!(record.version, 3);
    }

    #[test]
    fn serialization_format() {
        let record = Record::new("card", "c1", json!({}), 1, 1000).from_remote();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("entityType"));
        assert!(json.contains("updatedAt"));
        assert!(json.contains("\"origin\":\"remote\""));
    }
}
