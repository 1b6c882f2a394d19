//! Conflict resolution.
//!
//! Each entity type maps to a [`ResolutionStrategy`]; each strategy maps to a
//! [`ResolutionHandler`]. Both tables are filled at construction and can be
//! overridden per entity type. Conflicts that a handler cannot settle (manual
//! strategy, or a merge that fails schema validation) stay open until the
//! caller decides.

use super::{
    merge::{MergePolicy, ScalarPolicy, ThreeWayMerge},
    ConflictRecord, ConflictResolution, ConflictType, ResolutionStrategy,
};
use crate::{error::Result, EntityType, Error, Schema, Timestamp};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

/// Default number of resolved conflicts kept.
pub const DEFAULT_CONFLICT_HISTORY: usize = 500;

/// What a handler proposes for a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// `None` when the entity ends up deleted
    pub value: Option<serde_json::Value>,
    pub explanation: String,
}

/// Settles a conflict with one strategy.
pub trait ResolutionHandler: Send + Sync + std::fmt::Debug {
    /// Name recorded as the resolver identity.
    fn name(&self) -> &str;

    /// Propose a resolution, or `None` to leave the conflict open.
    fn propose(&self, conflict: &ConflictRecord, merge: &dyn MergePolicy) -> Option<Proposal>;
}

/// Keep the local version.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptLocal;

impl ResolutionHandler for AcceptLocal {
    fn name(&self) -> &str {
        "accept-local"
    }

    fn propose(&self, conflict: &ConflictRecord, _merge: &dyn MergePolicy) -> Option<Proposal> {
        let local = &conflict.local;
        Some(Proposal {
            value: (!local.deleted).then(|| local.data.clone()),
            explanation: format!("kept local version {}", local.version),
        })
    }
}

/// Keep the remote version.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptRemote;

impl ResolutionHandler for AcceptRemote {
    fn name(&self) -> &str {
        "accept-remote"
    }

    fn propose(&self, conflict: &ConflictRecord, _merge: &dyn MergePolicy) -> Option<Proposal> {
        let remote = &conflict.remote;
        Some(Proposal {
            value: (!remote.deleted).then(|| remote.data.clone()),
            explanation: format!("kept remote version {}", remote.version),
        })
    }
}

/// Merge both versions against the base.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeResolution;

impl ResolutionHandler for MergeResolution {
    fn name(&self) -> &str {
        "merge"
    }

    fn propose(&self, conflict: &ConflictRecord, merge: &dyn MergePolicy) -> Option<Proposal> {
        let (local, remote) = (&conflict.local, &conflict.remote);
        let proposal = match (local.deleted, remote.deleted) {
            (true, true) => Proposal {
                value: None,
                explanation: "both sides deleted the entity".into(),
            },
            (false, true) => Proposal {
                value: Some(local.data.clone()),
                explanation: "remote deleted, kept surviving local version".into(),
            },
            (true, false) => Proposal {
                value: Some(remote.data.clone()),
                explanation: "local deleted, kept surviving remote version".into(),
            },
            (false, false) => Proposal {
                value: Some(merge.merge(conflict.base.as_ref(), local, remote)),
                explanation: if conflict.base.is_some() {
                    "three-way merge against the common base".into()
                } else {
                    "field-level union without a common base".into()
                },
            },
        };
        Some(proposal)
    }
}

/// Leave the conflict for the user.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualResolution;

impl ResolutionHandler for ManualResolution {
    fn name(&self) -> &str {
        "manual"
    }

    fn propose(&self, _conflict: &ConflictRecord, _merge: &dyn MergePolicy) -> Option<Proposal> {
        None
    }
}

/// Tracks open conflicts and settles them.
#[derive(Debug)]
pub struct ConflictResolver {
    default_strategy: ResolutionStrategy,
    strategies: HashMap<EntityType, ResolutionStrategy>,
    handlers: HashMap<ResolutionStrategy, Box<dyn ResolutionHandler>>,
    default_merge: Arc<dyn MergePolicy>,
    merge_policies: HashMap<EntityType, Arc<dyn MergePolicy>>,
    open: BTreeMap<String, ConflictRecord>,
    history: VecDeque<ConflictRecord>,
    history_limit: usize,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolutionStrategy::default())
    }
}

impl ConflictResolver {
    /// Resolver using `default_strategy` for every entity type.
    pub fn new(default_strategy: ResolutionStrategy) -> Self {
        let mut handlers: HashMap<ResolutionStrategy, Box<dyn ResolutionHandler>> = HashMap::new();
        handlers.insert(ResolutionStrategy::AcceptLocal, Box::new(AcceptLocal));
        handlers.insert(ResolutionStrategy::AcceptRemote, Box::new(AcceptRemote));
        handlers.insert(ResolutionStrategy::Merge, Box::new(MergeResolution));
        handlers.insert(ResolutionStrategy::Manual, Box::new(ManualResolution));

        Self {
            default_strategy,
            strategies: HashMap::new(),
            handlers,
            default_merge: Arc::new(ThreeWayMerge::default()),
            merge_policies: HashMap::new(),
            open: BTreeMap::new(),
            history: VecDeque::new(),
            history_limit: DEFAULT_CONFLICT_HISTORY,
        }
    }

    /// Use `strategy` for one entity type.
    pub fn with_strategy(
        mut self,
        entity_type: impl Into<EntityType>,
        strategy: ResolutionStrategy,
    ) -> Self {
        self.strategies.insert(entity_type.into(), strategy);
        self
    }

    /// Replace the handler behind a strategy.
    pub fn with_handler(
        mut self,
        strategy: ResolutionStrategy,
        handler: Box<dyn ResolutionHandler>,
    ) -> Self {
        self.handlers.insert(strategy, handler);
        self
    }

    /// Use a custom merge policy for one entity type.
    pub fn with_merge_policy(
        mut self,
        entity_type: impl Into<EntityType>,
        policy: Arc<dyn MergePolicy>,
    ) -> Self {
        self.merge_policies.insert(entity_type.into(), policy);
        self
    }

    /// Override how overlapping scalars merge for one entity type.
    pub fn with_scalar_policy(self, entity_type: impl Into<EntityType>, scalar: ScalarPolicy) -> Self {
        self.with_merge_policy(entity_type, Arc::new(ThreeWayMerge::new(scalar)))
    }

    /// Default scalar policy for entity types without an override.
    pub fn with_default_scalar_policy(mut self, scalar: ScalarPolicy) -> Self {
        self.default_merge = Arc::new(ThreeWayMerge::new(scalar));
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Strategy configured for an entity type.
    pub fn strategy_for(&self, entity_type: &str) -> ResolutionStrategy {
        self.strategies
            .get(entity_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    fn merge_policy_for(&self, entity_type: &str) -> &dyn MergePolicy {
        self.merge_policies
            .get(entity_type)
            .unwrap_or(&self.default_merge)
            .as_ref()
    }

    /// Track a newly detected conflict.
    pub fn register(&mut self, conflict: ConflictRecord) {
        info!(
            conflict_id = %conflict.id,
            entity_type = %conflict.entity_type,
            entity_id = %conflict.entity_id,
            conflict_type = %conflict.conflict_type,
            "conflict detected"
        );
        self.open.insert(conflict.id.clone(), conflict);
    }

    /// Register and automatically settle `conflicts` with their configured
    /// strategies. Conflicts left open are not part of the result.
    pub fn resolve(
        &mut self,
        conflicts: Vec<ConflictRecord>,
        schema: &Schema,
        now: Timestamp,
    ) -> Vec<ConflictResolution> {
        let mut resolutions = Vec::new();
        for conflict in conflicts {
            let id = conflict.id.clone();
            let strategy = self.strategy_for(&conflict.entity_type);
            if !self.open.contains_key(&id) && self.resolution(&id).is_none() {
                self.register(conflict);
            }
            match self.resolve_with_strategy(&id, strategy, schema, now) {
                Ok(resolution) => resolutions.push(resolution),
                Err(Error::ManualResolutionRequired(_)) => {}
                Err(err) => warn!(conflict_id = %id, error = %err, "automatic resolution failed"),
            }
        }
        resolutions
    }

    /// Settle an open conflict with an explicit strategy.
    ///
    /// Resolving a conflict that is already resolved returns the earlier
    /// resolution unchanged.
    pub fn resolve_with_strategy(
        &mut self,
        id: &str,
        strategy: ResolutionStrategy,
        schema: &Schema,
        now: Timestamp,
    ) -> Result<ConflictResolution> {
        if let Some(prior) = self.resolution(id) {
            return Ok(prior.clone());
        }
        let conflict = self
            .open
            .get(id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;

        let handler = self
            .handlers
            .get(&strategy)
            .ok_or_else(|| Error::ManualResolutionRequired(id.to_string()))?;
        let merge = self.merge_policy_for(&conflict.entity_type);
        let proposal = handler
            .propose(conflict, merge)
            .ok_or_else(|| Error::ManualResolutionRequired(id.to_string()))?;

        let resolved_by = handler.name().to_string();
        self.commit(id, strategy, proposal, resolved_by, schema, now)
    }

    /// Settle an open conflict with a caller-supplied value.
    pub fn resolve_with_value(
        &mut self,
        id: &str,
        value: serde_json::Value,
        schema: &Schema,
        now: Timestamp,
    ) -> Result<ConflictResolution> {
        if let Some(prior) = self.resolution(id) {
            return Ok(prior.clone());
        }
        if !self.open.contains_key(id) {
            return Err(Error::ConflictNotFound(id.to_string()));
        }

        let proposal = Proposal {
            value: Some(value),
            explanation: "resolved manually".into(),
        };
        self.commit(
            id,
            ResolutionStrategy::Manual,
            proposal,
            "user".into(),
            schema,
            now,
        )
    }

    fn commit(
        &mut self,
        id: &str,
        strategy: ResolutionStrategy,
        proposal: Proposal,
        resolved_by: String,
        schema: &Schema,
        now: Timestamp,
    ) -> Result<ConflictResolution> {
        let entity_type = self
            .open
            .get(id)
            .map(|c| c.entity_type.clone())
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;

        if let Some(value) = &proposal.value {
            if let Err(err) = schema.validate_record(&entity_type, value) {
                warn!(conflict_id = %id, error = %err, "resolved value failed validation, conflict stays open");
                return Err(Error::SchemaViolation(err.to_string()));
            }
        }

        let mut conflict = self
            .open
            .remove(id)
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;

        let resolution = ConflictResolution {
            conflict_id: id.to_string(),
            strategy,
            deleted: proposal.value.is_none(),
            resolved: proposal.value,
            resolved_by,
            explanation: proposal.explanation,
            resolved_at: now,
        };
        info!(
            conflict_id = %id,
            strategy = %strategy,
            resolved_by = %resolution.resolved_by,
            "conflict resolved"
        );

        conflict.resolution = Some(resolution.clone());
        self.history.push_back(conflict);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        Ok(resolution)
    }

    /// Resolution recorded for a conflict.
    pub fn resolution(&self, id: &str) -> Option<&ConflictResolution> {
        self.history
            .iter()
            .rev()
            .find(|c| c.id == id)
            .and_then(|c| c.resolution.as_ref())
    }

    /// Open or resolved conflict by id.
    pub fn get(&self, id: &str) -> Option<&ConflictRecord> {
        self.open
            .get(id)
            .or_else(|| self.history.iter().rev().find(|c| c.id == id))
    }

    /// Open conflicts ordered by id.
    pub fn open_conflicts(&self) -> Vec<ConflictRecord> {
        self.open.values().cloned().collect()
    }

    /// Open conflict for an entity, if any.
    pub fn open_for(&self, entity_type: &str, entity_id: &str) -> Option<&ConflictRecord> {
        self.open
            .values()
            .find(|c| c.entity_type == entity_type && c.entity_id == entity_id)
    }

    /// Resolved conflicts, oldest first.
    pub fn history(&self) -> Vec<ConflictRecord> {
        self.history.iter().cloned().collect()
    }

    /// Number of open conflicts of one type.
    pub fn open_count(&self, conflict_type: ConflictType) -> usize {
        self.open
            .values()
            .filter(|c| c.conflict_type == conflict_type)
            .count()
    }

    /// Open conflicts followed by resolved history, for persistence.
    pub fn snapshot(&self) -> Vec<ConflictRecord> {
        self.open
            .values()
            .chain(self.history.iter())
            .cloned()
            .collect()
    }

    /// Replace tracked conflicts with persisted ones.
    pub fn restore(&mut self, conflicts: Vec<ConflictRecord>) {
        self.open.clear();
        self.history.clear();
        for conflict in conflicts {
            if conflict.is_resolved() {
                self.history.push_back(conflict);
            } else {
                self.open.insert(conflict.id.clone(), conflict);
            }
        }
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::VersionSnapshot;
    use crate::{EntitySchema, FieldDef, FieldType};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(1).with_entity(EntitySchema::new(
            "card",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("points", FieldType::Int),
            ],
        ))
    }

    fn concurrent(id: &str) -> ConflictRecord {
        let mut record = ConflictRecord::new(
            "card",
            "c1",
            ConflictType::ConcurrentModification,
            VersionSnapshot::new(json!({"title": "Local", "points": 1}), 2, 200),
            VersionSnapshot::new(json!({"title": "Base", "points": 5}), 3, 300),
            400,
        )
        .with_base(VersionSnapshot::new(json!({"title": "Base", "points": 1}), 1, 100));
        record.id = id.into();
        record
    }

    #[test]
    fn merge_strategy_combines_fields() {
        let mut resolver = ConflictResolver::new(ResolutionStrategy::Merge);
        let resolutions = resolver.resolve(vec![concurrent("k1")], &schema(), 500);

        assert_eq!(resolutions.len(), 1);
        let r = &resolutions[0];
        assert_eq!(r.strategy, ResolutionStrategy::Merge);
        assert_eq!(r.resolved, Some(json!({"title": "Local", "points": 5})));
        assert_eq!(r.resolved_by, "merge");
        assert!(!r.explanation.is_empty());
        assert!(resolver.open_conflicts().is_empty());
        assert_eq!(resolver.history().len(), 1);
    }

    #[test]
    fn per_entity_strategy_lookup() {
        let resolver = ConflictResolver::new(ResolutionStrategy::AcceptRemote)
            .with_strategy("card", ResolutionStrategy::AcceptLocal);
        assert_eq!(resolver.strategy_for("card"), ResolutionStrategy::AcceptLocal);
        assert_eq!(resolver.strategy_for("folder"), ResolutionStrategy::AcceptRemote);
    }

    #[test]
    fn scalar_policy_override_per_entity() {
        let mut resolver = ConflictResolver::new(ResolutionStrategy::Merge)
            .with_scalar_policy("card", ScalarPolicy::RemoteWins);
        let mut conflict = concurrent("k1");
        conflict.remote.data = json!({"title": "Remote", "points": 5});

        let resolutions = resolver.resolve(vec![conflict], &schema(), 500);
        assert_eq!(
            resolutions[0].resolved,
            Some(json!({"title": "Remote", "points": 5}))
        );
    }

    #[test]
    fn manual_strategy_leaves_conflict_open() {
        let mut resolver = ConflictResolver::new(ResolutionStrategy::Manual);
        let resolutions = resolver.resolve(vec![concurrent("k1")], &schema(), 500);

        assert!(resolutions.is_empty());
        let open = resolver.open_conflicts();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].local.data["title"], "Local");
        assert_eq!(open[0].remote.data["title"], "Base");

        let r = resolver
            .resolve_with_value("k1", json!({"title": "Chosen"}), &schema(), 600)
            .unwrap();
        assert_eq!(r.resolved_by, "user");
        assert_eq!(r.strategy, ResolutionStrategy::Manual);
        assert!(resolver.open_conflicts().is_empty());
    }

    #[test]
    fn invalid_merge_stays_open() {
        let mut resolver = ConflictResolver::new(ResolutionStrategy::Merge);
        let mut conflict = concurrent("k1");
        conflict.base = Some(VersionSnapshot::new(json!({"title": "Base"}), 1, 100));
        conflict.local.data = json!({"title": "Base", "points": "many"});
        conflict.remote.data = json!({"title": "Base"});

        let resolutions = resolver.resolve(vec![conflict], &schema(), 500);
        assert!(resolutions.is_empty());
        assert_eq!(resolver.open_conflicts().len(), 1);

        assert!(matches!(
            resolver.resolve_with_strategy("k1", ResolutionStrategy::Merge, &schema(), 500),
            Err(Error::SchemaViolation(_))
        ));
    }

    #[test]
    fn delete_update_merge_keeps_surviving_side() {
        let mut resolver = ConflictResolver::new(ResolutionStrategy::Merge);
        let mut conflict = ConflictRecord::new(
            "card",
            "c1",
            ConflictType::DeleteUpdate,
            VersionSnapshot::new(json!({"title": "Edited"}), 2, 200),
            VersionSnapshot::tombstone(3, 300),
            400,
        );
        conflict.id = "k1".into();

        let resolutions = resolver.resolve(vec![conflict], &schema(), 500);
        assert_eq!(resolutions[0].resolved, Some(json!({"title": "Edited"})));
        assert!(!resolutions[0].deleted);
    }

    #[test]
    fn accept_remote_tombstone_deletes() {
        let mut resolver = ConflictResolver::new(ResolutionStrategy::AcceptRemote);
        let mut conflict = ConflictRecord::new(
            "card",
            "c1",
            ConflictType::DeleteUpdate,
            VersionSnapshot::new(json!({"title": "Edited"}), 2, 200),
            VersionSnapshot::tombstone(3, 300),
            400,
        );
        conflict.id = "k1".into();

        let resolutions = resolver.resolve(vec![conflict], &schema(), 500);
        assert!(resolutions[0].deleted);
        assert_eq!(resolutions[0].resolved, None);
    }

    #[test]
    fn resolving_twice_returns_prior_resolution() {
        let mut resolver = ConflictResolver::new(ResolutionStrategy::Manual);
        resolver.register(concurrent("k1"));

        let first = resolver
            .resolve_with_strategy("k1", ResolutionStrategy::AcceptLocal, &schema(), 500)
            .unwrap();
        let second = resolver
            .resolve_with_strategy("k1", ResolutionStrategy::AcceptRemote, &schema(), 900)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(resolver.history().len(), 1);
    }

    #[test]
    fn unknown_conflict() {
        let mut resolver = ConflictResolver::default();
        assert!(matches!(
            resolver.resolve_with_strategy("nope", ResolutionStrategy::Merge, &schema(), 0),
            Err(Error::ConflictNotFound(_))
        ));
    }

    #[test]
    fn snapshot_restore_keeps_open_and_resolved() {
        let mut resolver = ConflictResolver::new(ResolutionStrategy::Manual);
        resolver.register(concurrent("k1"));
        resolver.register(concurrent("k2"));
        resolver
            .resolve_with_strategy("k1", ResolutionStrategy::AcceptRemote, &schema(), 500)
            .unwrap();

        let mut restored = ConflictResolver::new(ResolutionStrategy::Manual);
        restored.restore(resolver.snapshot());
        assert_eq!(restored.open_conflicts().len(), 1);
        assert!(restored.resolution("k1").is_some());
        assert!(restored.get("k2").is_some());
    }
}
