//! Three-way merge of JSON records.
//!
//! Each field is compared against the common base: a field changed on only one
//! side takes that side's value. Fields changed on both sides are merged by
//! shape. Objects recurse, lists keep the remote list plus items added
//! locally, and scalars are settled by a [`ScalarPolicy`]. Without a base the
//! merge degrades to a field-level union.

use super::VersionSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which side wins when both changed the same scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalarPolicy {
    #[default]
    LocalWins,
    RemoteWins,
    /// Later snapshot timestamp wins; ties go to local
    NewestWins,
}

/// Strategy for combining two versions of a record.
pub trait MergePolicy: Send + Sync + std::fmt::Debug {
    /// Merge `local` and `remote` relative to `base`.
    fn merge(
        &self,
        base: Option<&VersionSnapshot>,
        local: &VersionSnapshot,
        remote: &VersionSnapshot,
    ) -> Value;
}

/// Field-level three-way merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreeWayMerge {
    pub scalar: ScalarPolicy,
}

impl ThreeWayMerge {
    pub fn new(scalar: ScalarPolicy) -> Self {
        Self { scalar }
    }

    fn local_wins(&self, local: &VersionSnapshot, remote: &VersionSnapshot) -> bool {
        match self.scalar {
            ScalarPolicy::LocalWins => true,
            ScalarPolicy::RemoteWins => false,
            ScalarPolicy::NewestWins => local.timestamp >= remote.timestamp,
        }
    }

    fn merge_field(
        &self,
        base: Option<&Value>,
        local: Option<&Value>,
        remote: Option<&Value>,
        local_wins: bool,
    ) -> Option<Value> {
        if local == remote {
            return local.cloned();
        }
        if base == local {
            return remote.cloned();
        }
        if base == remote {
            return local.cloned();
        }

        match (local, remote) {
            (Some(Value::Object(l)), Some(Value::Object(r))) => {
                let base = base.and_then(Value::as_object);
                Some(Value::Object(self.merge_objects(base, l, r, local_wins)))
            }
            (Some(Value::Array(l)), Some(Value::Array(r))) => {
                let base = base.and_then(Value::as_array);
                Some(Value::Array(append_wins(base, l, r)))
            }
            _ if local_wins => local.cloned(),
            _ => remote.cloned(),
        }
    }

    fn merge_objects(
        &self,
        base: Option<&Map<String, Value>>,
        local: &Map<String, Value>,
        remote: &Map<String, Value>,
        local_wins: bool,
    ) -> Map<String, Value> {
        let mut keys: Vec<&String> = local.keys().chain(remote.keys()).collect();
        if let Some(base) = base {
            keys.extend(base.keys());
        }
        keys.sort();
        keys.dedup();

        let mut merged = Map::new();
        for key in keys {
            let value = self.merge_field(
                base.and_then(|b| b.get(key)),
                local.get(key),
                remote.get(key),
                local_wins,
            );
            if let Some(value) = value {
                merged.insert(key.clone(), value);
            }
        }
        merged
    }
}

impl MergePolicy for ThreeWayMerge {
    fn merge(
        &self,
        base: Option<&VersionSnapshot>,
        local: &VersionSnapshot,
        remote: &VersionSnapshot,
    ) -> Value {
        let local_wins = self.local_wins(local, remote);
        let base = base.filter(|b| !b.deleted).map(|b| &b.data);
        self.merge_field(base, Some(&local.data), Some(&remote.data), local_wins)
            .unwrap_or(Value::Null)
    }
}

/// Remote list followed by items only the local side added.
fn append_wins(base: Option<&Vec<Value>>, local: &[Value], remote: &[Value]) -> Vec<Value> {
    let mut merged = remote.to_vec();
    for item in local {
        let in_base = base.is_some_and(|b| b.contains(item));
        if !in_base && !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    merged
}
