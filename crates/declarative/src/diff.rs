//! Diff computation between runs

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::types::{Fqn, StateRecord};

/// Key used when the props are not a JSON object
pub const WHOLE_VALUE: &str = "$";

/// Top-level differences between the stored props and the declared ones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropsDiff {
    /// Keys only present in the new props
    pub added: Vec<String>,
    /// Keys only present in the old props
    pub removed: Vec<String>,
    /// Keys present in both with different values
    pub changed: Vec<String>,
}

impl PropsDiff {
    /// Compare two props values
    pub fn between(old: &Value, new: &Value) -> Self {
        let mut diff = Self::default();
        match (old, new) {
            (Value::Object(old), Value::Object(new)) => {
                for (key, value) in new {
                    match old.get(key) {
                        None => diff.added.push(key.clone()),
                        Some(previous) if previous != value => diff.changed.push(key.clone()),
                        Some(_) => {}
                    }
                }
                diff.removed = old
                    .keys()
                    .filter(|key| !new.contains_key(*key))
                    .cloned()
                    .collect();
            }
            _ if old != new => diff.changed.push(WHOLE_VALUE.to_string()),
            _ => {}
        }
        diff
    }

    /// Check if nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Whether any of `keys` was added, removed or changed
    ///
    /// Handlers use this to decide whether an update needs a replacement,
    /// e.g. `diff.touches(&["region", "name"])`.
    pub fn touches(&self, keys: &[&str]) -> bool {
        self.changed.iter().any(|k| k == WHOLE_VALUE)
            || self
                .added
                .iter()
                .chain(&self.removed)
                .chain(&self.changed)
                .any(|k| keys.contains(&k.as_str()))
    }
}

/// FQNs recorded by a previous run that the current run did not declare
///
/// Anything nested under a `failed` FQN is kept: its owner never got to
/// re-declare it, so its absence says nothing.
pub fn compute_orphans(
    prior: &BTreeSet<Fqn>,
    touched: &BTreeSet<Fqn>,
    failed: &BTreeSet<Fqn>,
) -> BTreeSet<Fqn> {
    prior
        .difference(touched)
        .filter(|fqn| !failed.iter().any(|owner| fqn.is_descendant_of(owner)))
        .cloned()
        .collect()
}

/// Group records by resource kind
pub fn group_by_kind(records: &[StateRecord]) -> HashMap<String, Vec<&StateRecord>> {
    let mut groups: HashMap<String, Vec<&StateRecord>> = HashMap::new();
    for record in records {
        groups.entry(record.kind.clone()).or_default().push(record);
    }
    groups
}
