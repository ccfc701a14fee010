//! Destroy planner - orders deletions of orphaned resources

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::types::{DestroyStrategy, Fqn, StateRecord};

/// A record scheduled for deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanNode {
    pub fqn: Fqn,
    pub kind: String,
    pub seq: u64,
    pub dependencies: Vec<Fqn>,
}

impl From<&StateRecord> for PlanNode {
    fn from(record: &StateRecord) -> Self {
        Self {
            fqn: record.fqn.clone(),
            kind: record.kind.clone(),
            seq: record.seq,
            dependencies: record.dependencies.clone(),
        }
    }
}

/// Deletion order as layers; every layer runs concurrently
///
/// Hard edges (a failure blocks what comes after):
/// - resources nested under an owner are deleted before the owner
/// - a dependent is deleted before what it depends on
///
/// Soft edges (ordering only): siblings whose owner uses
/// [`DestroyStrategy::Sequential`] are deleted one at a time, newest first.
#[derive(Debug, Clone, Default)]
pub struct DestroyPlan {
    layers: Vec<Vec<Fqn>>,
    cyclic: Vec<Fqn>,
    /// node -> nodes whose deletion must succeed first
    blockers: BTreeMap<Fqn, BTreeSet<Fqn>>,
}

impl DestroyPlan {
    /// Build a plan; `strategy_for` maps an owner FQN to its destroy strategy
    pub fn build<F>(nodes: Vec<PlanNode>, strategy_for: F) -> Self
    where
        F: Fn(&Fqn) -> DestroyStrategy,
    {
        let seqs: BTreeMap<Fqn, u64> = nodes.iter().map(|n| (n.fqn.clone(), n.seq)).collect();

        // before -> after
        let mut edges: BTreeMap<Fqn, BTreeSet<Fqn>> = BTreeMap::new();
        let mut blockers: BTreeMap<Fqn, BTreeSet<Fqn>> = BTreeMap::new();
        let mut hard = |before: &Fqn, after: &Fqn| {
            if before != after {
                edges.entry(before.clone()).or_default().insert(after.clone());
                blockers.entry(after.clone()).or_default().insert(before.clone());
            }
        };

        for node in &nodes {
            let mut ancestor = node.fqn.parent();
            while let Some(owner) = ancestor {
                if seqs.contains_key(&owner) {
                    hard(&node.fqn, &owner);
                }
                ancestor = owner.parent();
            }
            for dependency in &node.dependencies {
                if seqs.contains_key(dependency) {
                    hard(&node.fqn, dependency);
                }
            }
        }

        let mut siblings: BTreeMap<Fqn, Vec<&PlanNode>> = BTreeMap::new();
        for node in &nodes {
            if let Some(owner) = node.fqn.parent() {
                siblings.entry(owner).or_default().push(node);
            }
        }
        for (owner, mut group) in siblings {
            if group.len() < 2 || strategy_for(&owner) == DestroyStrategy::Parallel {
                continue;
            }
            group.sort_by(|a, b| b.seq.cmp(&a.seq).then_with(|| a.fqn.cmp(&b.fqn)));
            for pair in group.windows(2) {
                edges
                    .entry(pair[0].fqn.clone())
                    .or_default()
                    .insert(pair[1].fqn.clone());
            }
        }

        // Kahn's algorithm, one layer per round
        let mut in_degree: BTreeMap<Fqn, usize> = seqs.keys().map(|f| (f.clone(), 0)).collect();
        for after in edges.values().flatten() {
            if let Some(degree) = in_degree.get_mut(after) {
                *degree += 1;
            }
        }

        let mut layers = Vec::new();
        loop {
            let mut layer: Vec<Fqn> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(fqn, _)| fqn.clone())
                .collect();
            if layer.is_empty() {
                break;
            }
            layer.sort_by(|a, b| seqs[b].cmp(&seqs[a]).then_with(|| a.cmp(b)));
            for fqn in &layer {
                in_degree.remove(fqn);
                for after in edges.get(fqn).into_iter().flatten() {
                    if let Some(degree) = in_degree.get_mut(after) {
                        *degree -= 1;
                    }
                }
            }
            layers.push(layer);
        }

        let cyclic: Vec<Fqn> = in_degree.into_keys().collect();
        if !cyclic.is_empty() {
            log::warn!("dependency cycle among {} resource(s)", cyclic.len());
        }

        Self {
            layers,
            cyclic,
            blockers,
        }
    }

    /// Layers in execution order
    pub fn layers(&self) -> &[Vec<Fqn>] {
        &self.layers
    }

    /// Nodes that could not be ordered because of a dependency cycle
    pub fn cyclic(&self) -> &[Fqn] {
        &self.cyclic
    }

    /// Error out if any node is part of (or stuck behind) a cycle
    pub fn ensure_acyclic(&self) -> Result<()> {
        if self.cyclic.is_empty() {
            Ok(())
        } else {
            Err(Error::DependencyCycle(self.cyclic.clone()))
        }
    }

    /// Nodes whose failed deletion must skip `fqn`
    pub fn blockers(&self, fqn: &Fqn) -> impl Iterator<Item = &Fqn> {
        self.blockers.get(fqn).into_iter().flatten()
    }

    /// Total number of scheduled deletions
    pub fn len(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Check if nothing is scheduled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Selects records for a targeted teardown
///
/// Target format: `kind` or `kind.id`. A kind matches exactly or as a
/// prefix, so `aws` selects every `aws::*` resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyTarget {
    kind: Option<String>,
    id: Option<String>,
}

impl DestroyTarget {
    /// Parse a target string like "kind.id"
    pub fn parse(target: &str) -> Self {
        let parts: Vec<&str> = target.split('.').collect();
        match parts.as_slice() {
            [kind] => Self {
                kind: Some((*kind).to_string()),
                id: None,
            },
            [kind, id] => Self {
                kind: Some((*kind).to_string()),
                id: Some((*id).to_string()),
            },
            _ => Self {
                kind: None,
                id: Some(target.to_string()),
            },
        }
    }

    /// Check if a record matches the target
    pub fn matches(&self, kind: &str, id: &str) -> bool {
        if let Some(k) = &self.kind
            && !(kind == k || kind.starts_with(&format!("{k}::")))
        {
            return false;
        }

        if let Some(i) = &self.id
            && id != i
        {
            return false;
        }

        true
    }
}
