//! State store abstraction

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use crate::types::{Fqn, Stage, StateRecord};

/// Durable mapping from FQN to the last persisted record
///
/// The engine only writes after a handler returned a valid terminal outcome.
/// Records are stored exactly as given; secrets in them are already sealed.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the record for an FQN
    async fn get(&self, fqn: &Fqn) -> anyhow::Result<Option<StateRecord>>;

    /// Insert or overwrite the record for an FQN
    async fn put(&self, fqn: &Fqn, record: &StateRecord) -> anyhow::Result<()>;

    /// Remove the record for an FQN; removing a missing record is not an error
    async fn delete(&self, fqn: &Fqn) -> anyhow::Result<()>;

    /// Every FQN recorded under a stage
    async fn list_all(&self, stage: &Stage) -> anyhow::Result<BTreeSet<Fqn>>;
}

/// In-memory store for tests and throwaway runs
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<BTreeMap<Fqn, StateRecord>>,
}

impl MemoryStateStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every stored record
    pub fn snapshot(&self) -> BTreeMap<Fqn, StateRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, fqn: &Fqn) -> anyhow::Result<Option<StateRecord>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fqn)
            .cloned())
    }

    async fn put(&self, fqn: &Fqn, record: &StateRecord) -> anyhow::Result<()> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fqn.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, fqn: &Fqn) -> anyhow::Result<()> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(fqn);
        Ok(())
    }

    async fn list_all(&self, stage: &Stage) -> anyhow::Result<BTreeSet<Fqn>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .filter(|fqn| fqn.is_within(stage))
            .cloned()
            .collect())
    }
}
