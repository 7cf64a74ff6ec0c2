//! In-memory state store

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use surety_core::{
    StateChange, StateMutator, StateProvider, StateRoot, StateVersion, SuretyResult,
};
use tracing::trace;

use crate::store::{StateEntry, StateStore};

/// In-memory state store
pub struct MemoryStateStore {
    data: DashMap<Vec<u8>, Vec<u8>>,
    version: RwLock<StateVersion>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            version: RwLock::new(StateVersion::new(0)),
        }
    }

    pub fn with_data(data: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        let store = Self::new();
        for (key, value) in data {
            store.data.insert(key, value);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStateStore {
    fn clone(&self) -> Self {
        let new_store = Self::new();
        for entry in self.data.iter() {
            new_store.data.insert(entry.key().clone(), entry.value().clone());
        }
        *new_store.version.write() = *self.version.read();
        new_store
    }
}

#[async_trait]
impl StateProvider for MemoryStateStore {
    async fn version(&self) -> StateVersion {
        *self.version.read()
    }

    async fn root(&self) -> StateRoot {
        self.compute_root().await.unwrap_or(surety_core::Hash::ZERO)
    }

    async fn get(&self, key: &[u8]) -> SuretyResult<Option<Vec<u8>>> {
        Ok(self.data.get(key).map(|v| v.value().clone()))
    }

    async fn exists(&self, key: &[u8]) -> SuretyResult<bool> {
        Ok(self.data.contains_key(key))
    }
}

#[async_trait]
impl StateMutator for MemoryStateStore {
    async fn set(&self, key: &[u8], value: &[u8]) -> SuretyResult<()> {
        self.data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &[u8]) -> SuretyResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn apply_batch(&self, changes: Vec<StateChange>) -> SuretyResult<StateVersion> {
        let mut version = self.version.write();
        let count = changes.len();

        for change in changes {
            match change {
                StateChange::Set { key, value } => {
                    self.data.insert(key, value);
                }
                StateChange::Delete { key } => {
                    self.data.remove(&key);
                }
            }
        }

        *version = version.next();
        trace!("Applied batch of {} changes at {}", count, *version);

        Ok(*version)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn all_entries(&self) -> SuretyResult<Vec<StateEntry>> {
        let entries: Vec<StateEntry> = self
            .data
            .iter()
            .map(|entry| StateEntry {
                key: entry.key().clone(),
                value: entry.value().clone(),
            })
            .collect();
        Ok(entries)
    }
}

/// Thread-safe memory store wrapper
pub type SharedMemoryStateStore = Arc<MemoryStateStore>;

/// Create a shared memory state store
pub fn create_memory_store() -> SharedMemoryStateStore {
    Arc::new(MemoryStateStore::new())
}
