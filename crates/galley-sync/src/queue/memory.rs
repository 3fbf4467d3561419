//! In-memory change queue backend

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::queue::{ChangeQueueEntry, QueueStore};

#[derive(Default)]
struct QueueState {
    last_seq: i64,
    entries: BTreeMap<i64, ChangeQueueEntry>,
}

/// In-memory queue store; entries are lost when the process exits
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
    state: Arc<RwLock<QueueState>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn append(&self, mut entry: ChangeQueueEntry) -> Result<ChangeQueueEntry, StorageError> {
        let mut state = self.state.write().await;
        state.last_seq += 1;
        entry.seq = state.last_seq;
        state.entries.insert(entry.seq, entry.clone());
        Ok(entry)
    }

    async fn update(&self, entry: &ChangeQueueEntry) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.entries.get_mut(&entry.seq) {
            *existing = entry.clone();
        }
        Ok(())
    }

    async fn remove(&self, seq: i64) -> Result<bool, StorageError> {
        Ok(self.state.write().await.entries.remove(&seq).is_some())
    }

    async fn get(&self, seq: i64) -> Result<Option<ChangeQueueEntry>, StorageError> {
        Ok(self.state.read().await.entries.get(&seq).cloned())
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<ChangeQueueEntry>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect())
    }

    async fn entries_for(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ChangeQueueEntry>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| {
                e.tenant_id == tenant_id && e.entity_type == entity_type && e.entity_id == entity_id
            })
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
