//! Entity store: tenant-partitioned tables of records with lifecycle metadata

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::StorageError;
use crate::record::{StoredRecord, SyncStatus};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryEntityStore;
pub use sqlite::SqliteEntityStore;

/// Row selection for [`EntityStore::query`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Include soft-deleted rows (audit and sync paths only)
    pub include_deleted: bool,
    /// Restrict to one sync status
    pub status: Option<SyncStatus>,
}

impl RecordFilter {
    pub fn live() -> Self {
        Self::default()
    }

    pub fn with_deleted() -> Self {
        Self {
            include_deleted: true,
            status: None,
        }
    }

    pub fn status(mut self, status: SyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        (self.include_deleted || !record.is_deleted())
            && self.status.map_or(true, |s| record.sync_status == s)
    }
}

/// Outcome of a best-effort batch write
#[derive(Debug, Default)]
pub struct BulkPutReport {
    pub written: Vec<String>,
    pub failed: Vec<(String, StorageError)>,
}

impl BulkPutReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_ids(&self) -> Vec<&str> {
        self.failed.iter().map(|(id, _)| id.as_str()).collect()
    }
}

/// Keep the last occurrence of every id, in first-seen position order
pub(crate) fn dedup_last_wins(records: Vec<StoredRecord>) -> Vec<StoredRecord> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<StoredRecord> = Vec::with_capacity(records.len());
    for record in records {
        match index.get(&record.id) {
            Some(&pos) => out[pos] = record,
            None => {
                index.insert(record.id.clone(), out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Trait for entity store backends
///
/// Rows are keyed by `(tenant_id, entity_type, id)`; each entity type is a
/// separate logical table.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(
        &self,
        tenant_id: &str,
        entity_type: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StorageError>;

    async fn query(
        &self,
        tenant_id: &str,
        entity_type: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StorageError>;

    /// Upsert by `(tenant_id, id)`, replacing payload and metadata together
    async fn put(&self, entity_type: &str, record: StoredRecord) -> Result<(), StorageError>;

    /// Best-effort batch upsert; duplicate ids keep the last occurrence
    async fn bulk_put(
        &self,
        entity_type: &str,
        records: Vec<StoredRecord>,
    ) -> Result<BulkPutReport, StorageError> {
        let mut report = BulkPutReport::default();
        for record in dedup_last_wins(records) {
            let id = record.id.clone();
            match self.put(entity_type, record).await {
                Ok(()) => report.written.push(id),
                Err(e) => report.failed.push((id, e)),
            }
        }
        Ok(report)
    }

    /// Set `deleted_at`; the row stays visible to audit and sync paths.
    /// Returns false if the row does not exist.
    async fn soft_delete(
        &self,
        tenant_id: &str,
        entity_type: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Physically remove a row
    async fn remove(&self, tenant_id: &str, entity_type: &str, id: &str)
        -> Result<bool, StorageError>;

    /// Get storage backend name
    fn name(&self) -> &'static str;
}
