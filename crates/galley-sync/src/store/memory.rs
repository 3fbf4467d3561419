//! In-memory entity store backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::record::{StoredRecord, SyncStatus};
use crate::store::{EntityStore, RecordFilter};

type TableKey = (String, String);

/// In-memory entity store
///
/// Fast but non-persistent: rows are lost when the process exits. An optional
/// row quota makes storage exhaustion observable.
#[derive(Clone, Default)]
pub struct MemoryEntityStore {
    tables: Arc<RwLock<HashMap<TableKey, BTreeMap<String, StoredRecord>>>>,
    quota: Option<usize>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject inserts of new rows once `limit` rows are stored
    pub fn with_quota(limit: usize) -> Self {
        Self {
            tables: Arc::default(),
            quota: Some(limit),
        }
    }

    /// Total rows across all tenants and entity types
    pub async fn size(&self) -> usize {
        self.tables.read().await.values().map(BTreeMap::len).sum()
    }
}

fn table_key(tenant_id: &str, entity_type: &str) -> TableKey {
    (tenant_id.to_string(), entity_type.to_string())
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get(
        &self,
        tenant_id: &str,
        entity_type: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table_key(tenant_id, entity_type))
            .and_then(|table| table.get(id))
            .cloned())
    }

    async fn query(
        &self,
        tenant_id: &str,
        entity_type: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(&table_key(tenant_id, entity_type))
            .map(|table| {
                table
                    .values()
                    .filter(|record| filter.matches(record))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put(&self, entity_type: &str, record: StoredRecord) -> Result<(), StorageError> {
        let mut tables = self.tables.write().await;

        if let Some(limit) = self.quota {
            let exists = tables
                .get(&table_key(&record.tenant_id, entity_type))
                .is_some_and(|table| table.contains_key(&record.id));
            let size: usize = tables.values().map(BTreeMap::len).sum();
            if !exists && size >= limit {
                return Err(StorageError::QuotaExceeded { limit });
            }
        }

        tables
            .entry(table_key(&record.tenant_id, entity_type))
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn soft_delete(
        &self,
        tenant_id: &str,
        entity_type: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        let Some(record) = tables
            .get_mut(&table_key(tenant_id, entity_type))
            .and_then(|table| table.get_mut(id))
        else {
            return Ok(false);
        };

        record.deleted_at = Some(at);
        record.updated_at = at;
        record.sync_status = SyncStatus::Pending;
        Ok(true)
    }

    async fn remove(
        &self,
        tenant_id: &str,
        entity_type: &str,
        id: &str,
    ) -> Result<bool, StorageError> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .get_mut(&table_key(tenant_id, entity_type))
            .and_then(|table| table.remove(id))
            .is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::EntityRecord;
    use serde_json::json;

    fn record(id: &str, tenant: &str) -> StoredRecord {
        EntityRecord::new(id, tenant, json!({"name": id}), Utc::now())
    }

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryEntityStore::new();

        store.put("ingredients", record("1", "tenant-a")).await.unwrap();

        let fetched = store.get("tenant-a", "ingredients", "1").await.unwrap();
        assert_eq!(fetched.unwrap().payload, json!({"name": "1"}));

        // Other tenants and entity types are separate partitions
        assert!(store.get("tenant-b", "ingredients", "1").await.unwrap().is_none());
        assert!(store.get("tenant-a", "recipes", "1").await.unwrap().is_none());

        assert!(store.remove("tenant-a", "ingredients", "1").await.unwrap());
        assert!(!store.remove("tenant-a", "ingredients", "1").await.unwrap());
        assert_eq!(store.size().await, 0);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_row_from_live_queries() {
        let store = MemoryEntityStore::new();
        store.put("ingredients", record("1", "tenant-a")).await.unwrap();
        store.put("ingredients", record("2", "tenant-a")).await.unwrap();

        let at = Utc::now();
        assert!(store.soft_delete("tenant-a", "ingredients", "1", at).await.unwrap());
        assert!(!store.soft_delete("tenant-a", "ingredients", "missing", at).await.unwrap());

        let live = store
            .query("tenant-a", "ingredients", &RecordFilter::live())
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "2");

        let audit = store
            .query("tenant-a", "ingredients", &RecordFilter::with_deleted())
            .await
            .unwrap();
        assert_eq!(audit.len(), 2);
        assert_eq!(audit[0].deleted_at, Some(at));
        assert_eq!(audit[0].sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn test_bulk_put_reports_quota_failures() {
        let store = MemoryEntityStore::with_quota(2);

        let report = store
            .bulk_put(
                "ingredients",
                vec![
                    record("1", "tenant-a"),
                    record("2", "tenant-a"),
                    record("3", "tenant-a"),
                    record("1", "tenant-a"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.written, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(report.failed_ids(), vec!["3"]);
        assert!(matches!(
            report.failed[0].1,
            StorageError::QuotaExceeded { limit: 2 }
        ));
    }
}
