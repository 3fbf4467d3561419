//! Durable entity store backed by SQLite (sqlx)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::db::LocalDb;
use crate::error::StorageError;
use crate::record::{EntityRecord, StoredRecord, SyncStatus};
use crate::store::{EntityStore, RecordFilter};

/// SQLite entity store
///
/// All entity types share the `_galley_entities` table; `entity_type` is part
/// of the primary key, so each type behaves as its own logical table.
#[derive(Clone)]
pub struct SqliteEntityStore {
    db: LocalDb,
}

impl SqliteEntityStore {
    /// Create the store, initializing its table if needed
    pub async fn new(db: LocalDb) -> Result<Self, StorageError> {
        Self::init_table(&db).await?;
        Ok(Self { db })
    }

    async fn init_table(db: &LocalDb) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _galley_entities (
                tenant_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                deleted_at TEXT,
                sync_status TEXT NOT NULL,
                last_synced TEXT,
                PRIMARY KEY (tenant_id, entity_type, id)
            )
            "#,
        )
        .execute(db.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_galley_entities_status
            ON _galley_entities(tenant_id, entity_type, sync_status)
            "#,
        )
        .execute(db.pool())
        .await?;

        Ok(())
    }

    fn row_to_record(row: &SqliteRow) -> Result<StoredRecord, StorageError> {
        let payload: String = row.try_get("payload")?;
        let status: String = row.try_get("sync_status")?;

        Ok(EntityRecord {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            payload: serde_json::from_str(&payload)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            deleted_at: row.try_get("deleted_at")?,
            sync_status: status.parse::<SyncStatus>()?,
            last_synced: row.try_get("last_synced")?,
        })
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn get(
        &self,
        tenant_id: &str,
        entity_type: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, payload, created_at, updated_at, deleted_at, sync_status, last_synced
            FROM _galley_entities
            WHERE tenant_id = ? AND entity_type = ? AND id = ?
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn query(
        &self,
        tenant_id: &str,
        entity_type: &str,
        filter: &RecordFilter,
    ) -> Result<Vec<StoredRecord>, StorageError> {
        let status = filter.status.map(|s| s.to_string());

        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, payload, created_at, updated_at, deleted_at, sync_status, last_synced
            FROM _galley_entities
            WHERE tenant_id = ? AND entity_type = ?
              AND (? OR deleted_at IS NULL)
              AND (? IS NULL OR sync_status = ?)
            ORDER BY id ASC
            "#,
        )
        .bind(tenant_id)
        .bind(entity_type)
        .bind(filter.include_deleted)
        .bind(&status)
        .bind(&status)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn put(&self, entity_type: &str, record: StoredRecord) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&record.payload)?;

        sqlx::query(
            r#"
            INSERT INTO _galley_entities
                (tenant_id, entity_type, id, payload, created_at, updated_at, deleted_at, sync_status, last_synced)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (tenant_id, entity_type, id) DO UPDATE SET
                payload = excluded.payload,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at,
                sync_status = excluded.sync_status,
                last_synced = excluded.last_synced
            "#,
        )
        .bind(&record.tenant_id)
        .bind(entity_type)
        .bind(&record.id)
        .bind(payload)
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.deleted_at)
        .bind(record.sync_status.to_string())
        .bind(record.last_synced)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn soft_delete(
        &self,
        tenant_id: &str,
        entity_type: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE _galley_entities
            SET deleted_at = ?, updated_at = ?, sync_status = ?
            WHERE tenant_id = ? AND entity_type = ? AND id = ?
            "#,
        )
        .bind(at)
        .bind(at)
        .bind(SyncStatus::Pending.to_string())
        .bind(tenant_id)
        .bind(entity_type)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(
        &self,
        tenant_id: &str,
        entity_type: &str,
        id: &str,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "DELETE FROM _galley_entities WHERE tenant_id = ? AND entity_type = ? AND id = ?",
        )
        .bind(tenant_id)
        .bind(entity_type)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store() -> SqliteEntityStore {
        SqliteEntityStore::new(LocalDb::in_memory().await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_preserves_metadata() {
        let store = store().await;
        let now = Utc::now();
        let mut record = EntityRecord::new("1", "tenant-a", json!({"name": "Salt", "stock": 4}), now);
        record.mark_synced(now);

        store.put("ingredients", record.clone()).await.unwrap();

        let fetched = store.get("tenant-a", "ingredients", "1").await.unwrap().unwrap();
        assert_eq!(fetched.payload, record.payload);
        assert_eq!(fetched.sync_status, SyncStatus::Synced);
        assert_eq!(fetched.last_synced, Some(now));
        assert_eq!(fetched.updated_at, now);
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_row() {
        let store = store().await;
        let now = Utc::now();
        store
            .put("ingredients", EntityRecord::new("1", "tenant-a", json!({"stock": 1}), now))
            .await
            .unwrap();
        store
            .put("ingredients", EntityRecord::new("1", "tenant-a", json!({"stock": 9}), now))
            .await
            .unwrap();

        let rows = store
            .query("tenant-a", "ingredients", &RecordFilter::live())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, json!({"stock": 9}));
    }

    #[tokio::test]
    async fn test_query_filters_by_status_and_deletion() {
        let store = store().await;
        let now = Utc::now();

        let mut synced = EntityRecord::new("1", "tenant-a", json!({}), now);
        synced.mark_synced(now);
        store.put("recipes", synced).await.unwrap();
        store
            .put("recipes", EntityRecord::new("2", "tenant-a", json!({}), now))
            .await
            .unwrap();
        store
            .put("recipes", EntityRecord::new("3", "tenant-a", json!({}), now))
            .await
            .unwrap();
        store.soft_delete("tenant-a", "recipes", "3", now).await.unwrap();

        let pending = store
            .query("tenant-a", "recipes", &RecordFilter::live().status(SyncStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "2");

        let all = store
            .query("tenant-a", "recipes", &RecordFilter::with_deleted())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[2].is_deleted());
    }
}
