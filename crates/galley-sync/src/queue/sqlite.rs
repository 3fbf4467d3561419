//! Durable change queue backed by SQLite (sqlx)

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::db::LocalDb;
use crate::error::StorageError;
use crate::queue::{ChangeQueueEntry, EntryState, Operation, QueueStore};

const ENTRY_COLUMNS: &str = "seq, tenant_id, entity_type, entity_id, operation, payload_snapshot, \
     idempotency_key, enqueued_at, attempt_count, next_attempt_at, state, last_error";

/// SQLite queue store; entries survive process restarts
#[derive(Clone)]
pub struct SqliteQueueStore {
    db: LocalDb,
}

impl SqliteQueueStore {
    /// Create the store, initializing its table if needed
    pub async fn new(db: LocalDb) -> Result<Self, StorageError> {
        Self::init_table(&db).await?;
        Ok(Self { db })
    }

    async fn init_table(db: &LocalDb) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _galley_change_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload_snapshot TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                enqueued_at TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at TEXT,
                state TEXT NOT NULL,
                last_error TEXT
            )
            "#,
        )
        .execute(db.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_galley_queue_entity
            ON _galley_change_queue(tenant_id, entity_type, entity_id)
            "#,
        )
        .execute(db.pool())
        .await?;

        Ok(())
    }

    fn row_to_entry(row: &SqliteRow) -> Result<ChangeQueueEntry, StorageError> {
        let operation: String = row.try_get("operation")?;
        let state: String = row.try_get("state")?;
        let payload: String = row.try_get("payload_snapshot")?;
        let attempts: i64 = row.try_get("attempt_count")?;

        Ok(ChangeQueueEntry {
            seq: row.try_get("seq")?,
            tenant_id: row.try_get("tenant_id")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            operation: operation.parse::<Operation>()?,
            payload_snapshot: serde_json::from_str(&payload)?,
            idempotency_key: row.try_get("idempotency_key")?,
            enqueued_at: row.try_get("enqueued_at")?,
            attempt_count: u32::try_from(attempts)
                .map_err(|_| StorageError::Corrupt(format!("attempt_count {attempts}")))?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            state: state.parse::<EntryState>()?,
            last_error: row.try_get("last_error")?,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn append(&self, mut entry: ChangeQueueEntry) -> Result<ChangeQueueEntry, StorageError> {
        let payload = serde_json::to_string(&entry.payload_snapshot)?;

        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO _galley_change_queue
                (tenant_id, entity_type, entity_id, operation, payload_snapshot, idempotency_key,
                 enqueued_at, attempt_count, next_attempt_at, state, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(&entry.tenant_id)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.operation.to_string())
        .bind(payload)
        .bind(&entry.idempotency_key)
        .bind(entry.enqueued_at)
        .bind(i64::from(entry.attempt_count))
        .bind(entry.next_attempt_at)
        .bind(entry.state.to_string())
        .bind(&entry.last_error)
        .fetch_one(self.db.pool())
        .await?;

        entry.seq = seq;
        Ok(entry)
    }

    async fn update(&self, entry: &ChangeQueueEntry) -> Result<(), StorageError> {
        let payload = serde_json::to_string(&entry.payload_snapshot)?;

        sqlx::query(
            r#"
            UPDATE _galley_change_queue
            SET operation = ?, payload_snapshot = ?, attempt_count = ?,
                next_attempt_at = ?, state = ?, last_error = ?
            WHERE seq = ?
            "#,
        )
        .bind(entry.operation.to_string())
        .bind(payload)
        .bind(i64::from(entry.attempt_count))
        .bind(entry.next_attempt_at)
        .bind(entry.state.to_string())
        .bind(&entry.last_error)
        .bind(entry.seq)
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    async fn remove(&self, seq: i64) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM _galley_change_queue WHERE seq = ?")
            .bind(seq)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, seq: i64) -> Result<Option<ChangeQueueEntry>, StorageError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM _galley_change_queue WHERE seq = ?");
        let row = sqlx::query(&sql)
            .bind(seq)
            .fetch_optional(self.db.pool())
            .await?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<ChangeQueueEntry>, StorageError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM _galley_change_queue WHERE tenant_id = ? ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn entries_for(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ChangeQueueEntry>, StorageError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM _galley_change_queue \
             WHERE tenant_id = ? AND entity_type = ? AND entity_id = ? ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(entity_type)
            .bind(entity_id)
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_update_persists_retry_state() {
        let store = SqliteQueueStore::new(LocalDb::in_memory().await.unwrap())
            .await
            .unwrap();
        let now = Utc::now();
        let entry = ChangeQueueEntry::new(
            "tenant-a",
            "ingredients",
            "1",
            Operation::Update,
            json!({"name": "Salt"}),
            now,
        );

        let mut entry = store.append(entry).await.unwrap();
        entry.attempt_count = 3;
        entry.next_attempt_at = Some(now + Duration::seconds(4));
        entry.last_error = Some("network unreachable".into());
        store.update(&entry).await.unwrap();

        let fetched = store.get(entry.seq).await.unwrap().unwrap();
        assert_eq!(fetched, entry);
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        let now = Utc::now();

        {
            let db = LocalDb::open(&url).await.unwrap();
            let store = SqliteQueueStore::new(db.clone()).await.unwrap();
            for id in ["1", "2"] {
                let entry = ChangeQueueEntry::new(
                    "tenant-a",
                    "ingredients",
                    id,
                    Operation::Create,
                    json!({"name": id}),
                    now,
                );
                store.append(entry).await.unwrap();
            }
            db.close().await;
        }

        let store = SqliteQueueStore::new(LocalDb::open(&url).await.unwrap())
            .await
            .unwrap();
        let entries = store.list("tenant-a").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entity_id, "1");
        assert_eq!(entries[1].payload_snapshot, json!({"name": "2"}));
    }
}
