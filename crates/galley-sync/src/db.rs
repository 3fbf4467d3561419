// File: galley-sync/src/db.rs
// Purpose: Local SQLite database handle shared by the entity store and change queue

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::StorageError;

/// Handle to the client-resident SQLite database
///
/// Opened once per session and passed by reference into the stores; there is
/// no process-global handle.
#[derive(Clone, Debug)]
pub struct LocalDb {
    pool: Arc<SqlitePool>,
}

impl LocalDb {
    /// Open (creating if missing) the database at `database_url`
    pub async fn open(database_url: &str) -> Result<Self, StorageError> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to ":memory:" is a separate database
        let max_connections = if in_memory { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        tracing::debug!(database_url, "opened local database");

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Fresh in-memory database
    pub async fn in_memory() -> Result<Self, StorageError> {
        Self::open("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close all connections; called on session teardown
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
