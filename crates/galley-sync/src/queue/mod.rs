// File: galley-sync/src/queue/mod.rs
// Purpose: Durable, ordered log of mutations awaiting remote confirmation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::StorageError;

pub mod memory;
pub mod service;
pub mod sqlite;

pub use memory::MemoryQueueStore;
pub use service::{ChangeQueue, Enqueued, FlushReport};
pub use sqlite::SqliteQueueStore;

/// Mutation kind carried by a queue entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

impl FromStr for Operation {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(StorageError::Corrupt(format!("unknown operation '{other}'"))),
        }
    }
}

/// Lifecycle state of a queue entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Waiting to be flushed (possibly behind a backoff)
    Pending,
    /// Out of retries or rejected; terminal until cleared by hand
    Conflict,
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryState::Pending => write!(f, "pending"),
            EntryState::Conflict => write!(f, "conflict"),
        }
    }
}

impl FromStr for EntryState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryState::Pending),
            "conflict" => Ok(EntryState::Conflict),
            other => Err(StorageError::Corrupt(format!("unknown queue state '{other}'"))),
        }
    }
}

/// A single mutation in the change queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeQueueEntry {
    /// Monotonic enqueue sequence, assigned by the queue store
    pub seq: i64,
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub payload_snapshot: serde_json::Value,
    /// Sent with every replay so the remote can drop duplicates
    pub idempotency_key: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub state: EntryState,
    pub last_error: Option<String>,
}

impl ChangeQueueEntry {
    /// A fresh entry; `seq` is filled in on append
    pub fn new(
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload_snapshot: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            tenant_id: tenant_id.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation,
            payload_snapshot,
            idempotency_key: Uuid::new_v4().to_string(),
            enqueued_at: now,
            attempt_count: 0,
            next_attempt_at: None,
            state: EntryState::Pending,
            last_error: None,
        }
    }

    /// Pending and past its backoff
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == EntryState::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn is_conflict(&self) -> bool {
        self.state == EntryState::Conflict
    }
}

/// Trait for queue persistence backends
///
/// Entries are always returned in `seq` order.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append an entry, assigning the next `seq`
    async fn append(&self, entry: ChangeQueueEntry) -> Result<ChangeQueueEntry, StorageError>;

    /// Persist the mutable fields of an existing entry
    async fn update(&self, entry: &ChangeQueueEntry) -> Result<(), StorageError>;

    async fn remove(&self, seq: i64) -> Result<bool, StorageError>;

    async fn get(&self, seq: i64) -> Result<Option<ChangeQueueEntry>, StorageError>;

    /// Every entry of a tenant
    async fn list(&self, tenant_id: &str) -> Result<Vec<ChangeQueueEntry>, StorageError>;

    async fn entries_for(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ChangeQueueEntry>, StorageError>;

    /// Get storage backend name
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_operation_round_trips_through_text() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
        }
        assert!("upsert".parse::<Operation>().is_err());
    }

    #[test]
    fn test_entry_is_due_after_backoff() {
        let now = Utc::now();
        let mut entry =
            ChangeQueueEntry::new("t", "ingredients", "1", Operation::Create, json!({}), now);
        assert!(entry.is_due(now));

        entry.next_attempt_at = Some(now + Duration::seconds(5));
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + Duration::seconds(5)));

        entry.state = EntryState::Conflict;
        assert!(!entry.is_due(now + Duration::hours(1)));
    }

    #[test]
    fn test_new_entries_get_distinct_idempotency_keys() {
        let now = Utc::now();
        let a = ChangeQueueEntry::new("t", "ingredients", "1", Operation::Update, json!({}), now);
        let b = ChangeQueueEntry::new("t", "ingredients", "1", Operation::Update, json!({}), now);
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }
}
