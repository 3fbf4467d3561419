// File: galley-sync/src/record.rs
// Purpose: Canonical entity record, lifecycle metadata and the Syncable trait

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::StorageError;

/// Synchronization state of a local record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Written locally, not yet confirmed by the remote store
    Pending,
    /// Confirmed by the remote store
    Synced,
    /// A queued mutation exhausted its retries; needs manual resolution
    Conflict,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Pending => write!(f, "pending"),
            SyncStatus::Synced => write!(f, "synced"),
            SyncStatus::Conflict => write!(f, "conflict"),
        }
    }
}

impl FromStr for SyncStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "conflict" => Ok(SyncStatus::Conflict),
            other => Err(StorageError::Corrupt(format!("unknown sync status '{other}'"))),
        }
    }
}

/// Trait for payload types managed by the sync engine
///
/// The engine treats payloads as opaque apart from the entity type (the
/// logical table they live in) and the ordered name candidates used to derive
/// a natural key.
pub trait Syncable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Logical table name, e.g. `"ingredients"`
    fn entity_type() -> &'static str;

    /// Name candidates in priority order: canonical name first, then legacy
    /// name fields. The first non-empty one becomes the natural key.
    fn name_fields(&self) -> Vec<Option<&str>>;
}

/// A tenant-scoped record with lifecycle metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord<T> {
    pub id: String,
    pub tenant_id: String,
    pub payload: T,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub last_synced: Option<DateTime<Utc>>,
}

/// Type-erased record as held by the entity store
pub type StoredRecord = EntityRecord<serde_json::Value>;

impl<T> EntityRecord<T> {
    /// Create a record that has only been written locally
    pub fn new(
        id: impl Into<String>,
        tenant_id: impl Into<String>,
        payload: T,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            payload,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            sync_status: SyncStatus::Pending,
            last_synced: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Tag as confirmed by the remote store
    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Synced;
        self.last_synced = Some(now);
    }

    /// Tag as a local write awaiting confirmation
    pub fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.sync_status = SyncStatus::Pending;
        self.updated_at = now;
    }

    pub fn map_payload<U>(self, f: impl FnOnce(T) -> U) -> EntityRecord<U> {
        EntityRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            payload: f(self.payload),
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            sync_status: self.sync_status,
            last_synced: self.last_synced,
        }
    }

    pub fn try_map_payload<U, E>(
        self,
        f: impl FnOnce(T) -> Result<U, E>,
    ) -> Result<EntityRecord<U>, E> {
        let payload = f(self.payload)?;
        Ok(EntityRecord {
            id: self.id,
            tenant_id: self.tenant_id,
            payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            sync_status: self.sync_status,
            last_synced: self.last_synced,
        })
    }
}

impl<T: Serialize> EntityRecord<T> {
    /// Erase the payload type for storage
    pub fn to_stored(&self) -> Result<StoredRecord, serde_json::Error> {
        let payload = serde_json::to_value(&self.payload)?;
        Ok(EntityRecord {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
            sync_status: self.sync_status,
            last_synced: self.last_synced,
        })
    }
}

impl<T: Syncable> EntityRecord<T> {
    /// Lower-cased, trimmed first non-empty name candidate
    pub fn natural_key(&self) -> Option<String> {
        natural_key_of(&self.payload)
    }
}

impl StoredRecord {
    /// Decode the payload into its domain type
    pub fn decode<T: DeserializeOwned>(self) -> Result<EntityRecord<T>, serde_json::Error> {
        self.try_map_payload(serde_json::from_value)
    }
}

pub(crate) fn natural_key_of<T: Syncable>(payload: &T) -> Option<String> {
    payload
        .name_fields()
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .map(str::to_lowercase)
}
