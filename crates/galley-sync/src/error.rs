// File: galley-sync/src/error.rs
// Purpose: Error taxonomy for the local store, the change queue and remote writes

use thiserror::Error;

/// Local persistence failure.
///
/// Never recovered silently: the local store may hold the only copy of
/// pending data.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("storage quota exceeded ({limit} rows)")]
    QuotaExceeded { limit: usize },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("failed to encode or decode stored row: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the sync engine to its callers
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transient transport failure (offline, timeout, 5xx)
    #[error("network error: {0}")]
    Network(String),

    /// Remote rejected the payload; never queued or retried
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A queued mutation exhausted its retry budget
    #[error("{entity_type}/{entity_id} exceeded {attempts} sync attempts")]
    ConflictExceeded {
        entity_type: String,
        entity_id: String,
        attempts: u32,
    },

    #[error("{entity_type}/{id} not found")]
    NotFound { entity_type: String, id: String },

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether the operation may succeed if retried later
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_transient() {
        assert!(SyncError::Network("timeout".into()).is_transient());
        assert!(!SyncError::Validation("bad name".into()).is_transient());
        assert!(!SyncError::Storage(StorageError::QuotaExceeded { limit: 10 }).is_transient());
    }

    #[test]
    fn test_storage_error_converts_into_sync_error() {
        let err: SyncError = StorageError::Corrupt("bad status".into()).into();
        assert!(matches!(err, SyncError::Storage(StorageError::Corrupt(_))));
        assert_eq!(err.to_string(), "corrupt row: bad status");
    }
}
