// File: galley-sync/src/merge.rs
// Purpose: Reconciliation of remote listings with the local entity set
//
// Pure functions only: no I/O, fully testable. The repository feeds in the
// remote listing and current local rows and applies the resulting write-back.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::record::{EntityRecord, SyncStatus, Syncable};

/// Which grouping produced the merged set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePath {
    ById,
    ByNaturalKey,
}

/// Insertion-ordered map from key to record
struct OrderedRecords<T> {
    index: HashMap<String, usize>,
    records: Vec<EntityRecord<T>>,
}

impl<T> OrderedRecords<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashMap::with_capacity(capacity),
            records: Vec::with_capacity(capacity),
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    /// Insert or overwrite in place
    fn insert(&mut self, key: String, record: EntityRecord<T>) {
        match self.index.get(&key) {
            Some(&pos) => self.records[pos] = record,
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Keep the record with the greater `updated_at`; ties keep the existing one
    fn insert_if_newer(&mut self, key: String, record: EntityRecord<T>) {
        match self.index.get(&key) {
            Some(&pos) => {
                if record.updated_at > self.records[pos].updated_at {
                    self.records[pos] = record;
                }
            }
            None => {
                self.index.insert(key, self.records.len());
                self.records.push(record);
            }
        }
    }
}

/// Deduplicate a listing
///
/// `byId` keeps the last record per id. `byNaturalKey` keeps, per normalized
/// name, the record with the greatest `updated_at` (first seen on ties);
/// unnamed records never enter it. The natural-key grouping is used only when
/// it is strictly smaller than the id grouping.
pub fn merge_records<T: Syncable>(records: Vec<EntityRecord<T>>) -> (Vec<EntityRecord<T>>, MergePath) {
    let mut by_id = OrderedRecords::with_capacity(records.len());
    let mut by_natural_key = OrderedRecords::with_capacity(records.len());

    for record in records {
        if let Some(key) = record.natural_key() {
            by_natural_key.insert_if_newer(key, record.clone());
        }
        by_id.insert(record.id.clone(), record);
    }

    if by_natural_key.len() < by_id.len() {
        (by_natural_key.records, MergePath::ByNaturalKey)
    } else {
        (by_id.records, MergePath::ById)
    }
}

/// How much of the entity table a remote listing covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingScope {
    /// Unfiltered listing: the remote set is the whole table
    Full,
    /// Filtered listing: rows absent from it may still exist remotely
    Partial,
}

/// Result of reconciling a remote listing with the local table
#[derive(Debug, Clone)]
pub struct MergeOutcome<T> {
    /// Records to show the caller
    pub merged: Vec<EntityRecord<T>>,
    /// Remote-confirmed rows to upsert as `Synced`
    pub write_back: Vec<EntityRecord<T>>,
    /// Local `Synced` rows to physically remove
    pub evict: Vec<String>,
    pub path: MergePath,
}

/// Reconcile a remote listing with the local rows of the same table
///
/// Local rows that are not yet synced replace the remote copy with the same
/// id, and a pending local delete hides it. Remote tombstones are dropped.
/// Rows with unsynced local state are never written back.
pub fn reconcile<T: Syncable>(
    remote: Vec<EntityRecord<T>>,
    local: Vec<EntityRecord<T>>,
    scope: ListingScope,
    now: DateTime<Utc>,
) -> MergeOutcome<T> {
    let remote_ids: HashSet<String> = remote.iter().map(|r| r.id.clone()).collect();

    // Ids with local state the remote has not confirmed yet
    let mut unsynced = HashSet::new();
    let mut overlay = Vec::new();
    let mut local_synced = Vec::new();

    for record in local {
        if record.sync_status == SyncStatus::Synced {
            local_synced.push(record.id);
            continue;
        }
        unsynced.insert(record.id.clone());
        if !record.is_deleted()
            && (scope == ListingScope::Full || remote_ids.contains(&record.id))
        {
            overlay.push(record);
        }
    }

    let candidates: Vec<EntityRecord<T>> = remote
        .into_iter()
        .filter(|r| !r.is_deleted() && !unsynced.contains(&r.id))
        .chain(overlay)
        .collect();

    let (merged, path) = merge_records(candidates);

    let write_back = merged
        .iter()
        .filter(|r| r.sync_status == SyncStatus::Synced && !unsynced.contains(&r.id))
        .cloned()
        .map(|mut r| {
            r.mark_synced(now);
            r
        })
        .collect();

    let evict = match scope {
        ListingScope::Full => {
            let merged_ids: HashSet<&str> = merged.iter().map(|r| r.id.as_str()).collect();
            local_synced
                .into_iter()
                .filter(|id| !merged_ids.contains(id.as_str()))
                .collect()
        }
        ListingScope::Partial => Vec::new(),
    };

    MergeOutcome {
        merged,
        write_back,
        evict,
        path,
    }
}
