// File: galley-sync/src/queue/service.rs
// Purpose: Enqueue-time coalescing and flushing of queued mutations to the remote

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::QueueConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::normalize::normalize_stored;
use crate::queue::{ChangeQueueEntry, EntryState, Operation, QueueStore};
use crate::record::SyncStatus;
use crate::remote::{Mutation, RemoteApi, RemoteError};
use crate::store::EntityStore;

/// What `enqueue` did with a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Appended as a new entry
    Appended(i64),
    /// Folded into an existing pending entry
    Coalesced(i64),
    /// Delete of an entity that never reached the remote: its entries were
    /// dropped and the local row should be removed
    Cancelled,
}

/// Outcome of one flush pass
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Entries confirmed by the remote and removed
    pub flushed: usize,
    /// Entries that failed transiently and were rescheduled
    pub retried: usize,
    /// Pending entries not attempted (backoff, blocked, or behind a failure)
    pub skipped: usize,
    /// One `ConflictExceeded` per entry moved to conflict during this pass
    pub conflicts: Vec<SyncError>,
    /// Another flush was in progress; nothing was attempted
    pub already_running: bool,
}

impl FlushReport {
    fn absorb(&mut self, other: FlushReport) {
        self.flushed += other.flushed;
        self.retried += other.retried;
        self.skipped += other.skipped;
        self.conflicts.extend(other.conflicts);
    }

    /// Nothing failed or was left behind
    pub fn is_clean(&self) -> bool {
        !self.already_running && self.retried == 0 && self.skipped == 0 && self.conflicts.is_empty()
    }
}

/// The change queue: durable log plus the flush algorithm
pub struct ChangeQueue {
    store: Arc<dyn QueueStore>,
    config: QueueConfig,
    bus: EventBus,
    flush_lock: Mutex<()>,
    // Entries currently being sent; never coalesced into. Also serializes
    // enqueue so coalescing reads and writes do not interleave.
    in_flight: Mutex<HashSet<i64>>,
}

impl ChangeQueue {
    pub fn new(store: Arc<dyn QueueStore>, config: QueueConfig, bus: EventBus) -> Self {
        Self {
            store,
            config,
            bus,
            flush_lock: Mutex::new(()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.store.name()
    }

    /// Record a mutation that could not be confirmed remotely
    ///
    /// Keeps at most one pending entry per operation type per entity:
    /// a repeated create or update replaces the earlier snapshot, an update
    /// folds into a pending create, and a delete cancels a pending create
    /// outright or supersedes pending updates.
    pub async fn enqueue(
        &self,
        tenant_id: &str,
        entity_type: &str,
        operation: Operation,
        entity_id: &str,
        payload_snapshot: Value,
    ) -> Result<Enqueued> {
        let in_flight = self.in_flight.lock().await;

        // Conflict entries count as outstanding: a later edit folds into them
        // and they stay held until cleared
        let outstanding: Vec<ChangeQueueEntry> = self
            .store
            .entries_for(tenant_id, entity_type, entity_id)
            .await?
            .into_iter()
            .filter(|e| !in_flight.contains(&e.seq))
            .collect();
        let find = |op: Operation| outstanding.iter().find(|e| e.operation == op).cloned();

        let outcome = match (operation, find(Operation::Create)) {
            (Operation::Create, Some(mut create)) => {
                create.payload_snapshot = payload_snapshot;
                self.store.update(&create).await?;
                Enqueued::Coalesced(create.seq)
            }
            (Operation::Update, Some(mut create)) => {
                create.payload_snapshot = fold(create.payload_snapshot, payload_snapshot);
                self.store.update(&create).await?;
                Enqueued::Coalesced(create.seq)
            }
            (Operation::Delete, Some(_)) => {
                for entry in &outstanding {
                    self.store.remove(entry.seq).await?;
                }
                Enqueued::Cancelled
            }
            (Operation::Update, None) => match find(Operation::Update) {
                Some(mut update) => {
                    update.payload_snapshot = payload_snapshot;
                    self.store.update(&update).await?;
                    Enqueued::Coalesced(update.seq)
                }
                None => self.append(tenant_id, entity_type, operation, entity_id, payload_snapshot).await?,
            },
            (Operation::Delete, None) => match find(Operation::Delete) {
                Some(delete) => Enqueued::Coalesced(delete.seq),
                None => {
                    for entry in outstanding.iter().filter(|e| e.operation == Operation::Update) {
                        self.store.remove(entry.seq).await?;
                    }
                    self.append(tenant_id, entity_type, operation, entity_id, payload_snapshot)
                        .await?
                }
            },
            (Operation::Create, None) => {
                self.append(tenant_id, entity_type, operation, entity_id, payload_snapshot).await?
            }
        };

        tracing::info!(
            tenant_id,
            entity_type,
            entity_id,
            %operation,
            ?outcome,
            "enqueued mutation"
        );
        Ok(outcome)
    }

    async fn append(
        &self,
        tenant_id: &str,
        entity_type: &str,
        operation: Operation,
        entity_id: &str,
        payload_snapshot: Value,
    ) -> Result<Enqueued> {
        let entry = ChangeQueueEntry::new(
            tenant_id,
            entity_type,
            entity_id,
            operation,
            payload_snapshot,
            Utc::now(),
        );
        let entry = self.store.append(entry).await?;
        Ok(Enqueued::Appended(entry.seq))
    }

    /// Drain due entries of one tenant against the remote
    ///
    /// Entries are grouped per entity and each group runs strictly in `seq`
    /// order; groups run concurrently up to `flush_concurrency`. A second
    /// caller while a flush is running gets a report flagged
    /// `already_running`.
    pub async fn flush(
        &self,
        remote: &dyn RemoteApi,
        store: &dyn EntityStore,
        tenant_id: &str,
    ) -> Result<FlushReport> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            tracing::debug!(tenant_id, "flush already running");
            return Ok(FlushReport {
                already_running: true,
                ..FlushReport::default()
            });
        };

        let now = Utc::now();
        let mut report = FlushReport::default();
        let mut runnable = Vec::new();

        for group in group_by_entity(self.store.list(tenant_id).await?) {
            // A conflict or backoff at the head holds back the whole entity
            if group.first().is_some_and(|head| head.is_due(now)) {
                runnable.push(group);
            } else {
                report.skipped += group.iter().filter(|e| !e.is_conflict()).count();
            }
        }

        if runnable.is_empty() {
            return Ok(report);
        }

        let outcomes: Vec<Result<FlushReport>> = stream::iter(runnable)
            .map(|group| self.flush_group(remote, store, group, now))
            .buffer_unordered(self.config.flush_concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.absorb(outcome?);
        }

        tracing::info!(
            tenant_id,
            flushed = report.flushed,
            retried = report.retried,
            skipped = report.skipped,
            conflicted = report.conflicts.len(),
            "flushed change queue"
        );
        Ok(report)
    }

    async fn flush_group(
        &self,
        remote: &dyn RemoteApi,
        store: &dyn EntityStore,
        group: Vec<ChangeQueueEntry>,
        now: DateTime<Utc>,
    ) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        let total = group.len();

        for (position, snapshot) in group.into_iter().enumerate() {
            // Re-read under the lock: the entry may have been coalesced or
            // cancelled since the listing was taken
            let entry = {
                let mut in_flight = self.in_flight.lock().await;
                match self.store.get(snapshot.seq).await? {
                    Some(entry) if entry.state == EntryState::Pending => {
                        in_flight.insert(entry.seq);
                        entry
                    }
                    Some(_) => {
                        report.skipped += total - position - 1;
                        break;
                    }
                    None => continue,
                }
            };

            let sent = send(remote, &entry).await;
            let seq = entry.seq;
            let handled = self.settle(store, entry, sent, now).await;
            self.in_flight.lock().await.remove(&seq);

            match handled? {
                Settled::Confirmed => report.flushed += 1,
                Settled::Retrying => {
                    report.retried += 1;
                    report.skipped += total - position - 1;
                    break;
                }
                Settled::Conflict(err) => {
                    report.conflicts.push(err);
                    report.skipped += total - position - 1;
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn settle(
        &self,
        store: &dyn EntityStore,
        mut entry: ChangeQueueEntry,
        sent: std::result::Result<Value, RemoteError>,
        now: DateTime<Utc>,
    ) -> Result<Settled> {
        let err = match sent {
            Ok(canonical) => {
                self.confirm(store, &entry, canonical, now).await?;
                return Ok(Settled::Confirmed);
            }
            Err(err) => err,
        };

        entry.attempt_count += 1;
        entry.last_error = Some(err.to_string());

        if err.is_transient() && entry.attempt_count <= self.config.max_attempts {
            let delay = self.config.backoff(entry.attempt_count);
            entry.next_attempt_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()));
            self.store.update(&entry).await?;
            tracing::warn!(
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                attempt = entry.attempt_count,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "queued mutation failed; will retry"
            );
            return Ok(Settled::Retrying);
        }

        Ok(Settled::Conflict(self.mark_conflict(store, entry).await?))
    }

    async fn confirm(
        &self,
        store: &dyn EntityStore,
        entry: &ChangeQueueEntry,
        canonical: Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.store.remove(entry.seq).await?;

        let (tenant_id, entity_type, entity_id) =
            (&entry.tenant_id, &entry.entity_type, &entry.entity_id);

        if entry.operation == Operation::Delete {
            store.remove(tenant_id, entity_type, entity_id).await?;
            tracing::debug!(%entity_type, %entity_id, "confirmed remote delete");
            return Ok(());
        }

        // Later local edits are still queued; the local row is newer
        if !self.store.entries_for(tenant_id, entity_type, entity_id).await?.is_empty() {
            return Ok(());
        }

        let record = match normalize_stored(canonical, tenant_id, now) {
            Ok(mut record) => {
                record.id = entity_id.clone();
                Some(record)
            }
            Err(e) => {
                tracing::debug!(%entity_type, %entity_id, error = %e, "remote answer unusable; keeping local row");
                store.get(tenant_id, entity_type, entity_id).await?.map(|mut local| {
                    local.mark_synced(now);
                    local
                })
            }
        };

        if let Some(record) = record {
            store.put(entity_type, record).await?;
        }
        tracing::debug!(%entity_type, %entity_id, operation = %entry.operation, "confirmed remote write");
        Ok(())
    }

    async fn mark_conflict(
        &self,
        store: &dyn EntityStore,
        mut entry: ChangeQueueEntry,
    ) -> Result<SyncError> {
        entry.state = EntryState::Conflict;
        entry.next_attempt_at = None;
        self.store.update(&entry).await?;

        if let Some(mut local) = store
            .get(&entry.tenant_id, &entry.entity_type, &entry.entity_id)
            .await?
        {
            local.sync_status = SyncStatus::Conflict;
            store.put(&entry.entity_type, local).await?;
        }

        tracing::error!(
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            attempts = entry.attempt_count,
            error = entry.last_error.as_deref().unwrap_or_default(),
            "queued mutation moved to conflict"
        );
        self.bus.publish(SyncEvent::Conflict {
            tenant_id: entry.tenant_id.clone(),
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            attempts: entry.attempt_count,
        });

        Ok(SyncError::ConflictExceeded {
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            attempts: entry.attempt_count,
        })
    }

    /// Pending entries of a tenant, in `seq` order
    pub async fn pending(&self, tenant_id: &str) -> Result<Vec<ChangeQueueEntry>> {
        let entries = self.store.list(tenant_id).await?;
        Ok(entries.into_iter().filter(|e| !e.is_conflict()).collect())
    }

    /// Entries parked in conflict
    pub async fn conflicts(&self, tenant_id: &str) -> Result<Vec<ChangeQueueEntry>> {
        let entries = self.store.list(tenant_id).await?;
        Ok(entries.into_iter().filter(ChangeQueueEntry::is_conflict).collect())
    }

    pub async fn entries_for(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<ChangeQueueEntry>> {
        Ok(self.store.entries_for(tenant_id, entity_type, entity_id).await?)
    }

    /// Number of entries (pending and conflict) for a tenant
    pub async fn len(&self, tenant_id: &str) -> Result<usize> {
        Ok(self.store.list(tenant_id).await?.len())
    }

    pub async fn is_empty(&self, tenant_id: &str) -> Result<bool> {
        Ok(self.len(tenant_id).await? == 0)
    }

    /// Put a conflict entry back in line with a fresh retry budget.
    /// Returns the entry, or `None` if `seq` is not a conflict.
    pub async fn retry_conflict(&self, seq: i64) -> Result<Option<ChangeQueueEntry>> {
        let Some(mut entry) = self.store.get(seq).await? else {
            return Ok(None);
        };
        if !entry.is_conflict() {
            return Ok(None);
        }

        entry.state = EntryState::Pending;
        entry.attempt_count = 0;
        entry.next_attempt_at = None;
        entry.last_error = None;
        self.store.update(&entry).await?;

        tracing::info!(seq, entity_id = %entry.entity_id, "conflict entry requeued");
        Ok(Some(entry))
    }

    /// Drop a conflict entry without sending it
    pub async fn discard(&self, seq: i64) -> Result<Option<ChangeQueueEntry>> {
        let Some(entry) = self.store.get(seq).await? else {
            return Ok(None);
        };
        if !entry.is_conflict() {
            return Ok(None);
        }

        self.store.remove(seq).await?;
        tracing::warn!(seq, entity_id = %entry.entity_id, operation = %entry.operation, "conflict entry discarded");
        Ok(Some(entry))
    }
}

enum Settled {
    Confirmed,
    Retrying,
    Conflict(SyncError),
}

async fn send(
    remote: &dyn RemoteApi,
    entry: &ChangeQueueEntry,
) -> std::result::Result<Value, RemoteError> {
    let mutation = Mutation {
        entity_type: &entry.entity_type,
        tenant_id: &entry.tenant_id,
        id: &entry.entity_id,
        payload: &entry.payload_snapshot,
        idempotency_key: &entry.idempotency_key,
    };

    match entry.operation {
        Operation::Create => remote.create(mutation).await,
        Operation::Update => remote.update(mutation).await,
        Operation::Delete => remote.delete(mutation).await,
    }
}

/// Group entries by entity, groups ordered by their first `seq`
fn group_by_entity(entries: Vec<ChangeQueueEntry>) -> Vec<Vec<ChangeQueueEntry>> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<ChangeQueueEntry>> = Vec::new();

    for entry in entries {
        let key = (entry.entity_type.clone(), entry.entity_id.clone());
        match index.get(&key) {
            Some(&pos) => groups[pos].push(entry),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![entry]);
            }
        }
    }
    groups
}

/// Apply an update snapshot on top of a create snapshot
fn fold(create: Value, update: Value) -> Value {
    match (create, update) {
        (Value::Object(mut base), Value::Object(changes)) => {
            base.extend(changes);
            Value::Object(base)
        }
        (_, update) => update,
    }
}
