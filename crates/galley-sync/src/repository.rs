// File: galley-sync/src/repository.rs
// Purpose: Typed, tenant-scoped CRUD facade over the entity store
//
// Reads reconcile the remote listing with local rows; writes go through the
// connectivity gate and fall back to the change queue when the remote is
// unreachable.

use chrono::Utc;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::{CacheKey, QueryCache};
use crate::config::RemoteConfig;
use crate::error::{Result, SyncError};
use crate::events::EventBus;
use crate::gate::{ConnectivityGate, WritePath};
use crate::merge::{reconcile, ListingScope};
use crate::normalize::{normalize_listing, normalize_record};
use crate::queue::{ChangeQueue, Enqueued, Operation};
use crate::record::{EntityRecord, StoredRecord, SyncStatus, Syncable};
use crate::remote::{fetch_all_pages, matches_filters, Filters, Mutation, RemoteApi};
use crate::store::{BulkPutReport, EntityStore, RecordFilter};

/// Collaborators shared by every repository of one tenant session
pub struct SyncContext {
    pub tenant_id: String,
    pub store: Arc<dyn EntityStore>,
    pub queue: Arc<ChangeQueue>,
    pub remote: Arc<dyn RemoteApi>,
    pub gate: Arc<ConnectivityGate>,
    pub cache: QueryCache,
    pub bus: EventBus,
    pub remote_config: RemoteConfig,
    /// Identifies this context on the event bus
    pub origin: Uuid,
}

/// Remote listing request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub filters: Filters,
}

impl ListQuery {
    /// The whole table
    pub fn all() -> Self {
        Self::default()
    }

    /// Add an equality filter
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(field.into(), value.into());
        self
    }

    pub fn scope(&self) -> ListingScope {
        if self.filters.is_empty() {
            ListingScope::Full
        } else {
            ListingScope::Partial
        }
    }

    /// Stable rendering used as the cache key
    pub fn shape(&self) -> String {
        self.filters
            .iter()
            .map(|(field, value)| format!("{field}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn matches(&self, payload: &Value) -> bool {
        matches_filters(payload, &self.filters)
    }
}

/// Repository for one entity type
pub struct Repository<T: Syncable> {
    ctx: Arc<SyncContext>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Syncable> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Syncable> Repository<T> {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self {
            ctx,
            _marker: PhantomData,
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.ctx.tenant_id
    }

    fn entity_type(&self) -> &'static str {
        T::entity_type()
    }

    /// Local record by id; soft-deleted rows are hidden
    pub async fn get(&self, id: &str) -> Result<Option<EntityRecord<T>>> {
        let row = self.ctx.store.get(self.tenant_id(), self.entity_type(), id).await?;
        match row {
            Some(row) if !row.is_deleted() => Ok(Some(row.decode()?)),
            _ => Ok(None),
        }
    }

    /// Local records matching `predicate`
    pub async fn query(
        &self,
        predicate: impl Fn(&EntityRecord<T>) -> bool,
    ) -> Result<Vec<EntityRecord<T>>> {
        self.query_filtered(&RecordFilter::live(), predicate).await
    }

    /// Like [`Repository::query`], including soft-deleted rows
    pub async fn query_with_deleted(
        &self,
        predicate: impl Fn(&EntityRecord<T>) -> bool,
    ) -> Result<Vec<EntityRecord<T>>> {
        self.query_filtered(&RecordFilter::with_deleted(), predicate).await
    }

    async fn query_filtered(
        &self,
        filter: &RecordFilter,
        predicate: impl Fn(&EntityRecord<T>) -> bool,
    ) -> Result<Vec<EntityRecord<T>>> {
        let rows = self
            .ctx
            .store
            .query(self.tenant_id(), self.entity_type(), filter)
            .await?;
        let records = decode_all::<T>(rows)?;
        Ok(records.into_iter().filter(|r| predicate(r)).collect())
    }

    /// Local upsert; bumps `updated_at` and keeps the caller's sync status
    pub async fn put(&self, record: EntityRecord<T>) -> Result<()> {
        let stored = self.prepare_local(record)?;
        self.ctx.store.put(self.entity_type(), stored).await?;
        self.changed().await;
        Ok(())
    }

    /// Local batch upsert; see [`EntityStore::bulk_put`]
    pub async fn bulk_put(&self, records: Vec<EntityRecord<T>>) -> Result<BulkPutReport> {
        let stored = records
            .into_iter()
            .map(|r| self.prepare_local(r))
            .collect::<Result<Vec<_>>>()?;
        let report = self.ctx.store.bulk_put(self.entity_type(), stored).await?;
        self.changed().await;
        Ok(report)
    }

    /// Mark a local row deleted and queue the remote delete, whatever the
    /// connectivity; false when there is no live row with that id
    pub async fn soft_delete(&self, id: &str) -> Result<bool> {
        if self.get(id).await?.is_none() {
            return Ok(false);
        }
        self.queue_delete(id).await?;
        Ok(true)
    }

    fn prepare_local(&self, mut record: EntityRecord<T>) -> Result<StoredRecord> {
        let now = Utc::now();
        record.tenant_id = self.ctx.tenant_id.clone();
        record.updated_at = now;
        if record.sync_status == SyncStatus::Synced && record.last_synced.is_none() {
            record.last_synced = Some(now);
        }
        Ok(record.to_stored()?)
    }

    /// Read path: remote listing reconciled with local rows
    ///
    /// Served from the cache when fresh. Offline, or when the remote is
    /// unreachable, answers from the local store instead.
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<EntityRecord<T>>> {
        let entity_type = self.entity_type();
        let key = CacheKey::new(self.tenant_id(), entity_type, query.shape());

        if let Some(rows) = self.ctx.cache.get(&key).await {
            return decode_all(rows);
        }

        if !self.ctx.gate.is_online() {
            return self.list_local(query).await;
        }

        let config = &self.ctx.remote_config;
        let listing = match fetch_all_pages(
            self.ctx.remote.as_ref(),
            entity_type,
            self.tenant_id(),
            &query.filters,
            config.page_size,
            config.max_pages,
        )
        .await
        {
            Ok(listing) => listing,
            Err(e) if e.is_transient() => {
                tracing::warn!(entity_type, error = %e, "remote listing failed; serving local rows");
                return self.list_local(query).await;
            }
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        // A truncated listing cannot prove that a local row is gone remotely
        let scope = if listing.complete {
            query.scope()
        } else {
            ListingScope::Partial
        };
        let remote = normalize_listing::<T>(listing.items, self.tenant_id(), now);
        let local = self
            .query_filtered(&RecordFilter::with_deleted(), |_| true)
            .await?;

        let outcome = reconcile(remote, local, scope, now);

        let write_back = outcome
            .write_back
            .iter()
            .map(EntityRecord::to_stored)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let written = write_back.len();
        let report = self.ctx.store.bulk_put(entity_type, write_back).await?;
        if let Some((id, err)) = report.failed.into_iter().next() {
            tracing::error!(entity_type, %id, error = %err, "write-back failed");
            return Err(err.into());
        }

        for id in &outcome.evict {
            self.ctx.store.remove(self.tenant_id(), entity_type, id).await?;
        }

        let merged_rows = outcome
            .merged
            .iter()
            .map(EntityRecord::to_stored)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.ctx.cache.put(key, merged_rows).await;
        self.ctx.bus.entity_changed(self.tenant_id(), entity_type, self.ctx.origin);

        tracing::debug!(
            entity_type,
            path = ?outcome.path,
            merged = outcome.merged.len(),
            written,
            evicted = outcome.evict.len(),
            "reconciled remote listing"
        );
        Ok(outcome.merged)
    }

    async fn list_local(&self, query: &ListQuery) -> Result<Vec<EntityRecord<T>>> {
        let rows = self
            .ctx
            .store
            .query(self.tenant_id(), self.entity_type(), &RecordFilter::live())
            .await?;
        decode_all(rows.into_iter().filter(|r| query.matches(&r.payload)).collect())
    }

    /// Create a record with a client-generated id
    pub async fn create(&self, payload: T) -> Result<EntityRecord<T>> {
        let id = Uuid::new_v4().to_string();
        let record = EntityRecord::new(id, self.tenant_id(), payload, Utc::now());
        self.write(Operation::Create, record).await
    }

    /// Replace the payload of an existing record
    pub async fn update(&self, id: &str, payload: T) -> Result<EntityRecord<T>> {
        let mut record = self.require(id).await?;
        record.payload = payload;
        record.mark_pending(Utc::now());
        self.write(Operation::Update, record).await
    }

    /// Delete a record; locally it stays soft-deleted until the remote confirms
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.require(id).await?;
        let entity_type = self.entity_type();

        if self.write_path(id).await? == WritePath::Direct {
            match self.send(Operation::Delete, id, &Value::Null).await {
                Ok(_) => {
                    self.ctx.store.remove(self.tenant_id(), entity_type, id).await?;
                    self.changed().await;
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(entity_type, id, error = %e, "remote delete failed; queueing");
                }
                Err(e) => return Err(e),
            }
        }

        self.queue_delete(id).await
    }

    /// Soft-delete locally and enqueue the remote delete. A delete that
    /// cancels a never-flushed create drops the row outright.
    async fn queue_delete(&self, id: &str) -> Result<()> {
        let entity_type = self.entity_type();
        self.ctx
            .store
            .soft_delete(self.tenant_id(), entity_type, id, Utc::now())
            .await?;
        let outcome = self
            .ctx
            .queue
            .enqueue(self.tenant_id(), entity_type, Operation::Delete, id, Value::Null)
            .await?;
        if outcome == Enqueued::Cancelled {
            self.ctx.store.remove(self.tenant_id(), entity_type, id).await?;
        }
        self.changed().await;
        Ok(())
    }

    async fn require(&self, id: &str) -> Result<EntityRecord<T>> {
        self.get(id).await?.ok_or_else(|| SyncError::NotFound {
            entity_type: self.entity_type().to_string(),
            id: id.to_string(),
        })
    }

    /// Direct when online and nothing is queued for the entity, so a direct
    /// write never overtakes queued ones
    async fn write_path(&self, id: &str) -> Result<WritePath> {
        let queued = self
            .ctx
            .queue
            .entries_for(self.tenant_id(), self.entity_type(), id)
            .await?;
        if queued.is_empty() {
            Ok(self.ctx.gate.write_path())
        } else {
            Ok(WritePath::Queued)
        }
    }

    async fn write(&self, operation: Operation, record: EntityRecord<T>) -> Result<EntityRecord<T>> {
        let entity_type = self.entity_type();
        let payload = serde_json::to_value(&record.payload)?;

        if self.write_path(&record.id).await? == WritePath::Direct {
            match self.send(operation, &record.id, &payload).await {
                Ok(canonical) => {
                    let now = Utc::now();
                    let confirmed = match normalize_record::<T>(canonical, self.tenant_id(), now) {
                        Ok(mut confirmed) => {
                            confirmed.id = record.id.clone();
                            confirmed
                        }
                        Err(e) => {
                            tracing::debug!(entity_type, error = %e, "remote answer unusable; keeping local copy");
                            let mut local = record.clone();
                            local.mark_synced(now);
                            local
                        }
                    };
                    self.ctx.store.put(entity_type, confirmed.to_stored()?).await?;
                    self.changed().await;
                    return Ok(confirmed);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(entity_type, id = %record.id, %operation, error = %e, "remote write failed; queueing");
                }
                Err(e) => return Err(e),
            }
        }

        let mut pending = record;
        pending.sync_status = SyncStatus::Pending;
        self.ctx.store.put(entity_type, pending.to_stored()?).await?;
        self.ctx
            .queue
            .enqueue(self.tenant_id(), entity_type, operation, &pending.id, payload)
            .await?;
        self.changed().await;
        Ok(pending)
    }

    async fn send(&self, operation: Operation, id: &str, payload: &Value) -> Result<Value> {
        let key = Uuid::new_v4().to_string();
        let mutation = Mutation {
            entity_type: self.entity_type(),
            tenant_id: self.tenant_id(),
            id,
            payload,
            idempotency_key: &key,
        };

        let remote = self.ctx.remote.as_ref();
        let answer = match operation {
            Operation::Create => remote.create(mutation).await,
            Operation::Update => remote.update(mutation).await,
            Operation::Delete => remote.delete(mutation).await,
        };
        Ok(answer?)
    }

    /// Drop cached listings and tell other contexts
    async fn changed(&self) {
        self.ctx.cache.invalidate(self.tenant_id(), self.entity_type()).await;
        self.ctx
            .bus
            .entity_changed(self.tenant_id(), self.entity_type(), self.ctx.origin);
    }
}

fn decode_all<T: Syncable>(rows: Vec<StoredRecord>) -> Result<Vec<EntityRecord<T>>> {
    rows.into_iter()
        .map(|row| row.decode::<T>().map_err(SyncError::from))
        .collect()
}
