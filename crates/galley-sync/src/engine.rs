// File: galley-sync/src/engine.rs
// Purpose: Per-tenant sync session owning stores, queue, gate, cache and scheduler

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::cache::{CacheStats, QueryCache};
use crate::config::SyncConfig;
use crate::db::LocalDb;
use crate::error::Result;
use crate::events::{EventBus, SyncEvent, SyncTrigger};
use crate::gate::{Connectivity, ConnectivityGate};
use crate::queue::{
    ChangeQueue, ChangeQueueEntry, FlushReport, MemoryQueueStore, QueueStore, SqliteQueueStore,
};
use crate::record::{SyncStatus, Syncable};
use crate::remote::RemoteApi;
use crate::repository::{Repository, SyncContext};
use crate::store::{EntityStore, MemoryEntityStore, SqliteEntityStore};

/// Builder for a [`SyncSession`]
pub struct SessionBuilder {
    tenant_id: String,
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
    bus: Option<EventBus>,
    connectivity: Connectivity,
}

impl SessionBuilder {
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an event bus with other contexts on the same device
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Initial connectivity signal (default: online)
    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    /// Open the SQLite database named by the config and build the session
    pub async fn open(self) -> Result<SyncSession> {
        let db = LocalDb::open(&self.config.store.database_url).await?;
        let store = SqliteEntityStore::new(db.clone()).await?;
        let queue_store = SqliteQueueStore::new(db.clone()).await?;
        Ok(self.assemble(Arc::new(store), Arc::new(queue_store), Some(db)))
    }

    /// Build a process-local session; nothing survives the process
    pub fn in_memory(self) -> SyncSession {
        self.with_stores(Arc::new(MemoryEntityStore::new()), Arc::new(MemoryQueueStore::new()))
    }

    /// Build on caller-provided storage backends
    pub fn with_stores(
        self,
        store: Arc<dyn EntityStore>,
        queue_store: Arc<dyn QueueStore>,
    ) -> SyncSession {
        self.assemble(store, queue_store, None)
    }

    fn assemble(
        self,
        store: Arc<dyn EntityStore>,
        queue_store: Arc<dyn QueueStore>,
        db: Option<LocalDb>,
    ) -> SyncSession {
        let bus = self.bus.unwrap_or_default();
        let cache = if self.config.cache.enabled {
            QueryCache::new(self.config.cache.ttl())
        } else {
            QueryCache::disabled()
        };

        tracing::info!(
            tenant_id = %self.tenant_id,
            store = store.name(),
            queue = queue_store.name(),
            connectivity = ?self.connectivity,
            "sync session opened"
        );

        let ctx = SyncContext {
            tenant_id: self.tenant_id,
            queue: Arc::new(ChangeQueue::new(queue_store, self.config.queue.clone(), bus.clone())),
            store,
            remote: self.remote,
            gate: Arc::new(ConnectivityGate::new(self.connectivity, bus.clone())),
            cache,
            bus,
            remote_config: self.config.remote.clone(),
            origin: Uuid::new_v4(),
        };

        SyncSession {
            ctx: Arc::new(ctx),
            config: self.config,
            db,
            scheduler: None,
        }
    }
}

/// Explicit state of one tenant session
///
/// Constructed once when a tenant session starts and torn down when it ends.
/// Repositories handed out by the session share its stores, queue, gate and
/// cache.
pub struct SyncSession {
    ctx: Arc<SyncContext>,
    config: SyncConfig,
    db: Option<LocalDb>,
    scheduler: Option<JoinHandle<()>>,
}

impl SyncSession {
    pub fn builder(tenant_id: impl Into<String>, remote: Arc<dyn RemoteApi>) -> SessionBuilder {
        SessionBuilder {
            tenant_id: tenant_id.into(),
            remote,
            config: SyncConfig::default(),
            bus: None,
            connectivity: Connectivity::Online,
        }
    }

    /// Open a durable session on the SQLite database named by `config`
    pub async fn open(
        config: SyncConfig,
        tenant_id: impl Into<String>,
        remote: Arc<dyn RemoteApi>,
    ) -> Result<Self> {
        Self::builder(tenant_id, remote).config(config).open().await
    }

    /// Process-local session with ephemeral settings
    pub fn in_memory(tenant_id: impl Into<String>, remote: Arc<dyn RemoteApi>) -> Self {
        Self::builder(tenant_id, remote)
            .config(SyncConfig::ephemeral())
            .in_memory()
    }

    pub fn tenant_id(&self) -> &str {
        &self.ctx.tenant_id
    }

    pub fn origin(&self) -> Uuid {
        self.ctx.origin
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Typed repository for one entity type
    pub fn repository<T: Syncable>(&self) -> Repository<T> {
        Repository::new(self.ctx.clone())
    }

    pub fn bus(&self) -> &EventBus {
        &self.ctx.bus
    }

    pub fn gate(&self) -> &ConnectivityGate {
        &self.ctx.gate
    }

    pub fn queue(&self) -> &ChangeQueue {
        &self.ctx.queue
    }

    pub fn set_connectivity(&self, connectivity: Connectivity) {
        self.ctx.gate.set(connectivity);
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.ctx.cache.stats().await
    }

    /// Drain the change queue now
    pub async fn flush(&self) -> Result<FlushReport> {
        flush_context(&self.ctx).await
    }

    /// Ask the background scheduler to flush
    pub fn request_flush(&self) {
        self.ctx.bus.trigger(SyncTrigger::ExplicitFlushRequested);
    }

    pub async fn pending_changes(&self) -> Result<Vec<ChangeQueueEntry>> {
        self.ctx.queue.pending(&self.ctx.tenant_id).await
    }

    pub async fn conflicts(&self) -> Result<Vec<ChangeQueueEntry>> {
        self.ctx.queue.conflicts(&self.ctx.tenant_id).await
    }

    /// Give a conflict entry a fresh retry budget; its record goes back to
    /// `pending`
    pub async fn retry_conflict(&self, seq: i64) -> Result<bool> {
        let Some(entry) = self.ctx.queue.retry_conflict(seq).await? else {
            return Ok(false);
        };

        let store = &self.ctx.store;
        if let Some(mut row) = store
            .get(&entry.tenant_id, &entry.entity_type, &entry.entity_id)
            .await?
        {
            row.sync_status = SyncStatus::Pending;
            store.put(&entry.entity_type, row).await?;
        }
        self.ctx.cache.invalidate(&entry.tenant_id, &entry.entity_type).await;
        Ok(true)
    }

    /// Drop a conflict entry; the local row keeps its `conflict` status
    pub async fn discard_conflict(&self, seq: i64) -> Result<bool> {
        Ok(self.ctx.queue.discard(seq).await?.is_some())
    }

    /// Start the background task: flushes on triggers and periodic ticks
    /// (when the scheduler is enabled) and drops cached listings when other
    /// contexts announce changes
    pub fn start(&mut self) {
        if self.scheduler.is_some() {
            return;
        }

        let interval = self
            .config
            .scheduler
            .enabled
            .then(|| self.config.scheduler.flush_interval());
        self.scheduler = Some(spawn_scheduler(self.ctx.clone(), interval));
        tracing::debug!(tenant_id = %self.ctx.tenant_id, ?interval, "scheduler started");
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the scheduler and close the local database
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.scheduler.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(db) = &self.db {
            db.close().await;
        }
        tracing::info!(tenant_id = %self.ctx.tenant_id, "sync session closed");
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.take() {
            handle.abort();
        }
    }
}

async fn flush_context(ctx: &SyncContext) -> Result<FlushReport> {
    // Offline attempts would only burn retry budget
    if !ctx.gate.is_online() {
        let skipped = ctx.queue.pending(&ctx.tenant_id).await?.len();
        return Ok(FlushReport {
            skipped,
            ..FlushReport::default()
        });
    }

    let report = ctx
        .queue
        .flush(ctx.remote.as_ref(), ctx.store.as_ref(), &ctx.tenant_id)
        .await?;
    if report.flushed > 0 || !report.conflicts.is_empty() {
        ctx.cache.clear().await;
    }
    Ok(report)
}

fn spawn_scheduler(ctx: Arc<SyncContext>, flush_interval: Option<Duration>) -> JoinHandle<()> {
    let mut events = ctx.bus.subscribe();
    let flushing = flush_interval.is_some();

    tokio::spawn(async move {
        let mut ticker = flush_interval.map(|period| {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            let trigger = tokio::select! {
                _ = next_tick(&mut ticker) => Some(SyncTrigger::PeriodicTick),
                event = events.recv() => match event {
                    Ok(SyncEvent::Trigger { trigger }) => Some(trigger),
                    Ok(SyncEvent::EntityChanged(change)) => {
                        if change.origin != ctx.origin && change.tenant_id == ctx.tenant_id {
                            ctx.cache.invalidate(&change.tenant_id, &change.entity_type).await;
                        }
                        None
                    }
                    Ok(SyncEvent::Conflict { .. }) => None,
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "event bus lagged; dropping cached listings");
                        ctx.cache.clear().await;
                        None
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let Some(trigger) = trigger else { continue };
            if !flushing {
                continue;
            }

            match flush_context(&ctx).await {
                Ok(report) if report.already_running => {}
                Ok(report) => tracing::debug!(
                    ?trigger,
                    flushed = report.flushed,
                    retried = report.retried,
                    conflicted = report.conflicts.len(),
                    "scheduled flush finished"
                ),
                Err(e) => tracing::error!(?trigger, error = %e, "scheduled flush failed"),
            }
        }
    })
}

/// Next periodic tick, or never when periodic flushing is off
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::remote::MemoryRemote;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ingredient {
        name: String,
    }

    impl Syncable for Ingredient {
        fn entity_type() -> &'static str {
            "ingredients"
        }

        fn name_fields(&self) -> Vec<Option<&str>> {
            vec![Some(&self.name)]
        }
    }

    async fn wait_until_drained(session: &SyncSession) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.queue().is_empty(session.tenant_id()).await.unwrap() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("queue was not drained");
    }

    #[tokio::test]
    async fn test_offline_flush_does_not_spend_attempts() {
        let remote = Arc::new(MemoryRemote::new());
        let session = SyncSession::builder("tenant-a", remote)
            .config(SyncConfig::ephemeral())
            .connectivity(Connectivity::Offline)
            .in_memory();
        let repo = session.repository::<Ingredient>();
        repo.create(Ingredient { name: "Salt".into() }).await.unwrap();

        let report = session.flush().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(session.pending_changes().await.unwrap()[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_reconnect_triggers_background_flush() {
        let remote = Arc::new(MemoryRemote::new());
        let config = SyncConfig {
            scheduler: SchedulerConfig {
                enabled: true,
                flush_interval_secs: 3600,
            },
            ..SyncConfig::ephemeral()
        };
        let mut session = SyncSession::builder("tenant-a", remote.clone())
            .config(config)
            .connectivity(Connectivity::Offline)
            .in_memory();
        session.start();
        assert!(session.is_running());

        let repo = session.repository::<Ingredient>();
        let salt = repo.create(Ingredient { name: "Salt".into() }).await.unwrap();
        assert_eq!(salt.sync_status, SyncStatus::Pending);

        session.set_connectivity(Connectivity::Online);
        wait_until_drained(&session).await;

        let stored = repo.get(&salt.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(remote.records("tenant-a", "ingredients").await.len(), 1);

        session.shutdown().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_explicit_flush_request() {
        let remote = Arc::new(MemoryRemote::new());
        let config = SyncConfig {
            scheduler: SchedulerConfig {
                enabled: true,
                flush_interval_secs: 3600,
            },
            ..SyncConfig::ephemeral()
        };
        let mut session = SyncSession::builder("tenant-a", remote.clone())
            .config(config)
            .in_memory();
        session.start();

        remote.set_offline(true).await;
        let repo = session.repository::<Ingredient>();
        repo.create(Ingredient { name: "Salt".into() }).await.unwrap();
        assert_eq!(session.pending_changes().await.unwrap().len(), 1);

        remote.set_offline(false).await;
        session.request_flush();
        wait_until_drained(&session).await;
    }

    #[tokio::test]
    async fn test_retry_conflict_resets_record() {
        let remote = Arc::new(MemoryRemote::new());
        let mut config = SyncConfig::ephemeral();
        config.queue.max_attempts = 0;
        let session = SyncSession::builder("tenant-a", remote.clone())
            .config(config)
            .in_memory();
        let repo = session.repository::<Ingredient>();

        remote.set_offline(true).await;
        let salt = repo.create(Ingredient { name: "Salt".into() }).await.unwrap();
        let report = session.flush().await.unwrap();
        assert_eq!(report.conflicts.len(), 1);
        let conflicted = repo.get(&salt.id).await.unwrap().unwrap();
        assert_eq!(conflicted.sync_status, SyncStatus::Conflict);

        let seq = session.conflicts().await.unwrap()[0].seq;
        assert!(session.retry_conflict(seq).await.unwrap());
        let reset = repo.get(&salt.id).await.unwrap().unwrap();
        assert_eq!(reset.sync_status, SyncStatus::Pending);

        remote.set_offline(false).await;
        let report = session.flush().await.unwrap();
        assert_eq!(report.flushed, 1);
        let synced = repo.get(&salt.id).await.unwrap().unwrap();
        assert_eq!(synced.sync_status, SyncStatus::Synced);
    }
}
