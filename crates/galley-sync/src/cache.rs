//! Read-through cache for repository listings
//!
//! Keyed by tenant, entity type and query shape. Entries expire after a TTL
//! and are dropped whenever the entity type is written locally or another
//! context announces a change.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::record::StoredRecord;

/// Identifies one cached listing
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_id: String,
    pub entity_type: String,
    /// Canonical rendering of the listing filters
    pub shape: String,
}

impl CacheKey {
    pub fn new(tenant_id: &str, entity_type: &str, shape: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            entity_type: entity_type.to_string(),
            shape: shape.into(),
        }
    }
}

/// A cached listing with metadata
#[derive(Debug, Clone)]
pub struct CachedListing {
    pub records: Vec<StoredRecord>,
    pub cached_at: DateTime<Utc>,
    pub ttl: Duration,
    pub hits: u64,
}

impl CachedListing {
    pub fn new(records: Vec<StoredRecord>, ttl: Duration) -> Self {
        Self {
            records,
            cached_at: Utc::now(),
            ttl,
            hits: 0,
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }

    pub fn is_stale(&self) -> bool {
        self.age() >= self.ttl
    }
}

/// Statistics for the query cache
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CachedListing>,
    stats: CacheStats,
}

/// Shared listing cache; clones share state
#[derive(Clone)]
pub struct QueryCache {
    state: Arc<RwLock<CacheState>>,
    ttl: Duration,
    enabled: bool,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            ttl,
            enabled: true,
        }
    }

    /// A cache that never stores anything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::ZERO)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Fresh records for `key`, if any. Stale entries are dropped.
    pub async fn get(&self, key: &CacheKey) -> Option<Vec<StoredRecord>> {
        if !self.enabled {
            return None;
        }

        let mut state = self.state.write().await;
        if state.entries.get(key).is_some_and(CachedListing::is_stale) {
            state.entries.remove(key);
        }

        let fresh = state.entries.get_mut(key).map(|entry| {
            entry.hits += 1;
            entry.records.clone()
        });

        match fresh {
            Some(records) => {
                state.stats.hits += 1;
                Some(records)
            }
            None => {
                state.stats.misses += 1;
                None
            }
        }
    }

    pub async fn put(&self, key: CacheKey, records: Vec<StoredRecord>) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write().await;
        state.entries.insert(key, CachedListing::new(records, self.ttl));
    }

    /// Drop every shape cached for one entity type of a tenant
    pub async fn invalidate(&self, tenant_id: &str, entity_type: &str) {
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|key, _| !(key.tenant_id == tenant_id && key.entity_type == entity_type));

        let dropped = before - state.entries.len();
        if dropped > 0 {
            state.stats.invalidations += 1;
            tracing::debug!(tenant_id, entity_type, dropped, "invalidated cached listings");
        }
    }

    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            entries: state.entries.len(),
            ..state.stats.clone()
        }
    }
}
