// File: galley-sync/src/config.rs
// Purpose: Engine configuration parsed from galley-sync.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Local database location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite URL, e.g. "sqlite://galley.db" or "sqlite::memory:"
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

/// Remote listing behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Upper bound on pages fetched for a single listing
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

/// Change queue retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Attempts allowed before an entry is moved to conflict
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Entities flushed in parallel
    #[serde(default = "default_flush_concurrency")]
    pub flush_concurrency: usize,
}

/// Background flush scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between PeriodicTick triggers
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

/// Read-through query cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

// Default values
fn default_database_url() -> String {
    "sqlite://galley-sync.db".to_string()
}

fn default_page_size() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_flush_concurrency() -> usize {
    4
}

fn default_flush_interval_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

// Default implementations
impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            flush_concurrency: default_flush_concurrency(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl SchedulerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Missing file means defaults
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: SyncConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(config)
    }

    /// Load configuration from the default path (./galley-sync.toml)
    pub fn load_default() -> Result<Self> {
        Self::load("galley-sync.toml")
    }

    /// In-memory SQLite and no background scheduler; used by tests and demos
    pub fn ephemeral() -> Self {
        Self {
            store: StoreConfig {
                database_url: "sqlite::memory:".to_string(),
            },
            scheduler: SchedulerConfig {
                enabled: false,
                ..SchedulerConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.remote.page_size, 100);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.queue.flush_concurrency, 4);
        assert!(config.cache.enabled);
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn test_empty_config() {
        let config = toml::from_str::<SyncConfig>("").unwrap_or_default();
        assert_eq!(config.remote.page_size, 100);
        assert_eq!(config.store.database_url, "sqlite://galley-sync.db");
    }

    #[test]
    fn test_partial_sections() {
        let toml = r#"
            [queue]
            max_attempts = 3
            backoff_base_ms = 100

            [cache]
            enabled = false
        "#;
        let config: SyncConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.backoff_base_ms, 100);
        assert_eq!(config.queue.backoff_max_ms, 60_000);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.ttl_secs, 30);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let queue = QueueConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..QueueConfig::default()
        };
        assert_eq!(queue.backoff(1), Duration::from_millis(100));
        assert_eq!(queue.backoff(2), Duration::from_millis(200));
        assert_eq!(queue.backoff(4), Duration::from_millis(800));
        assert_eq!(queue.backoff(5), Duration::from_millis(1_000));
        assert_eq!(queue.backoff(90), Duration::from_millis(1_000));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = SyncConfig::load("/nonexistent/galley-sync.toml").unwrap();
        assert_eq!(config.queue.max_attempts, 5);
    }
}
