// File: galley-sync/src/lib.rs
// Purpose: Main entry point for galley-sync library

//! # galley-sync
//!
//! Local-first synchronization engine for multi-tenant restaurant operations
//! data. Entities can be read and mutated while the device is offline; queued
//! mutations are replayed against the remote store once connectivity
//! returns, and remote listings are reconciled with local rows so the
//! operator never sees duplicates or stale records.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use galley_sync::{Connectivity, ListQuery, SyncConfig, SyncSession, Syncable};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Ingredient {
//!     name: String,
//!     stock: f64,
//! }
//!
//! impl Syncable for Ingredient {
//!     fn entity_type() -> &'static str {
//!         "ingredients"
//!     }
//!
//!     fn name_fields(&self) -> Vec<Option<&str>> {
//!         vec![Some(&self.name)]
//!     }
//! }
//!
//! let config = SyncConfig::load_default()?;
//! let mut session = SyncSession::open(config, "tenant-42", remote).await?;
//! session.start();
//!
//! let ingredients = session.repository::<Ingredient>();
//! let salt = ingredients.create(Ingredient { name: "Salt".into(), stock: 3.0 }).await?;
//! let all = ingredients.list(&ListQuery::all()).await?;
//!
//! session.set_connectivity(Connectivity::Offline);
//! ingredients.update(&salt.id, Ingredient { name: "Salt".into(), stock: 2.0 }).await?;
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod merge;
pub mod normalize;
pub mod queue;
pub mod record;
pub mod remote;
pub mod repository;
pub mod store;

// Re-export main types
pub use cache::{CacheStats, QueryCache};
pub use config::SyncConfig;
pub use db::LocalDb;
pub use engine::{SessionBuilder, SyncSession};
pub use error::{Result, StorageError, SyncError};
pub use events::{EntityChanged, EventBus, SyncEvent, SyncTrigger};
pub use gate::{decide_write_path, Connectivity, ConnectivityGate, WritePath};
pub use merge::{merge_records, reconcile, ListingScope, MergeOutcome, MergePath};
pub use queue::{ChangeQueue, ChangeQueueEntry, Enqueued, EntryState, FlushReport, Operation};
pub use record::{EntityRecord, StoredRecord, SyncStatus, Syncable};
pub use remote::{MemoryRemote, Mutation, RemoteApi, RemoteError, RemoteListing};
pub use repository::{ListQuery, Repository};
pub use store::{BulkPutReport, EntityStore, MemoryEntityStore, RecordFilter, SqliteEntityStore};
