//! Remote API port: the authoritative store the engine reconciles against
//!
//! Transport and authentication are the embedder's concern; the engine only
//! needs listings and single-record mutations.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::error::SyncError;
use crate::normalize::ListResponse;

pub mod memory;

pub use memory::MemoryRemote;

/// Equality filters passed through to the remote listing
pub type Filters = BTreeMap<String, String>;

/// Equality match of a JSON object against listing filters; non-string
/// fields compare by their JSON text
pub fn matches_filters(row: &Value, filters: &Filters) -> bool {
    filters.iter().all(|(field, expected)| match row.get(field) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == *expected,
        None => false,
    })
}

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageParams {
    pub page: u32,
    pub limit: u32,
}

/// A single-record mutation sent to the remote store
#[derive(Debug, Clone, Copy)]
pub struct Mutation<'a> {
    pub entity_type: &'a str,
    pub tenant_id: &'a str,
    /// Client-generated for creates, so the remote can upsert by id
    pub id: &'a str,
    pub payload: &'a Value,
    /// Identical on every replay of the same queued mutation
    pub idempotency_key: &'a str,
}

/// Failure reported by the remote API
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("network unreachable: {0}")]
    Network(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("rejected with {status}: {message}")]
    Validation { status: u16, message: String },

    #[error("record not found")]
    NotFound,
}

impl RemoteError {
    /// Network failures and 5xx responses may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Server { status, .. } => *status >= 500,
            RemoteError::Validation { .. } | RemoteError::NotFound => false,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        if err.is_transient() {
            SyncError::Network(err.to_string())
        } else {
            SyncError::Validation(err.to_string())
        }
    }
}

/// The remote API consumed by the engine
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// One page of a listing; may answer with a bare array instead
    async fn list(
        &self,
        entity_type: &str,
        tenant_id: &str,
        filters: &Filters,
        page: PageParams,
    ) -> Result<ListResponse<Value>, RemoteError>;

    /// Create (upsert by client id); returns the canonical server record
    async fn create(&self, mutation: Mutation<'_>) -> Result<Value, RemoteError>;

    /// Update; returns the canonical server record
    async fn update(&self, mutation: Mutation<'_>) -> Result<Value, RemoteError>;

    /// Delete; deleting an absent record succeeds
    async fn delete(&self, mutation: Mutation<'_>) -> Result<Value, RemoteError>;
}

/// Concatenated raw items of a listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteListing {
    pub items: Vec<Value>,
    /// False when the page limit cut the listing short
    pub complete: bool,
}

/// Fetch every page of a listing sequentially and concatenate the items
///
/// Pages are requested one at a time so only the accumulated raw items are
/// held in memory; merge correctness does not depend on page boundaries.
pub async fn fetch_all_pages(
    remote: &dyn RemoteApi,
    entity_type: &str,
    tenant_id: &str,
    filters: &Filters,
    page_size: u32,
    max_pages: u32,
) -> Result<RemoteListing, RemoteError> {
    let limit = page_size.max(1);
    let mut items = Vec::new();
    let mut complete = true;
    let mut page = 1;

    loop {
        let response = remote
            .list(entity_type, tenant_id, filters, PageParams { page, limit })
            .await?;
        let fetched = response.into_page();
        items.extend(fetched.items);

        if !fetched.has_more {
            break;
        }
        if page >= max_pages {
            tracing::warn!(entity_type, page, "stopping listing at page limit");
            complete = false;
            break;
        }
        page += 1;
    }

    tracing::debug!(
        entity_type,
        pages = page,
        items = items.len(),
        complete,
        "fetched remote listing"
    );
    Ok(RemoteListing { items, complete })
}
