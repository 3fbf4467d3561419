//! In-process remote store
//!
//! Behaves like the authoritative API (server timestamps, upsert by client
//! id, idempotency-key replay, paginated listings) and lets callers inject
//! outages and failures. Used by the test suite and for local development
//! without a backend.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::normalize::{ListResponse, PagedResult, Pagination};
use crate::remote::{matches_filters, Filters, Mutation, PageParams, RemoteApi, RemoteError};

/// Kind of mutation received by the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Create,
    Update,
    Delete,
}

/// A mutation the remote applied, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedMutation {
    pub op: RemoteOp,
    pub entity_type: String,
    pub id: String,
    pub payload: Value,
    pub idempotency_key: String,
}

#[derive(Default)]
struct RemoteState {
    tables: HashMap<(String, String), Vec<Value>>,
    offline: bool,
    bare_listings: bool,
    failures: VecDeque<RemoteError>,
    seen_keys: HashSet<String>,
    applied: Vec<AppliedMutation>,
}

/// In-memory stand-in for the remote API
#[derive(Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert raw records as if another client had created them
    pub async fn seed(&self, tenant_id: &str, entity_type: &str, records: Vec<Value>) {
        let mut state = self.state.lock().await;
        state
            .tables
            .entry((tenant_id.to_string(), entity_type.to_string()))
            .or_default()
            .extend(records);
    }

    /// Current server-side records of a table
    pub async fn records(&self, tenant_id: &str, entity_type: &str) -> Vec<Value> {
        let state = self.state.lock().await;
        state
            .tables
            .get(&(tenant_id.to_string(), entity_type.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Mutations applied so far (replays of a known idempotency key excluded)
    pub async fn applied(&self) -> Vec<AppliedMutation> {
        self.state.lock().await.applied.clone()
    }

    /// Simulate losing (or regaining) the network
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Answer listings with a bare array instead of a paged envelope
    pub async fn set_bare_listings(&self, bare: bool) {
        self.state.lock().await.bare_listings = bare;
    }

    /// Fail the next request with `error`; queued failures are consumed in order
    pub async fn fail_next(&self, error: RemoteError) {
        self.state.lock().await.failures.push_back(error);
    }

    fn check_available(state: &mut RemoteState) -> Result<(), RemoteError> {
        if state.offline {
            return Err(RemoteError::Network("remote unreachable".to_string()));
        }
        match state.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn apply(&self, op: RemoteOp, mutation: Mutation<'_>) -> Result<Value, RemoteError> {
        let mut state = self.state.lock().await;
        Self::check_available(&mut state)?;

        let key = (mutation.tenant_id.to_string(), mutation.entity_type.to_string());
        let position = state
            .tables
            .get(&key)
            .and_then(|rows| rows.iter().position(|row| row_id(row) == Some(mutation.id)));

        // Replayed mutation: answer with current state, apply nothing
        if state.seen_keys.contains(mutation.idempotency_key) {
            return Ok(position
                .and_then(|pos| state.tables.get(&key).map(|rows| rows[pos].clone()))
                .unwrap_or(Value::Null));
        }

        let fields = match (op, mutation.payload) {
            (RemoteOp::Delete, _) => {
                return Ok(Self::delete_row(&mut state, &key, position, mutation));
            }
            (_, Value::Object(fields)) => fields.clone(),
            _ => {
                return Err(RemoteError::Validation {
                    status: 422,
                    message: "payload must be an object".to_string(),
                });
            }
        };

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let result = match position {
            Some(pos) => {
                let rows = state.tables.entry(key).or_default();
                let created_at = rows[pos].get("createdAt").cloned().unwrap_or(json!(now));
                rows[pos] = canonical(fields, mutation, created_at, &now);
                rows[pos].clone()
            }
            None if op == RemoteOp::Update => return Err(RemoteError::NotFound),
            None => {
                let row = canonical(fields, mutation, json!(now), &now);
                state.tables.entry(key).or_default().push(row.clone());
                row
            }
        };

        Self::record_applied(&mut state, op, mutation);
        Ok(result)
    }

    fn record_applied(state: &mut RemoteState, op: RemoteOp, mutation: Mutation<'_>) {
        state.seen_keys.insert(mutation.idempotency_key.to_string());
        state.applied.push(AppliedMutation {
            op,
            entity_type: mutation.entity_type.to_string(),
            id: mutation.id.to_string(),
            payload: mutation.payload.clone(),
            idempotency_key: mutation.idempotency_key.to_string(),
        });
    }

    fn delete_row(
        state: &mut RemoteState,
        key: &(String, String),
        position: Option<usize>,
        mutation: Mutation<'_>,
    ) -> Value {
        let removed = match (position, state.tables.get_mut(key)) {
            (Some(pos), Some(rows)) => rows.remove(pos),
            _ => Value::Null,
        };
        Self::record_applied(state, RemoteOp::Delete, mutation);
        removed
    }
}

fn row_id(row: &Value) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

fn canonical(
    mut fields: Map<String, Value>,
    mutation: Mutation<'_>,
    created_at: Value,
    now: &str,
) -> Value {
    fields.insert("id".to_string(), json!(mutation.id));
    fields.insert("tenantId".to_string(), json!(mutation.tenant_id));
    fields.insert("createdAt".to_string(), created_at);
    fields.insert("updatedAt".to_string(), json!(now));
    Value::Object(fields)
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn list(
        &self,
        entity_type: &str,
        tenant_id: &str,
        filters: &Filters,
        page: PageParams,
    ) -> Result<ListResponse<Value>, RemoteError> {
        let mut state = self.state.lock().await;
        Self::check_available(&mut state)?;

        let rows: Vec<Value> = state
            .tables
            .get(&(tenant_id.to_string(), entity_type.to_string()))
            .map(|rows| rows.iter().filter(|row| matches_filters(row, filters)).cloned().collect())
            .unwrap_or_default();

        if state.bare_listings {
            return Ok(ListResponse::Bare(rows));
        }

        let limit = page.limit.max(1) as usize;
        let total = rows.len();
        let total_pages = total.div_ceil(limit);
        let start = (page.page.max(1) as usize - 1) * limit;
        let data: Vec<Value> = rows.into_iter().skip(start).take(limit).collect();

        Ok(ListResponse::Paged(PagedResult {
            data,
            pagination: Pagination {
                page: page.page,
                total_pages: total_pages as u32,
                has_next: (page.page as usize) < total_pages,
                total: Some(total as u64),
                limit: Some(page.limit),
            },
        }))
    }

    async fn create(&self, mutation: Mutation<'_>) -> Result<Value, RemoteError> {
        self.apply(RemoteOp::Create, mutation).await
    }

    async fn update(&self, mutation: Mutation<'_>) -> Result<Value, RemoteError> {
        self.apply(RemoteOp::Update, mutation).await
    }

    async fn delete(&self, mutation: Mutation<'_>) -> Result<Value, RemoteError> {
        self.apply(RemoteOp::Delete, mutation).await
    }
}
