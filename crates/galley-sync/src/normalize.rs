// File: galley-sync/src/normalize.rs
// Purpose: Boundary adapter turning inbound remote JSON into canonical records
//
// Remote listings arrive either as a paginated envelope or a bare array, and
// individual records use several legacy spellings for ids and timestamps.
// Everything is normalized here so the merger and queue only ever see
// `EntityRecord<T>`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::SyncError;
use crate::record::{EntityRecord, StoredRecord, Syncable};

const ID_FIELDS: &[&str] = &["id", "_id", "uuid"];
const TENANT_FIELDS: &[&str] = &["tenantId", "tenant_id", "restaurantId", "restaurant_id"];
const CREATED_FIELDS: &[&str] = &["createdAt", "created_at"];
const UPDATED_FIELDS: &[&str] = &["updatedAt", "updated_at", "modifiedAt", "lastModified"];
const DELETED_FIELDS: &[&str] = &["deletedAt", "deleted_at"];

/// Pagination metadata of a paged listing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default, alias = "hasNextPage")]
    pub has_next: bool,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Paginated envelope `{data, pagination}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagedResult<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub pagination: Pagination,
}

/// A remote listing in either of the shapes the API returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ListResponse<T> {
    Paged(PagedResult<T>),
    Bare(Vec<T>),
}

/// One normalized page of a listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_more: bool,
}

impl<T> ListResponse<T> {
    /// Collapse either shape into a page. A bare array is always complete.
    pub fn into_page(self) -> Page<T> {
        match self {
            ListResponse::Bare(items) => Page {
                items,
                has_more: false,
            },
            ListResponse::Paged(paged) => {
                let p = &paged.pagination;
                let has_more = p.has_next || (p.total_pages > 0 && p.page < p.total_pages);
                Page {
                    has_more: has_more && !paged.data.is_empty(),
                    items: paged.data,
                }
            }
        }
    }
}

/// Why an inbound record could not be normalized
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("record has no usable id")]
    MissingId,

    #[error("record belongs to tenant '{found}', expected '{expected}'")]
    TenantMismatch { expected: String, found: String },

    #[error("payload does not match the entity shape: {0}")]
    Payload(#[from] serde_json::Error),
}

impl From<NormalizeError> for SyncError {
    fn from(err: NormalizeError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

/// Normalize one remote record. The result is tagged `Synced` at `now`.
pub fn normalize_record<T: Syncable>(
    raw: Value,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> Result<EntityRecord<T>, NormalizeError> {
    Ok(normalize_stored(raw, tenant_id, now)?.decode::<T>()?)
}

/// Untyped variant of [`normalize_record`]; the whole object becomes the payload
pub fn normalize_stored(
    raw: Value,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> Result<StoredRecord, NormalizeError> {
    let Value::Object(object) = raw else {
        return Err(NormalizeError::NotAnObject);
    };

    let id = first_field(&object, ID_FIELDS)
        .and_then(id_string)
        .ok_or(NormalizeError::MissingId)?;

    if let Some(found) = first_field(&object, TENANT_FIELDS).and_then(Value::as_str) {
        if found != tenant_id {
            return Err(NormalizeError::TenantMismatch {
                expected: tenant_id.to_string(),
                found: found.to_string(),
            });
        }
    }

    let created_at = first_timestamp(&object, CREATED_FIELDS);
    let updated_at = first_timestamp(&object, UPDATED_FIELDS);
    let deleted_at = first_timestamp(&object, DELETED_FIELDS);
    let epoch = DateTime::<Utc>::UNIX_EPOCH;

    let mut record = StoredRecord::new(id, tenant_id, Value::Object(object), now);
    record.created_at = created_at.or(updated_at).unwrap_or(epoch);
    record.updated_at = updated_at.or(created_at).unwrap_or(epoch);
    record.deleted_at = deleted_at;
    record.mark_synced(now);
    Ok(record)
}

/// Normalize a whole listing, skipping (and logging) records that do not fit
pub fn normalize_listing<T: Syncable>(
    items: Vec<Value>,
    tenant_id: &str,
    now: DateTime<Utc>,
) -> Vec<EntityRecord<T>> {
    items
        .into_iter()
        .filter_map(|raw| match normalize_record::<T>(raw, tenant_id, now) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(entity_type = T::entity_type(), error = %e, "skipping remote record");
                None
            }
        })
        .collect()
}

/// Parse the timestamp spellings seen on the wire: RFC 3339, naive
/// date-times, bare dates, and epoch seconds or milliseconds
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s.trim()),
        Value::Number(n) => {
            let n = n.as_i64()?;
            // Anything past 1e11 cannot be seconds (year 5138)
            if n.abs() >= 100_000_000_000 {
                Utc.timestamp_millis_opt(n).single()
            } else {
                Utc.timestamp_opt(n, 0).single()
            }
        }
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn first_field<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| object.get(*name))
        .find(|value| !value.is_null())
}

fn first_timestamp(object: &Map<String, Value>, names: &[&str]) -> Option<DateTime<Utc>> {
    names
        .iter()
        .filter_map(|name| object.get(*name))
        .find_map(parse_timestamp)
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SyncStatus;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ingredient {
        #[serde(default)]
        name: String,
        #[serde(default)]
        stock: f64,
    }

    impl Syncable for Ingredient {
        fn entity_type() -> &'static str {
            "ingredients"
        }

        fn name_fields(&self) -> Vec<Option<&str>> {
            vec![Some(self.name.as_str())]
        }
    }

    #[test]
    fn test_paged_and_bare_listings_normalize_alike() {
        let paged: ListResponse<Value> = serde_json::from_value(json!({
            "data": [{"id": "1"}],
            "pagination": {"page": 1, "totalPages": 3, "hasNext": true}
        }))
        .unwrap();
        let bare: ListResponse<Value> = serde_json::from_value(json!([{"id": "1"}])).unwrap();

        let paged = paged.into_page();
        let bare = bare.into_page();
        assert_eq!(paged.items, bare.items);
        assert!(paged.has_more);
        assert!(!bare.has_more);
    }

    #[test]
    fn test_last_page_has_no_more() {
        let last: ListResponse<Value> = serde_json::from_value(json!({
            "data": [{"id": "9"}],
            "pagination": {"page": 3, "totalPages": 3, "hasNext": false}
        }))
        .unwrap();
        assert!(!last.into_page().has_more);
    }

    #[test]
    fn test_normalize_record_reads_legacy_spellings() {
        let now = Utc::now();
        let record: EntityRecord<Ingredient> = normalize_record(
            json!({
                "_id": 42,
                "tenant_id": "tenant-a",
                "name": "Salt",
                "stock": 2.5,
                "created_at": "2024-01-01",
                "modifiedAt": "2024-01-02T10:30:00Z"
            }),
            "tenant-a",
            now,
        )
        .unwrap();

        assert_eq!(record.id, "42");
        assert_eq!(record.payload, Ingredient { name: "Salt".into(), stock: 2.5 });
        assert_eq!(record.created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(record.updated_at.to_rfc3339(), "2024-01-02T10:30:00+00:00");
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.last_synced, Some(now));
    }

    #[test]
    fn test_normalize_record_rejects_other_tenant_and_missing_id() {
        let now = Utc::now();
        let foreign = normalize_record::<Ingredient>(
            json!({"id": "1", "tenantId": "tenant-b"}),
            "tenant-a",
            now,
        );
        assert!(matches!(foreign, Err(NormalizeError::TenantMismatch { .. })));

        let anonymous = normalize_record::<Ingredient>(json!({"name": "Salt"}), "tenant-a", now);
        assert!(matches!(anonymous, Err(NormalizeError::MissingId)));
    }

    #[test]
    fn test_normalize_stored_keeps_whole_object() {
        let raw = json!({"id": "7", "name": "Pepper", "updatedAt": "2024-03-01"});
        let record = normalize_stored(raw.clone(), "tenant-a", Utc::now()).unwrap();
        assert_eq!(record.id, "7");
        assert_eq!(record.payload, raw);
        assert_eq!(record.created_at, record.updated_at);
    }

    #[test]
    fn test_normalize_listing_skips_bad_records() {
        let records = normalize_listing::<Ingredient>(
            vec![json!({"id": "1", "name": "Salt"}), json!("garbage"), json!({"id": "2"})],
            "tenant-a",
            Utc::now(),
        );
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[rstest]
    #[case(json!("2024-01-02T03:04:05Z"), "2024-01-02T03:04:05+00:00")]
    #[case(json!("2024-01-02T03:04:05+02:00"), "2024-01-02T01:04:05+00:00")]
    #[case(json!("2024-01-02 03:04:05"), "2024-01-02T03:04:05+00:00")]
    #[case(json!("2024-01-02"), "2024-01-02T00:00:00+00:00")]
    #[case(json!(1704164645), "2024-01-02T03:04:05+00:00")]
    #[case(json!(1704164645000i64), "2024-01-02T03:04:05+00:00")]
    fn test_parse_timestamp(#[case] input: Value, #[case] expected: &str) {
        assert_eq!(parse_timestamp(&input).unwrap().to_rfc3339(), expected);
    }

    #[test]
    fn test_parse_timestamp_rejects_garbage() {
        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&json!(true)).is_none());
    }
}
