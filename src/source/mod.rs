//! HTTP access to the upstream catalog API.
//!
//! Endpoints, relative to `source.base_url`:
//! - `GET /categories`, `GET /procedures`: every record.
//! - `GET /cases?page=N&per_page=S`: one 1-based page, total in `total`,
//!   `meta.total` or the `X-Total-Count` header.
//! - `GET /cases/{id}`: one case, 404 when unknown.
//!
//! Lists may be bare arrays or wrapped in `{"data": [...]}`.

mod client;

pub use client::{HttpSource, HttpSourceError};

use mirror_core::{RecordKind, RemoteRecord};
use serde_json::Value;

/// Unwraps a `{"data": ...}` envelope if present.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Builds a record from one API object. A missing id yields an empty
/// external id, which the mapper rejects for that record alone.
pub(crate) fn record_from_value(kind: RecordKind, value: Value) -> RemoteRecord {
    let external_id = id_string(value.get("id")).unwrap_or_default();
    let parent = match kind {
        RecordKind::Category => id_string(value.get("parentId")),
        RecordKind::Procedure => {
            id_string(value.get("categoryId")).or_else(|| id_string(value.get("parentId")))
        }
        RecordKind::Case => None,
    };
    let record = RemoteRecord::new(kind, external_id, value);
    match parent {
        Some(parent) => record.with_parent(parent),
        None => record,
    }
}

/// Parses a list response into records.
pub(crate) fn records_from_body(kind: RecordKind, body: Value) -> Result<Vec<RemoteRecord>, String> {
    match unwrap_data(body) {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter(Value::is_object)
            .map(|item| record_from_value(kind, item))
            .collect()),
        other => Err(format!("expected a list of {} records, got {}", kind, type_name(&other))),
    }
}

/// Parses a single-record response.
pub(crate) fn record_from_body(kind: RecordKind, body: Value) -> Result<RemoteRecord, String> {
    match unwrap_data(body) {
        item @ Value::Object(_) => Ok(record_from_value(kind, item)),
        other => Err(format!("expected a {} object, got {}", kind, type_name(&other))),
    }
}

/// Total advertised in a list body, if any.
pub(crate) fn total_from_body(body: &Value) -> Option<u64> {
    body.get("total")
        .or_else(|| body.get("meta").and_then(|m| m.get("total")))
        .and_then(Value::as_u64)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
