//! Canonical content hashing for remote records.
//!
//! A record is reduced to a canonical JSON encoding before hashing: object
//! keys are sorted and array elements are ordered by their own canonical
//! encoding, so neither key order nor element order affects the digest.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::{self, Write};

use crate::models::RemoteRecord;

/// Hex-encoded SHA-256 digest of a record's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps a stored hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Stored for entities written with links that could not be resolved.
    /// It never equals a digest, so the next run rewrites the entity.
    pub fn pending() -> Self {
        Self("pending".to_string())
    }

    pub fn is_pending(&self) -> bool {
        self.0 == "pending"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint of a remote record.
pub fn fingerprint(record: &RemoteRecord) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(record.kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(record.external_id.as_bytes());
    hasher.update([0u8]);
    if let Some(parent) = &record.parent_external_id {
        hasher.update(parent.as_bytes());
    }
    hasher.update([0u8]);
    hasher.update(canonical_json(&record.payload).as_bytes());

    let digest = hasher.finalize();
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        // Writing into a String cannot fail.
        let _ = write!(hex, "{:02x}", byte);
    }
    Fingerprint(hex)
}

/// Encodes a JSON value in its canonical, order-independent form.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            let mut encoded: Vec<String> = items.iter().map(canonical_json).collect();
            encoded.sort();

            out.push('[');
            out.push_str(&encoded.join(","));
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
