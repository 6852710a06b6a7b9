use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::record::{EntityId, RecordKind, TenantToken};
use crate::fingerprint::Fingerprint;

/// Unique marker for one sync run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Join key between remote identity and local identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegistryKey {
    pub tenant: TenantToken,
    pub kind: RecordKind,
    pub external_id: String,
}

impl RegistryKey {
    pub fn new(tenant: TenantToken, kind: RecordKind, external_id: impl Into<String>) -> Self {
        Self {
            tenant,
            kind,
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant, self.kind, self.external_id)
    }
}

/// Index row mapping `(tenant, kind, external_id)` to a local entity, with
/// the bookkeeping used by change detection and the orphan sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub tenant: TenantToken,
    pub kind: RecordKind,
    pub external_id: String,
    pub local_id: EntityId,
    pub content_fingerprint: Fingerprint,
    pub last_synced_at: DateTime<Utc>,
    pub last_sync_session_id: SessionId,
}

impl RegistryEntry {
    pub fn key(&self) -> RegistryKey {
        RegistryKey::new(self.tenant.clone(), self.kind, self.external_id.clone())
    }
}

/// Session marker written onto every registry entry touched by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStamp {
    pub session_id: SessionId,
    pub synced_at: DateTime<Utc>,
}

impl SyncStamp {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            synced_at: Utc::now(),
        }
    }
}

/// Audit row for one orphan deletion.
///
/// Carries identifiers only. Business payload never reaches the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionRecord {
    pub kind: RecordKind,
    pub external_id: String,
    pub local_id: EntityId,
    pub session_id: SessionId,
    pub deleted_at: DateTime<Utc>,
}

impl DeletionRecord {
    pub fn for_entry(entry: &RegistryEntry, session_id: &SessionId) -> Self {
        Self {
            kind: entry.kind,
            external_id: entry.external_id.clone(),
            local_id: entry.local_id,
            session_id: session_id.clone(),
            deleted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_session_ids_are_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn test_registry_key_display() {
        let key = RegistryKey::new(TenantToken::new("acme"), RecordKind::Case, "100");
        assert_eq!(key.to_string(), "acme/case/100");
    }

    #[test]
    fn test_deletion_record_serializes_identifiers_only() {
        let entry = RegistryEntry {
            tenant: TenantToken::new("acme"),
            kind: RecordKind::Case,
            external_id: "100".to_string(),
            local_id: EntityId(7),
            content_fingerprint: Fingerprint::from_hex("ab"),
            last_synced_at: Utc::now(),
            last_sync_session_id: SessionId::new("4"),
        };

        let record = DeletionRecord::for_entry(&entry, &SessionId::new("5"));
        let json = serde_json::to_value(&record).unwrap();
        let mut keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        keys.sort();

        assert_eq!(
            keys,
            vec!["deleted_at", "external_id", "kind", "local_id", "session_id"]
        );
        assert_eq!(json["kind"], "case");
        assert_eq!(json["session_id"], "5");
    }
}
