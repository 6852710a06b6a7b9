//! Decides whether a remote record needs a local write.

use crate::fingerprint::{fingerprint, Fingerprint};
use crate::models::{EntityId, RegistryEntry, RemoteRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// No registry entry yet.
    Create,
    /// Content changed (or updates are forced).
    Update(EntityId),
    /// Same fingerprint as the stored one. Only the session stamp is refreshed.
    Unchanged(EntityId),
}

impl Classification {
    pub fn local_id(&self) -> Option<EntityId> {
        match self {
            Classification::Create => None,
            Classification::Update(id) | Classification::Unchanged(id) => Some(*id),
        }
    }

    pub fn needs_write(&self) -> bool {
        !matches!(self, Classification::Unchanged(_))
    }
}

/// Result of classifying one record, with the fingerprint computed on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub classification: Classification,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeDetector {
    force_update: bool,
}

impl ChangeDetector {
    pub fn new(force_update: bool) -> Self {
        Self { force_update }
    }

    /// Classifies `record` against the registry entry stored for the same
    /// `(tenant, kind, external_id)`, if any.
    pub fn classify(&self, record: &RemoteRecord, existing: Option<&RegistryEntry>) -> Detection {
        let fingerprint = fingerprint(record);
        let classification = match existing {
            None => Classification::Create,
            Some(entry) if self.force_update || entry.content_fingerprint != fingerprint => {
                Classification::Update(entry.local_id)
            }
            Some(entry) => Classification::Unchanged(entry.local_id),
        };
        Detection {
            classification,
            fingerprint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordKind, SessionId, TenantToken};
    use chrono::Utc;
    use serde_json::json;

    fn entry_for(record: &RemoteRecord, local_id: i64) -> RegistryEntry {
        RegistryEntry {
            tenant: TenantToken::new("acme"),
            kind: record.kind,
            external_id: record.external_id.clone(),
            local_id: EntityId(local_id),
            content_fingerprint: fingerprint(record),
            last_synced_at: Utc::now(),
            last_sync_session_id: SessionId::new("1"),
        }
    }

    #[test]
    fn test_absent_entry_is_create() {
        let record = RemoteRecord::new(RecordKind::Case, "100", json!({"title": "A"}));
        let detection = ChangeDetector::default().classify(&record, None);
        assert_eq!(detection.classification, Classification::Create);
        assert!(detection.classification.needs_write());
    }

    #[test]
    fn test_unchanged_is_stable_across_calls() {
        let record = RemoteRecord::new(RecordKind::Case, "100", json!({"title": "A"}));
        let entry = entry_for(&record, 3);
        let detector = ChangeDetector::default();

        let first = detector.classify(&record, Some(&entry));
        let second = detector.classify(&record, Some(&entry));

        assert_eq!(first.classification, Classification::Unchanged(EntityId(3)));
        assert_eq!(second, first);
        assert!(!first.classification.needs_write());
    }

    #[test]
    fn test_changed_fingerprint_is_update() {
        let old = RemoteRecord::new(RecordKind::Case, "100", json!({"title": "A"}));
        let entry = entry_for(&old, 3);
        let new = RemoteRecord::new(RecordKind::Case, "100", json!({"title": "B"}));

        let detection = ChangeDetector::default().classify(&new, Some(&entry));

        assert_eq!(detection.classification, Classification::Update(EntityId(3)));
        assert_eq!(detection.fingerprint, fingerprint(&new));
    }

    #[test]
    fn test_force_update_overrides_equal_fingerprint() {
        let record = RemoteRecord::new(RecordKind::Procedure, "10", json!({"name": "Lift"}));
        let entry = entry_for(&record, 9);

        let detection = ChangeDetector::new(true).classify(&record, Some(&entry));

        assert_eq!(detection.classification, Classification::Update(EntityId(9)));
        assert_eq!(detection.classification.local_id(), Some(EntityId(9)));
    }
}
