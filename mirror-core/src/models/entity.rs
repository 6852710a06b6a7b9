use serde::{Deserialize, Serialize};

use super::record::{EntityId, RecordKind, TenantToken};
use crate::fingerprint::Fingerprint;

/// Reference to a taxonomy term by its external identity.
///
/// Resolved to a local [`EntityId`] through `Mirror::lookup_term` right
/// before the draft is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermRef {
    pub kind: RecordKind,
    pub external_id: String,
}

impl TermRef {
    pub fn new(kind: RecordKind, external_id: impl Into<String>) -> Self {
        Self {
            kind,
            external_id: external_id.into(),
        }
    }
}

/// A photo reference attached to a case during the media stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

/// Create/update representation of a mirror entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    pub tenant: TenantToken,
    pub kind: RecordKind,
    pub external_id: String,
    /// Target entity for updates; `None` creates a new entity.
    pub local_id: Option<EntityId>,
    pub title: String,
    pub slug: String,
    pub excerpt: String,
    pub payload: serde_json::Value,
    pub fingerprint: Fingerprint,
    pub term_refs: Vec<TermRef>,
    pub media: Vec<MediaRef>,
}

impl EntityDraft {
    pub fn is_update(&self) -> bool {
        self.local_id.is_some()
    }
}
