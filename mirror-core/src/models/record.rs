use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The three kinds of record the external catalog exposes.
///
/// Categories and procedures form the taxonomy; cases are tagged with
/// procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Category,
    Procedure,
    Case,
}

impl RecordKind {
    /// All kinds in stage order.
    pub const ALL: [RecordKind; 3] = [RecordKind::Category, RecordKind::Procedure, RecordKind::Case];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Category => "category",
            RecordKind::Procedure => "procedure",
            RecordKind::Case => "case",
        }
    }

    /// Returns true for kinds that are mirrored as taxonomy terms.
    pub fn is_taxonomy(&self) -> bool {
        matches!(self, RecordKind::Category | RecordKind::Procedure)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "category" | "categories" => Ok(RecordKind::Category),
            "procedure" | "procedures" => Ok(RecordKind::Procedure),
            "case" | "cases" => Ok(RecordKind::Case),
            _ => Err(format!(
                "Invalid record kind '{}'. Valid options: category, procedure, case",
                s
            )),
        }
    }
}

/// Isolation key for one synced external account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantToken(String);

impl TenantToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantToken {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Local identifier of a mirrored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record as returned by the external catalog.
///
/// The payload is the record's JSON object as delivered upstream; the mapper
/// reads it through typed views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub external_id: String,
    pub kind: RecordKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_external_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RemoteRecord {
    pub fn new(kind: RecordKind, external_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            external_id: external_id.into(),
            kind,
            parent_external_id: None,
            payload,
        }
    }

    pub fn with_parent(mut self, parent_external_id: impl Into<String>) -> Self {
        self.parent_external_id = Some(parent_external_id.into());
        self
    }
}
