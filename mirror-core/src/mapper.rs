//! Conversion of remote records into entity drafts.
//!
//! Payloads are read through typed views with camelCase field names. Ids may
//! arrive as JSON strings or numbers.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::MappingError;
use crate::fingerprint::fingerprint;
use crate::models::{
    EntityDraft, EntityId, MediaRef, RecordKind, RegistryKey, RemoteRecord, TenantToken, TermRef,
};

const MAX_EXTERNAL_ID_LEN: usize = 128;
const EXCERPT_MAX_CHARS: usize = 160;

/// Name and slug of a procedure seen during the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureSummary {
    pub name: String,
    pub slug: String,
}

/// Procedures known to the current run, keyed by external id.
///
/// Filled during the procedure stage and used to derive case titles and slugs.
#[derive(Debug, Clone, Default)]
pub struct ProcedureIndex {
    entries: HashMap<String, ProcedureSummary>,
}

impl ProcedureIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, external_id: impl Into<String>, summary: ProcedureSummary) {
        self.entries.insert(external_id.into(), summary);
    }

    pub fn get(&self, external_id: &str) -> Option<&ProcedureSummary> {
        self.entries.get(external_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TermFields {
    name: Option<String>,
    slug: Option<String>,
    description: Option<String>,
    #[serde(default, deserialize_with = "flex_id")]
    parent_id: Option<String>,
    #[serde(default, deserialize_with = "flex_id")]
    category_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaseFields {
    title: Option<String>,
    summary: Option<String>,
    details: Option<String>,
    #[serde(default, deserialize_with = "flex_ids")]
    procedure_ids: Vec<String>,
    #[serde(default)]
    procedures: Vec<EmbeddedProcedure>,
    patient: Option<Patient>,
    seo: Option<Seo>,
    #[serde(default)]
    photo_sets: Vec<PhotoSet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddedProcedure {
    #[serde(default, deserialize_with = "flex_id")]
    id: Option<String>,
    name: Option<String>,
    slug: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Patient {
    #[serde(default, deserialize_with = "flex_id")]
    age: Option<String>,
    gender: Option<String>,
    ethnicity: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Seo {
    title: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhotoSet {
    before_url: Option<String>,
    after_url: Option<String>,
    caption: Option<String>,
}

fn flex_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| value_to_id(&v)))
}

fn flex_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(value
        .unwrap_or_default()
        .iter()
        .filter_map(value_to_id)
        .collect())
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Validates a record's external id and builds its registry key.
pub fn record_key(tenant: &TenantToken, record: &RemoteRecord) -> Result<RegistryKey, MappingError> {
    validate_external_id(record)?;
    Ok(RegistryKey::new(
        tenant.clone(),
        record.kind,
        record.external_id.clone(),
    ))
}

fn validate_external_id(record: &RemoteRecord) -> Result<(), MappingError> {
    let id = record.external_id.as_str();
    if id.trim().is_empty() {
        return Err(MappingError::MissingExternalId { kind: record.kind });
    }
    let well_formed = id.len() <= MAX_EXTERNAL_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
    if !well_formed {
        return Err(MappingError::MalformedExternalId {
            kind: record.kind,
            external_id: id.to_string(),
        });
    }
    Ok(())
}

/// Extracts the index entry for a procedure record without building a draft.
pub fn procedure_summary(record: &RemoteRecord) -> Option<ProcedureSummary> {
    if record.kind != RecordKind::Procedure {
        return None;
    }
    let fields: TermFields = parse_payload(record).ok()?;
    let name = non_empty(fields.name.as_deref())?.to_string();
    let slug = fields
        .slug
        .as_deref()
        .map(slugify)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| slugify(&name));
    Some(ProcedureSummary { name, slug })
}

/// External id of the category a taxonomy record hangs off, if any.
pub fn term_parent(record: &RemoteRecord) -> Option<String> {
    if !record.kind.is_taxonomy() {
        return None;
    }
    let fields: TermFields = parse_payload(record).unwrap_or_default();
    parent_of(record, fields.parent_id, fields.category_id)
}

// Procedures hang off a category; categories may nest.
fn parent_of(
    record: &RemoteRecord,
    parent_id: Option<String>,
    category_id: Option<String>,
) -> Option<String> {
    record
        .parent_external_id
        .clone()
        .or(parent_id)
        .or(category_id)
        .filter(|p| p != &record.external_id)
}

/// Builds drafts for one tenant, using procedures already seen in the run.
pub struct EntityMapper<'a> {
    tenant: &'a TenantToken,
    procedures: &'a ProcedureIndex,
}

impl<'a> EntityMapper<'a> {
    pub fn new(tenant: &'a TenantToken, procedures: &'a ProcedureIndex) -> Self {
        Self { tenant, procedures }
    }

    /// Draft for an entity that does not exist locally yet.
    pub fn to_create(&self, record: &RemoteRecord) -> Result<EntityDraft, MappingError> {
        self.build(record, None)
    }

    /// Draft that overwrites the existing entity `local_id`.
    pub fn to_update(
        &self,
        record: &RemoteRecord,
        local_id: EntityId,
    ) -> Result<EntityDraft, MappingError> {
        self.build(record, Some(local_id))
    }

    fn build(
        &self,
        record: &RemoteRecord,
        local_id: Option<EntityId>,
    ) -> Result<EntityDraft, MappingError> {
        validate_external_id(record)?;

        let mut draft = EntityDraft {
            tenant: self.tenant.clone(),
            kind: record.kind,
            external_id: record.external_id.clone(),
            local_id,
            title: String::new(),
            slug: String::new(),
            excerpt: String::new(),
            payload: record.payload.clone(),
            fingerprint: fingerprint(record),
            term_refs: Vec::new(),
            media: Vec::new(),
        };

        match record.kind {
            RecordKind::Category | RecordKind::Procedure => {
                self.fill_term(record, parse_payload(record)?, &mut draft)
            }
            RecordKind::Case => self.fill_case(record, parse_payload(record)?, &mut draft),
        }

        Ok(draft)
    }

    fn fill_term(&self, record: &RemoteRecord, fields: TermFields, draft: &mut EntityDraft) {
        let kind = record.kind;
        draft.title = non_empty(fields.name.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} {}", capitalize(kind.as_str()), record.external_id));
        draft.slug = [fields.slug.as_deref(), fields.name.as_deref()]
            .into_iter()
            .flatten()
            .map(slugify)
            .find(|s| !s.is_empty())
            .unwrap_or_else(|| synthetic_slug(kind.as_str(), &record.external_id));
        draft.excerpt = fields
            .description
            .as_deref()
            .map(trim_excerpt)
            .unwrap_or_default();

        if let Some(parent) = parent_of(record, fields.parent_id, fields.category_id) {
            draft.term_refs.push(TermRef::new(RecordKind::Category, parent));
        }
    }

    fn fill_case(&self, record: &RemoteRecord, fields: CaseFields, draft: &mut EntityDraft) {
        let mut procedure_ids = fields.procedure_ids.clone();
        if let Some(parent) = &record.parent_external_id {
            procedure_ids.push(parent.clone());
        }
        for embedded in &fields.procedures {
            if let Some(id) = &embedded.id {
                procedure_ids.push(id.clone());
            }
        }
        let mut seen = std::collections::HashSet::new();
        procedure_ids.retain(|id| seen.insert(id.clone()));

        let procedures: Vec<ProcedureSummary> = procedure_ids
            .iter()
            .filter_map(|id| self.resolve_procedure(id, &fields.procedures))
            .collect();
        let procedure_names: Vec<&str> = procedures.iter().map(|p| p.name.as_str()).collect();
        let descriptors = fields
            .patient
            .as_ref()
            .map(patient_descriptors)
            .unwrap_or_default();

        draft.title = non_empty(fields.title.as_deref())
            .or_else(|| non_empty(fields.seo.as_ref().and_then(|s| s.title.as_deref())))
            .map(str::to_string)
            .or_else(|| derived_case_title(&procedure_names, &descriptors))
            .unwrap_or_else(|| format!("Case {}", record.external_id));

        draft.excerpt = non_empty(fields.summary.as_deref())
            .or_else(|| non_empty(fields.seo.as_ref().and_then(|s| s.description.as_deref())))
            .map(trim_excerpt)
            .or_else(|| non_empty(fields.details.as_deref()).map(trim_excerpt))
            .or_else(|| synthesized_case_excerpt(&procedure_names, fields.patient.as_ref()))
            .unwrap_or_default();

        let id_slug = slugify(&record.external_id);
        draft.slug = if id_slug.is_empty() {
            synthetic_slug("case", &record.external_id)
        } else {
            let mut parts: Vec<String> = procedures
                .iter()
                .map(|p| p.slug.clone())
                .filter(|s| !s.is_empty())
                .collect();
            parts.push(format!("case-{}", id_slug));
            parts.join("-")
        };

        draft.term_refs = procedure_ids
            .into_iter()
            .map(|id| TermRef::new(RecordKind::Procedure, id))
            .collect();

        for set in fields.photo_sets {
            for url in [set.before_url, set.after_url].into_iter().flatten() {
                if url.trim().is_empty() {
                    continue;
                }
                draft.media.push(MediaRef {
                    url: url.trim().to_string(),
                    caption: set.caption.clone().filter(|c| !c.trim().is_empty()),
                });
            }
        }
    }

    fn resolve_procedure(
        &self,
        external_id: &str,
        embedded: &[EmbeddedProcedure],
    ) -> Option<ProcedureSummary> {
        if let Some(summary) = self.procedures.get(external_id) {
            return Some(summary.clone());
        }
        let embedded = embedded
            .iter()
            .find(|p| p.id.as_deref() == Some(external_id))?;
        let name = non_empty(embedded.name.as_deref())?.to_string();
        let slug = embedded
            .slug
            .as_deref()
            .map(slugify)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| slugify(&name));
        Some(ProcedureSummary { name, slug })
    }
}

fn parse_payload<T>(record: &RemoteRecord) -> Result<T, MappingError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if record.payload.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(record.payload.clone()).map_err(|e| MappingError::InvalidPayload {
        kind: record.kind,
        external_id: record.external_id.clone(),
        message: e.to_string(),
    })
}

fn patient_descriptors(patient: &Patient) -> Vec<String> {
    let mut descriptors = Vec::new();
    if let Some(gender) = non_empty(patient.gender.as_deref()) {
        descriptors.push(gender.to_lowercase());
    }
    if let Some(age) = non_empty(patient.age.as_deref()) {
        descriptors.push(age.to_string());
    }
    if let Some(ethnicity) = non_empty(patient.ethnicity.as_deref()) {
        descriptors.push(ethnicity.to_string());
    }
    descriptors
}

fn derived_case_title(procedure_names: &[&str], descriptors: &[String]) -> Option<String> {
    if procedure_names.is_empty() {
        return None;
    }
    let names = procedure_names.join(", ");
    if descriptors.is_empty() {
        Some(names)
    } else {
        Some(format!("{} ({})", names, descriptors.join(", ")))
    }
}

fn synthesized_case_excerpt(procedure_names: &[&str], patient: Option<&Patient>) -> Option<String> {
    if procedure_names.is_empty() {
        return None;
    }
    let names = procedure_names.join(", ");
    let age = patient.and_then(|p| non_empty(p.age.as_deref()));
    let gender = patient.and_then(|p| non_empty(p.gender.as_deref()));
    let text = match (age, gender) {
        (Some(age), Some(gender)) => format!(
            "{} case for a {}-year-old {} patient.",
            names,
            age,
            gender.to_lowercase()
        ),
        (Some(age), None) => format!("{} case for a {}-year-old patient.", names, age),
        (None, Some(gender)) => format!("{} case for a {} patient.", names, gender.to_lowercase()),
        (None, None) => format!("{} case.", names),
    };
    Some(text)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Collapses whitespace and cuts at a word boundary.
fn trim_excerpt(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= EXCERPT_MAX_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(EXCERPT_MAX_CHARS).collect();
    let cut = match cut.rfind(' ') {
        Some(pos) if pos > 0 => cut[..pos].to_string(),
        _ => cut,
    };
    format!("{}...", cut.trim_end_matches(|c: char| c.is_ascii_punctuation()))
}

/// Lowercase ASCII slug with single dashes between words.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Slug derived from a digest of the external id. Unique per external id.
fn synthetic_slug(prefix: &str, external_id: &str) -> String {
    let digest = Sha256::digest(external_id.as_bytes());
    let suffix: String = digest
        .iter()
        .take(6)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}-{}", prefix, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant() -> TenantToken {
        TenantToken::new("acme")
    }

    fn index_with_augmentation() -> ProcedureIndex {
        let mut index = ProcedureIndex::new();
        index.insert(
            "10",
            ProcedureSummary {
                name: "Augmentation".to_string(),
                slug: "augmentation".to_string(),
            },
        );
        index
    }

    #[test]
    fn test_category_draft() {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        let mapper = EntityMapper::new(&tenant, &index);
        let record = RemoteRecord::new(RecordKind::Category, "1", json!({"id": 1, "name": "Breast"}));

        let draft = mapper.to_create(&record).unwrap();

        assert_eq!(draft.title, "Breast");
        assert_eq!(draft.slug, "breast");
        assert_eq!(draft.local_id, None);
        assert!(draft.term_refs.is_empty());
        assert_eq!(draft.fingerprint, fingerprint(&record));
    }

    #[test]
    fn test_procedure_links_parent_category() {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        let mapper = EntityMapper::new(&tenant, &index);
        let record = RemoteRecord::new(
            RecordKind::Procedure,
            "10",
            json!({"id": 10, "name": "Augmentation", "parentId": 1}),
        );

        let draft = mapper.to_update(&record, EntityId(4)).unwrap();

        assert_eq!(draft.local_id, Some(EntityId(4)));
        assert_eq!(draft.term_refs, vec![TermRef::new(RecordKind::Category, "1")]);
    }

    #[test]
    fn test_case_with_explicit_title() {
        let tenant = tenant();
        let index = index_with_augmentation();
        let mapper = EntityMapper::new(&tenant, &index);
        let record = RemoteRecord::new(
            RecordKind::Case,
            "100",
            json!({"id": 100, "title": "Augmentation", "procedureIds": [10]}),
        );

        let draft = mapper.to_create(&record).unwrap();

        assert_eq!(draft.title, "Augmentation");
        assert_eq!(draft.slug, "augmentation-case-100");
        assert_eq!(draft.term_refs, vec![TermRef::new(RecordKind::Procedure, "10")]);
        assert_eq!(draft.excerpt, "Augmentation case.");
    }

    #[test]
    fn test_case_title_derived_from_procedures_and_patient() {
        let tenant = tenant();
        let index = index_with_augmentation();
        let mapper = EntityMapper::new(&tenant, &index);
        let record = RemoteRecord::new(
            RecordKind::Case,
            "101",
            json!({
                "procedureIds": ["10", 11],
                "procedures": [{"id": 11, "name": "Breast Lift"}],
                "patient": {"age": 41, "gender": "Female"}
            }),
        );

        let draft = mapper.to_create(&record).unwrap();

        assert_eq!(draft.title, "Augmentation, Breast Lift (female, 41)");
        assert_eq!(draft.slug, "augmentation-breast-lift-case-101");
        assert_eq!(
            draft.excerpt,
            "Augmentation, Breast Lift case for a 41-year-old female patient."
        );
    }

    #[test]
    fn test_case_title_falls_back_to_external_id() {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        let mapper = EntityMapper::new(&tenant, &index);
        let record = RemoteRecord::new(RecordKind::Case, "102", json!({}));

        let draft = mapper.to_create(&record).unwrap();

        assert_eq!(draft.title, "Case 102");
        assert_eq!(draft.slug, "case-102");
        assert_eq!(draft.excerpt, "");
    }

    #[test]
    fn test_case_excerpt_prefers_summary_then_details() {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        let mapper = EntityMapper::new(&tenant, &index);

        let with_summary = RemoteRecord::new(
            RecordKind::Case,
            "1",
            json!({"summary": " Short  summary ", "details": "Long details"}),
        );
        assert_eq!(mapper.to_create(&with_summary).unwrap().excerpt, "Short summary");

        let long_details = "word ".repeat(60);
        let with_details = RemoteRecord::new(RecordKind::Case, "2", json!({"details": long_details}));
        let excerpt = mapper.to_create(&with_details).unwrap().excerpt;
        assert!(excerpt.ends_with("..."));
        assert!(excerpt.chars().count() <= EXCERPT_MAX_CHARS + 3);
    }

    #[test]
    fn test_case_media_from_photo_sets() {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        let mapper = EntityMapper::new(&tenant, &index);
        let record = RemoteRecord::new(
            RecordKind::Case,
            "5",
            json!({"photoSets": [
                {"beforeUrl": "https://cdn.example.com/b1.jpg", "afterUrl": "https://cdn.example.com/a1.jpg", "caption": "Front"},
                {"beforeUrl": "", "afterUrl": null}
            ]}),
        );

        let draft = mapper.to_create(&record).unwrap();

        assert_eq!(draft.media.len(), 2);
        assert_eq!(draft.media[0].url, "https://cdn.example.com/b1.jpg");
        assert_eq!(draft.media[1].caption.as_deref(), Some("Front"));
    }

    #[test]
    fn test_missing_external_id_fails() {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        let mapper = EntityMapper::new(&tenant, &index);
        let record = RemoteRecord::new(RecordKind::Case, "  ", json!({}));

        assert_eq!(
            mapper.to_create(&record).unwrap_err(),
            MappingError::MissingExternalId {
                kind: RecordKind::Case
            }
        );
    }

    #[test]
    fn test_malformed_external_id_fails() {
        let record = RemoteRecord::new(RecordKind::Procedure, "10; DROP", json!({}));
        assert!(matches!(
            record_key(&tenant(), &record),
            Err(MappingError::MalformedExternalId { .. })
        ));
    }

    #[test]
    fn test_invalid_payload_fails() {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        let mapper = EntityMapper::new(&tenant, &index);
        let record = RemoteRecord::new(RecordKind::Case, "7", json!({"title": ["not", "a", "string"]}));

        assert!(matches!(
            mapper.to_create(&record),
            Err(MappingError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_synthetic_slug_when_id_has_no_slug_characters() {
        let tenant = tenant();
        let index = ProcedureIndex::new();
        let mapper = EntityMapper::new(&tenant, &index);
        let a = mapper.to_create(&RemoteRecord::new(RecordKind::Case, "..", json!({}))).unwrap();
        let b = mapper.to_create(&RemoteRecord::new(RecordKind::Case, "...", json!({}))).unwrap();

        assert!(a.slug.starts_with("case-"));
        assert_ne!(a.slug, b.slug);
    }

    #[test]
    fn test_procedure_summary() {
        let record = RemoteRecord::new(
            RecordKind::Procedure,
            "10",
            json!({"name": "Tummy Tuck", "slug": "Abdominoplasty"}),
        );
        let summary = procedure_summary(&record).unwrap();
        assert_eq!(summary.name, "Tummy Tuck");
        assert_eq!(summary.slug, "abdominoplasty");

        let category = RemoteRecord::new(RecordKind::Category, "1", json!({"name": "Breast"}));
        assert!(procedure_summary(&category).is_none());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Breast Lift & Augmentation"), "breast-lift-augmentation");
        assert_eq!(slugify("  --Hello--  "), "hello");
        assert_eq!(slugify("..."), "");
    }
}
