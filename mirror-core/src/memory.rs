//! In-process implementations of every capability.
//!
//! Used as test doubles (they support failure injection) and as the lock
//! store for single-process deployments.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::capability::{AuditLog, LockStore, Mirror, Source};
use crate::error::{LockError, PersistError, SourceError};
use crate::fingerprint::Fingerprint;
use crate::lock::LockRecord;
use crate::models::{
    DeletionRecord, EntityDraft, EntityId, MediaRef, RecordKind, RegistryEntry, RegistryKey,
    RemoteRecord, SessionId, SyncRun, SyncStamp, TenantToken,
};

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Source
// ============================================================================

#[derive(Debug, Default)]
struct SourceState {
    categories: Vec<RemoteRecord>,
    procedures: Vec<RemoteRecord>,
    cases: Vec<RemoteRecord>,
    unavailable: bool,
    fail_cases_from_page: Option<u32>,
    case_pages_fetched: u32,
}

/// A catalog held in memory.
#[derive(Debug, Default)]
pub struct MemorySource {
    state: Mutex<SourceState>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(self, records: Vec<RemoteRecord>) -> Self {
        self.set_categories(records);
        self
    }

    pub fn with_procedures(self, records: Vec<RemoteRecord>) -> Self {
        self.set_procedures(records);
        self
    }

    pub fn with_cases(self, records: Vec<RemoteRecord>) -> Self {
        self.set_cases(records);
        self
    }

    pub fn set_categories(&self, records: Vec<RemoteRecord>) {
        guard(&self.state).categories = records;
    }

    pub fn set_procedures(&self, records: Vec<RemoteRecord>) {
        guard(&self.state).procedures = records;
    }

    pub fn set_cases(&self, records: Vec<RemoteRecord>) {
        guard(&self.state).cases = records;
    }

    /// Makes every call fail with `SourceError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        guard(&self.state).unavailable = unavailable;
    }

    /// Makes case page `page` and every later page fail.
    pub fn fail_cases_from_page(&self, page: u32) {
        guard(&self.state).fail_cases_from_page = Some(page);
    }

    pub fn case_pages_fetched(&self) -> u32 {
        guard(&self.state).case_pages_fetched
    }

    fn check_available(state: &SourceState) -> Result<(), SourceError> {
        if state.unavailable {
            return Err(SourceError::Unavailable("memory source offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn fetch_categories(&self) -> Result<Vec<RemoteRecord>, SourceError> {
        let state = guard(&self.state);
        Self::check_available(&state)?;
        Ok(state.categories.clone())
    }

    async fn fetch_procedures(&self) -> Result<Vec<RemoteRecord>, SourceError> {
        let state = guard(&self.state);
        Self::check_available(&state)?;
        Ok(state.procedures.clone())
    }

    async fn fetch_cases_page(
        &self,
        page: u32,
        size: u32,
    ) -> Result<Vec<RemoteRecord>, SourceError> {
        let mut state = guard(&self.state);
        Self::check_available(&state)?;
        if state.fail_cases_from_page.is_some_and(|from| page >= from) {
            return Err(SourceError::Unavailable(format!("page {} failed", page)));
        }
        state.case_pages_fetched += 1;

        let size = size.max(1) as usize;
        let start = (page.max(1) as usize - 1) * size;
        Ok(state.cases.iter().skip(start).take(size).cloned().collect())
    }

    async fn total_cases(&self) -> Result<u64, SourceError> {
        let state = guard(&self.state);
        Self::check_available(&state)?;
        Ok(state.cases.len() as u64)
    }

    async fn fetch_case(&self, external_id: &str) -> Result<Option<RemoteRecord>, SourceError> {
        let state = guard(&self.state);
        Self::check_available(&state)?;
        Ok(state
            .cases
            .iter()
            .find(|r| r.external_id == external_id)
            .cloned())
    }
}

// ============================================================================
// Mirror
// ============================================================================

/// An entity as held by [`MemoryMirror`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntity {
    pub local_id: EntityId,
    pub tenant: TenantToken,
    pub kind: RecordKind,
    pub external_id: String,
    pub title: String,
    pub slug: String,
    pub excerpt: String,
    pub payload: serde_json::Value,
    pub terms: Vec<EntityId>,
    pub media: Vec<MediaRef>,
}

#[derive(Debug, Default)]
struct MirrorState {
    next_id: i64,
    entities: BTreeMap<EntityId, StoredEntity>,
    registry: BTreeMap<RegistryKey, RegistryEntry>,
    payload_writes: u64,
    fail_upsert: HashSet<String>,
    fail_delete: HashSet<EntityId>,
    failing_stamps: u32,
    fail_names: bool,
    fail_media: HashSet<EntityId>,
}

impl MirrorState {
    fn allocate_id(&mut self) -> EntityId {
        self.next_id += 1;
        EntityId(self.next_id)
    }
}

#[derive(Debug, Default)]
pub struct MemoryMirror {
    state: Mutex<MirrorState>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an entity and its registry entry directly.
    pub fn insert_entry(&self, entry: RegistryEntry, title: &str) {
        let mut state = guard(&self.state);
        state.next_id = state.next_id.max(entry.local_id.0);
        state.entities.insert(
            entry.local_id,
            StoredEntity {
                local_id: entry.local_id,
                tenant: entry.tenant.clone(),
                kind: entry.kind,
                external_id: entry.external_id.clone(),
                title: title.to_string(),
                slug: String::new(),
                excerpt: String::new(),
                payload: serde_json::Value::Null,
                terms: Vec::new(),
                media: Vec::new(),
            },
        );
        state.registry.insert(entry.key(), entry);
    }

    pub fn entity(&self, local_id: EntityId) -> Option<StoredEntity> {
        guard(&self.state).entities.get(&local_id).cloned()
    }

    pub fn find_entity(
        &self,
        tenant: &TenantToken,
        kind: RecordKind,
        external_id: &str,
    ) -> Option<StoredEntity> {
        let state = guard(&self.state);
        let key = RegistryKey::new(tenant.clone(), kind, external_id);
        let entry = state.registry.get(&key)?;
        state.entities.get(&entry.local_id).cloned()
    }

    pub fn entity_count(&self) -> usize {
        guard(&self.state).entities.len()
    }

    pub fn registry_entries(&self) -> Vec<RegistryEntry> {
        guard(&self.state).registry.values().cloned().collect()
    }

    /// Number of entity payload writes (creates and updates) so far.
    pub fn payload_writes(&self) -> u64 {
        guard(&self.state).payload_writes
    }

    pub fn fail_upsert_for(&self, external_id: &str) {
        guard(&self.state).fail_upsert.insert(external_id.to_string());
    }

    pub fn fail_delete_for(&self, local_id: EntityId) {
        guard(&self.state).fail_delete.insert(local_id);
    }

    /// Makes the next `count` stamp writes fail.
    pub fn fail_next_stamps(&self, count: u32) {
        guard(&self.state).failing_stamps = count;
    }

    pub fn fail_display_names(&self, fail: bool) {
        guard(&self.state).fail_names = fail;
    }

    pub fn fail_media_for(&self, local_id: EntityId) {
        guard(&self.state).fail_media.insert(local_id);
    }

    pub fn clear_media_failures(&self) {
        guard(&self.state).fail_media.clear();
    }
}

#[async_trait]
impl Mirror for MemoryMirror {
    async fn registry_entry(&self, key: &RegistryKey) -> Result<Option<RegistryEntry>, PersistError> {
        Ok(guard(&self.state).registry.get(key).cloned())
    }

    async fn upsert_entity(
        &self,
        draft: &EntityDraft,
        terms: &[EntityId],
        stamp: &SyncStamp,
    ) -> Result<EntityId, PersistError> {
        let mut state = guard(&self.state);
        if state.fail_upsert.contains(&draft.external_id) {
            return Err(PersistError::new(format!(
                "injected upsert failure for {}",
                draft.external_id
            )));
        }

        let local_id = match draft.local_id {
            Some(id) if state.entities.contains_key(&id) => id,
            Some(id) => return Err(PersistError::new(format!("entity {} not found", id))),
            None => state.allocate_id(),
        };
        let media = state
            .entities
            .get(&local_id)
            .map(|e| e.media.clone())
            .unwrap_or_default();

        state.entities.insert(
            local_id,
            StoredEntity {
                local_id,
                tenant: draft.tenant.clone(),
                kind: draft.kind,
                external_id: draft.external_id.clone(),
                title: draft.title.clone(),
                slug: draft.slug.clone(),
                excerpt: draft.excerpt.clone(),
                payload: draft.payload.clone(),
                terms: terms.to_vec(),
                media,
            },
        );
        let key = RegistryKey::new(draft.tenant.clone(), draft.kind, draft.external_id.clone());
        state.registry.insert(
            key,
            RegistryEntry {
                tenant: draft.tenant.clone(),
                kind: draft.kind,
                external_id: draft.external_id.clone(),
                local_id,
                content_fingerprint: draft.fingerprint.clone(),
                last_synced_at: stamp.synced_at,
                last_sync_session_id: stamp.session_id.clone(),
            },
        );
        state.payload_writes += 1;
        Ok(local_id)
    }

    async fn stamp_entry(&self, key: &RegistryKey, stamp: &SyncStamp) -> Result<(), PersistError> {
        let mut state = guard(&self.state);
        if state.failing_stamps > 0 {
            state.failing_stamps -= 1;
            return Err(PersistError::new("injected stamp failure"));
        }
        let entry = state
            .registry
            .get_mut(key)
            .ok_or_else(|| PersistError::new(format!("no registry entry for {}", key)))?;
        entry.last_sync_session_id = stamp.session_id.clone();
        entry.last_synced_at = stamp.synced_at;
        Ok(())
    }

    async fn delete_entity(&self, entry: &RegistryEntry) -> Result<bool, PersistError> {
        let mut state = guard(&self.state);
        if state.fail_delete.contains(&entry.local_id) {
            return Err(PersistError::new(format!(
                "injected delete failure for entity {}",
                entry.local_id
            )));
        }
        if state.registry.remove(&entry.key()).is_none() {
            return Ok(false);
        }
        state.entities.remove(&entry.local_id);
        for entity in state.entities.values_mut() {
            entity.terms.retain(|t| *t != entry.local_id);
        }
        Ok(true)
    }

    async fn lookup_by_external_id(
        &self,
        tenant: &TenantToken,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<EntityId>, PersistError> {
        let key = RegistryKey::new(tenant.clone(), kind, external_id);
        Ok(guard(&self.state).registry.get(&key).map(|e| e.local_id))
    }

    async fn lookup_term(
        &self,
        tenant: &TenantToken,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<EntityId>, PersistError> {
        if !kind.is_taxonomy() {
            return Ok(None);
        }
        self.lookup_by_external_id(tenant, kind, external_id).await
    }

    async fn entries_outside_session(
        &self,
        tenant: &TenantToken,
        session_id: &SessionId,
        kind: Option<RecordKind>,
    ) -> Result<Vec<RegistryEntry>, PersistError> {
        Ok(guard(&self.state)
            .registry
            .values()
            .filter(|e| &e.tenant == tenant)
            .filter(|e| &e.last_sync_session_id != session_id)
            .filter(|e| kind.map_or(true, |k| e.kind == k))
            .cloned()
            .collect())
    }

    async fn display_name(&self, local_id: EntityId) -> Result<Option<String>, PersistError> {
        let state = guard(&self.state);
        if state.fail_names {
            return Err(PersistError::new("injected name lookup failure"));
        }
        Ok(state.entities.get(&local_id).map(|e| e.title.clone()))
    }

    async fn attach_media(&self, local_id: EntityId, media: &[MediaRef]) -> Result<(), PersistError> {
        let mut state = guard(&self.state);
        if state.fail_media.contains(&local_id) {
            return Err(PersistError::new(format!(
                "injected media failure for entity {}",
                local_id
            )));
        }
        let entity = state
            .entities
            .get_mut(&local_id)
            .ok_or_else(|| PersistError::new(format!("entity {} not found", local_id)))?;
        entity.media = media.to_vec();
        Ok(())
    }

    async fn has_media(&self, local_id: EntityId) -> Result<bool, PersistError> {
        Ok(guard(&self.state)
            .entities
            .get(&local_id)
            .map_or(false, |e| !e.media.is_empty()))
    }

    async fn mark_pending(&self, key: &RegistryKey) -> Result<(), PersistError> {
        let mut state = guard(&self.state);
        let entry = state
            .registry
            .get_mut(key)
            .ok_or_else(|| PersistError::new(format!("no registry entry for {}", key)))?;
        entry.content_fingerprint = Fingerprint::pending();
        Ok(())
    }
}

// ============================================================================
// Audit log
// ============================================================================

#[derive(Debug, Default)]
struct AuditState {
    runs: Vec<SyncRun>,
    deletions: Vec<DeletionRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    state: Mutex<AuditState>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> Vec<SyncRun> {
        guard(&self.state).runs.clone()
    }

    pub fn run(&self, session_id: &SessionId) -> Option<SyncRun> {
        guard(&self.state)
            .runs
            .iter()
            .find(|r| &r.session_id == session_id)
            .cloned()
    }

    pub fn deletions(&self) -> Vec<DeletionRecord> {
        guard(&self.state).deletions.clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(&self, run: &SyncRun) -> Result<(), PersistError> {
        let mut state = guard(&self.state);
        match state.runs.iter_mut().find(|r| r.session_id == run.session_id) {
            Some(existing) if existing.status.is_final() => Err(PersistError::new(format!(
                "run {} is already finalized",
                run.session_id
            ))),
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => {
                state.runs.push(run.clone());
                Ok(())
            }
        }
    }

    async fn record_deletion(&self, record: &DeletionRecord) -> Result<(), PersistError> {
        guard(&self.state).deletions.push(record.clone());
        Ok(())
    }

    async fn recent_runs(
        &self,
        tenant: &TenantToken,
        limit: usize,
    ) -> Result<Vec<SyncRun>, PersistError> {
        Ok(guard(&self.state)
            .runs
            .iter()
            .rev()
            .filter(|r| &r.tenant == tenant)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_run(&self, session_id: &SessionId) -> Result<Option<SyncRun>, PersistError> {
        Ok(self.run(session_id))
    }
}

// ============================================================================
// Lock store
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    entries: Mutex<HashMap<String, LockRecord>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn load(&self, key: &str) -> Result<Option<LockRecord>, LockError> {
        Ok(guard(&self.entries).get(key).cloned())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&LockRecord>,
        new: Option<&LockRecord>,
    ) -> Result<bool, LockError> {
        let mut entries = guard(&self.entries);
        if entries.get(key) != expected {
            return Ok(false);
        }
        match new {
            Some(record) => entries.insert(key.to_string(), record.clone()),
            None => entries.remove(key),
        };
        Ok(true)
    }
}
