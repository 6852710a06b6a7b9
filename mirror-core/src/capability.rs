//! Capabilities the engine consumes from its collaborators.
//!
//! The root application provides HTTP and SQLite implementations;
//! [`crate::memory`] provides in-process ones.

use async_trait::async_trait;

use crate::error::{LockError, PersistError, SourceError};
use crate::lock::LockRecord;
use crate::models::{
    DeletionRecord, EntityDraft, EntityId, MediaRef, RecordKind, RegistryEntry, RegistryKey,
    RemoteRecord, SessionId, SyncRun, SyncStamp, TenantToken,
};

/// The authoritative external catalog.
///
/// Implementations must bound every network call with a timeout.
#[async_trait]
pub trait Source: Send + Sync {
    async fn fetch_categories(&self) -> Result<Vec<RemoteRecord>, SourceError>;

    async fn fetch_procedures(&self) -> Result<Vec<RemoteRecord>, SourceError>;

    /// One page of cases. Pages are 1-based; an empty page ends the listing.
    async fn fetch_cases_page(&self, page: u32, size: u32)
        -> Result<Vec<RemoteRecord>, SourceError>;

    async fn total_cases(&self) -> Result<u64, SourceError>;

    async fn fetch_case(&self, external_id: &str) -> Result<Option<RemoteRecord>, SourceError>;
}

/// The local read-optimized store and its registry.
///
/// Entity rows and registry rows are always written and removed together.
#[async_trait]
pub trait Mirror: Send + Sync {
    async fn registry_entry(&self, key: &RegistryKey) -> Result<Option<RegistryEntry>, PersistError>;

    /// Creates the entity when `draft.local_id` is `None`, otherwise
    /// overwrites it. Writes the registry entry (fingerprint and stamp) in
    /// the same unit.
    async fn upsert_entity(
        &self,
        draft: &EntityDraft,
        terms: &[EntityId],
        stamp: &SyncStamp,
    ) -> Result<EntityId, PersistError>;

    /// Refreshes the session stamp of an existing registry entry.
    async fn stamp_entry(&self, key: &RegistryKey, stamp: &SyncStamp) -> Result<(), PersistError>;

    /// Deletes the entity (cascading its relations) and its registry entry.
    ///
    /// Returns `false` when the registry entry no longer exists.
    async fn delete_entity(&self, entry: &RegistryEntry) -> Result<bool, PersistError>;

    async fn lookup_by_external_id(
        &self,
        tenant: &TenantToken,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<EntityId>, PersistError>;

    /// Like `lookup_by_external_id`, restricted to taxonomy kinds.
    async fn lookup_term(
        &self,
        tenant: &TenantToken,
        kind: RecordKind,
        external_id: &str,
    ) -> Result<Option<EntityId>, PersistError>;

    /// Registry entries of `tenant` whose session stamp differs from `session_id`.
    async fn entries_outside_session(
        &self,
        tenant: &TenantToken,
        session_id: &SessionId,
        kind: Option<RecordKind>,
    ) -> Result<Vec<RegistryEntry>, PersistError>;

    async fn display_name(&self, local_id: EntityId) -> Result<Option<String>, PersistError>;

    /// Replaces the media attached to an entity.
    async fn attach_media(&self, local_id: EntityId, media: &[MediaRef]) -> Result<(), PersistError>;

    async fn has_media(&self, local_id: EntityId) -> Result<bool, PersistError>;

    /// Replaces the stored fingerprint with [`Fingerprint::pending`] so the
    /// next run rewrites the entity.
    ///
    /// [`Fingerprint::pending`]: crate::fingerprint::Fingerprint::pending
    async fn mark_pending(&self, key: &RegistryKey) -> Result<(), PersistError>;
}

/// Append-only run log and deletion audit trail.
#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Inserts or finalizes the log row for `run.session_id`.
    async fn record(&self, run: &SyncRun) -> Result<(), PersistError>;

    async fn record_deletion(&self, record: &DeletionRecord) -> Result<(), PersistError>;

    /// Most recent runs for a tenant, newest first.
    async fn recent_runs(&self, tenant: &TenantToken, limit: usize)
        -> Result<Vec<SyncRun>, PersistError>;

    async fn find_run(&self, session_id: &SessionId) -> Result<Option<SyncRun>, PersistError>;
}

/// Shared key space with an atomic compare-and-set.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<LockRecord>, LockError>;

    /// Replaces the value at `key` with `new` only if it currently equals
    /// `expected`. Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&LockRecord>,
        new: Option<&LockRecord>,
    ) -> Result<bool, LockError>;
}
