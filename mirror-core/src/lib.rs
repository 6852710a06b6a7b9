//! Catalog Mirror Core Library
//!
//! Reconciles a remote catalog (categories, procedures and cases) into a
//! local store: fingerprinting, mapping, change detection, the tenant sync
//! lock, the staged run orchestrator and the orphan reconciler. Storage and
//! transport are reached through the traits in [`capability`].

pub mod capability;
pub mod detector;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod mapper;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod reconciler;

pub use capability::{AuditLog, LockStore, Mirror, Source};
pub use detector::{ChangeDetector, Classification, Detection};
pub use error::{
    LockError, MappingError, PersistError, ReconciliationError, RecordError, SessionError,
    SourceError, SyncError,
};
pub use fingerprint::{canonical_json, fingerprint, Fingerprint};
pub use lock::{LockRecord, LockToken, SyncLock};
pub use mapper::{EntityMapper, ProcedureIndex, ProcedureSummary};
pub use models::{
    DeletionRecord, EntityDraft, EntityId, MediaRef, RecordKind, RegistryEntry, RegistryKey,
    RemoteRecord, RunScope, RunStatus, RunTrigger, SessionId, SyncRun, SyncStamp, TenantToken,
    TermRef,
};
pub use orchestrator::{
    Orchestrator, Progress, RunHandle, RunPhase, RunSnapshot, Stage, SyncOptions,
};
pub use reconciler::{
    DeletionOutcome, OrphanCandidate, OrphanReconciler, OrphanReport, ReferenceSession,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
