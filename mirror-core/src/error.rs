//! Error taxonomy for the sync engine.

use std::time::Duration;
use thiserror::Error;

use crate::models::{EntityId, RecordKind, RunScope, RunStatus, SessionId, TenantToken};
use crate::orchestrator::Stage;

/// A remote record could not be turned into an entity draft.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("{kind} record is missing an external id")]
    MissingExternalId { kind: RecordKind },

    #[error("{kind} record has a malformed external id '{external_id}'")]
    MalformedExternalId {
        kind: RecordKind,
        external_id: String,
    },

    #[error("{kind} '{external_id}' has an invalid payload: {message}")]
    InvalidPayload {
        kind: RecordKind,
        external_id: String,
        message: String,
    },
}

/// A local write or read against the mirror failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mirror write failed: {message}")]
pub struct PersistError {
    pub message: String,
}

impl PersistError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The external catalog could not be reached or returned garbage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source request timed out after {0:?}")]
    Timeout(Duration),

    #[error("source returned an unexpected response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("sync lock for tenant '{0}' is held by another run")]
    AlreadyLocked(TenantToken),

    #[error("lock store error: {0}")]
    Store(String),
}

/// Deleting an orphan failed; the candidate is left intact.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to delete orphan {kind} '{external_id}' (local id {local_id}): {message}")]
pub struct ReconciliationError {
    pub kind: RecordKind,
    pub external_id: String,
    pub local_id: EntityId,
    pub message: String,
}

/// A session cannot be used as the reference for an operator sweep.
///
/// Only the tenant's latest run may serve, and only if it was a full run
/// that finished its mark phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session '{0}' is not in the run log")]
    Unknown(SessionId),

    #[error("session '{session_id}' belongs to tenant '{owner}'")]
    OtherTenant {
        session_id: SessionId,
        owner: TenantToken,
    },

    #[error("session '{session_id}' was a {scope} run and did not mark the whole catalog")]
    NotFullRun {
        session_id: SessionId,
        scope: RunScope,
    },

    #[error("session '{session_id}' is {status}; only completed or partial runs can be swept")]
    NotFinished {
        session_id: SessionId,
        status: RunStatus,
    },

    #[error("session '{session_id}' is superseded by newer run '{latest}'")]
    Superseded {
        session_id: SessionId,
        latest: SessionId,
    },
}

/// Failure of a single record inside a stage. Recovered locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Run-level errors surfaced to callers of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress for tenant '{0}'")]
    AlreadyRunning(TenantToken),

    #[error("{stage} stage aborted: {source}")]
    SourceUnavailable { stage: Stage, source: SourceError },

    #[error("sync run was cancelled")]
    Cancelled,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error(transparent)]
    Lock(LockError),
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyLocked(tenant) => SyncError::AlreadyRunning(tenant),
            other => SyncError::Lock(other),
        }
    }
}
