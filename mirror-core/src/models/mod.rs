mod entity;
mod record;
mod registry;
mod run;

pub use entity::{EntityDraft, MediaRef, TermRef};
pub use record::{EntityId, RecordKind, RemoteRecord, TenantToken};
pub use registry::{DeletionRecord, RegistryEntry, RegistryKey, SessionId, SyncStamp};
pub use run::{RunScope, RunStatus, RunTrigger, SyncRun};
