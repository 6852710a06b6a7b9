//! Tenant-scoped, TTL-bounded mutual exclusion for sync runs.
//!
//! The lock lives in a [`LockStore`] under `sync-lock:<tenant>` and is only
//! ever changed through compare-and-swap. A lock older than its TTL is stale
//! and may be taken over by the next acquisition attempt.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::capability::LockStore;
use crate::error::LockError;
use crate::models::TenantToken;

/// Value stored under a tenant's lock key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub token: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl LockRecord {
    /// A TTL too large for a `chrono` duration never expires.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match i64::try_from(self.ttl_secs)
            .ok()
            .and_then(ChronoDuration::try_seconds)
        {
            Some(ttl) => now - self.acquired_at > ttl,
            None => false,
        }
    }
}

/// Proof of lock ownership handed to the run that acquired it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub tenant: TenantToken,
    pub id: Uuid,
    pub acquired_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl LockToken {
    fn record(&self) -> LockRecord {
        LockRecord {
            token: self.id,
            acquired_at: self.acquired_at,
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

pub fn lock_key(tenant: &TenantToken) -> String {
    format!("sync-lock:{}", tenant)
}

#[derive(Clone)]
pub struct SyncLock {
    store: Arc<dyn LockStore>,
}

impl SyncLock {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self { store }
    }

    pub async fn acquire(&self, tenant: &TenantToken, ttl: Duration) -> Result<LockToken, LockError> {
        self.acquire_at(tenant, ttl, Utc::now()).await
    }

    /// Acquires the lock as of `now`, reclaiming a stale holder.
    pub async fn acquire_at(
        &self,
        tenant: &TenantToken,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<LockToken, LockError> {
        let key = lock_key(tenant);
        let token = LockToken {
            tenant: tenant.clone(),
            id: Uuid::new_v4(),
            acquired_at: now,
            ttl,
        };
        let record = token.record();

        let swapped = match self.store.load(&key).await? {
            None => self.store.compare_and_swap(&key, None, Some(&record)).await?,
            Some(held) if held.is_stale_at(now) => {
                tracing::warn!(
                    "Reclaiming stale sync lock for tenant {} (held since {})",
                    tenant,
                    held.acquired_at
                );
                self.store
                    .compare_and_swap(&key, Some(&held), Some(&record))
                    .await?
            }
            Some(_) => false,
        };

        if swapped {
            tracing::debug!("Acquired sync lock for tenant {}", tenant);
            Ok(token)
        } else {
            Err(LockError::AlreadyLocked(tenant.clone()))
        }
    }

    /// Releases the lock if `token` still owns it. Releasing twice, or after
    /// the lock was reclaimed by someone else, is a no-op.
    pub async fn release(&self, token: &LockToken) -> Result<(), LockError> {
        let key = lock_key(&token.tenant);
        match self.store.load(&key).await? {
            Some(held) if held.token == token.id => {
                if !self.store.compare_and_swap(&key, Some(&held), None).await? {
                    tracing::warn!("Sync lock for tenant {} changed during release", token.tenant);
                }
            }
            _ => {
                tracing::debug!("Sync lock for tenant {} already released", token.tenant);
            }
        }
        Ok(())
    }

    pub fn is_stale(&self, token: &LockToken) -> bool {
        token.record().is_stale_at(Utc::now())
    }

    /// Current holder of a tenant's lock, if any.
    pub async fn holder(&self, tenant: &TenantToken) -> Result<Option<LockRecord>, LockError> {
        self.store.load(&lock_key(tenant)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLockStore;

    fn lock() -> SyncLock {
        SyncLock::new(Arc::new(MemoryLockStore::new()))
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn test_second_acquire_fails_while_held() {
        let lock = lock();
        let tenant = TenantToken::new("acme");

        let _token = lock.acquire(&tenant, HOUR).await.unwrap();
        let err = lock.acquire(&tenant, HOUR).await.unwrap_err();

        assert_eq!(err, LockError::AlreadyLocked(tenant));
    }

    #[tokio::test]
    async fn test_tenants_lock_independently() {
        let lock = lock();
        lock.acquire(&TenantToken::new("a"), HOUR).await.unwrap();
        assert!(lock.acquire(&TenantToken::new("b"), HOUR).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_allows_reacquire_and_is_idempotent() {
        let lock = lock();
        let tenant = TenantToken::new("acme");

        let token = lock.acquire(&tenant, HOUR).await.unwrap();
        lock.release(&token).await.unwrap();
        lock.release(&token).await.unwrap();

        assert!(lock.holder(&tenant).await.unwrap().is_none());
        assert!(lock.acquire(&tenant, HOUR).await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_lock_is_reclaimed() {
        let lock = lock();
        let tenant = TenantToken::new("acme");
        let t0 = Utc::now();

        let first = lock.acquire_at(&tenant, HOUR, t0).await.unwrap();

        let too_early = lock
            .acquire_at(&tenant, HOUR, t0 + ChronoDuration::seconds(3599))
            .await;
        assert!(too_early.is_err());

        let reclaimed = lock
            .acquire_at(&tenant, HOUR, t0 + ChronoDuration::seconds(3601))
            .await
            .unwrap();
        assert_ne!(reclaimed.id, first.id);

        // The original holder's release must not free the new holder's lock.
        lock.release(&first).await.unwrap();
        let holder = lock.holder(&tenant).await.unwrap().unwrap();
        assert_eq!(holder.token, reclaimed.id);
    }

    #[tokio::test]
    async fn test_is_stale() {
        let lock = lock();
        let tenant = TenantToken::new("acme");
        let old = lock
            .acquire_at(&tenant, HOUR, Utc::now() - ChronoDuration::seconds(7200))
            .await
            .unwrap();
        assert!(lock.is_stale(&old));

        let fresh = lock.acquire(&TenantToken::new("other"), HOUR).await.unwrap();
        assert!(!lock.is_stale(&fresh));
    }

    #[tokio::test]
    async fn test_huge_ttl_never_goes_stale() {
        let lock = lock();
        let tenant = TenantToken::new("acme");
        let forever = Duration::from_secs(u64::MAX);
        let t0 = Utc::now() - ChronoDuration::days(365);

        let token = lock.acquire_at(&tenant, forever, t0).await.unwrap();

        assert!(!lock.is_stale(&token));
        let record = LockRecord {
            token: token.id,
            acquired_at: t0,
            ttl_secs: i64::MAX as u64 / 10,
        };
        assert!(!record.is_stale_at(Utc::now()));
        assert!(lock.acquire(&tenant, HOUR).await.is_err());
    }
}
