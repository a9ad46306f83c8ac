//! Time-boxed mutual exclusion.
//!
//! A lease names its holder with a random token and expires on its own, so
//! a crashed holder blocks others for at most one TTL. Renewal and release
//! only touch a lease still owned by the caller's token.

use crate::store::StoreResult;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A held lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    /// Lock key
    pub key: String,
    /// Holder token
    pub holder: Uuid,
    /// Expiry instant
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    /// New lease for a fresh holder
    #[must_use]
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            holder: Uuid::new_v4(),
            expires_at: expiry(ttl),
        }
    }

    /// The same lease pushed out to `ttl` from now
    #[must_use]
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            expires_at: expiry(ttl),
            ..self.clone()
        }
    }

    /// Whether the lease has lapsed at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Distributed lock collaborator
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Take the lock unless a live lease exists
    ///
    /// Returns `None` when another holder owns the key.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockLease>>;

    /// Extend a lease the caller still holds
    ///
    /// Returns `None` when the lease was taken over by another holder.
    async fn renew(&self, lease: &LockLease, ttl: Duration) -> StoreResult<Option<LockLease>>;

    /// Drop a lease; returns false if it had expired and been taken over
    async fn release(&self, lease: &LockLease) -> StoreResult<bool>;
}

/// Process-local lock table
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    leases: Mutex<HashMap<String, LockLease>>,
}

impl MemoryLockManager {
    /// Create an empty lock table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> StoreResult<Option<LockLease>> {
        let mut leases = self.leases.lock().await;
        if leases.get(key).is_some_and(|l| !l.is_expired_at(Utc::now())) {
            return Ok(None);
        }
        let lease = LockLease::new(key, ttl);
        leases.insert(key.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &LockLease, ttl: Duration) -> StoreResult<Option<LockLease>> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&lease.key) {
            Some(held) if held.holder == lease.holder => {
                *held = held.renewed(ttl);
                Ok(Some(held.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &LockLease) -> StoreResult<bool> {
        let mut leases = self.leases.lock().await;
        if leases.get(&lease.key).is_some_and(|l| l.holder == lease.holder) {
            leases.remove(&lease.key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let locks = MemoryLockManager::new();
        let ttl = Duration::from_secs(60);
        let lease = locks.try_acquire("execution:x:resume", ttl).await.unwrap().unwrap();
        assert!(locks.try_acquire("execution:x:resume", ttl).await.unwrap().is_none());
        assert!(locks.try_acquire("execution:y:resume", ttl).await.unwrap().is_some());

        assert!(locks.release(&lease).await.unwrap());
        assert!(!locks.release(&lease).await.unwrap());
        assert!(locks.try_acquire("execution:x:resume", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let locks = MemoryLockManager::new();
        let stale = locks.try_acquire("k", Duration::ZERO).await.unwrap().unwrap();
        let fresh = locks.try_acquire("k", Duration::from_secs(60)).await.unwrap().unwrap();
        assert_ne!(stale.holder, fresh.holder);
        assert!(!locks.release(&stale).await.unwrap());
        assert!(locks.try_acquire("k", Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_extends_only_own_lease() {
        let locks = MemoryLockManager::new();
        let lease = locks.try_acquire("k", Duration::from_millis(50)).await.unwrap().unwrap();
        let renewed = locks.renew(&lease, Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(renewed.holder, lease.holder);
        assert!(renewed.expires_at > lease.expires_at);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(locks.try_acquire("k", Duration::from_secs(60)).await.unwrap().is_none());

        let stale = LockLease::new("k", Duration::from_secs(60));
        assert!(locks.renew(&stale, Duration::from_secs(60)).await.unwrap().is_none());
        assert!(locks.release(&lease).await.unwrap());
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let lease = LockLease::new("k", Duration::MAX);
        assert!(!lease.is_expired_at(Utc::now()));
    }
}
