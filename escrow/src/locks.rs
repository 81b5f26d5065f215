//! Ordered row locks
//!
//! Every balance-mutating operation holds its business's lock for the
//! duration of its write transaction. Locks are acquired through a
//! [`LockScope`] in the fixed order business → schedule → job → deposit
//! (ascending id within a rank) so concurrent admission checks and job
//! processing cannot deadlock.

use crate::{Error, Result};
use dashmap::DashMap;
use ledger_core::BusinessId;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Lock class, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockRank {
    /// Escrow account row
    Business,
    /// Schedule row
    Schedule,
    /// Job row
    Job,
    /// Deposit row
    Deposit,
}

/// Lock identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    rank: LockRank,
    id: Uuid,
}

impl LockKey {
    /// Business row
    pub fn business(business_id: BusinessId) -> Self {
        Self {
            rank: LockRank::Business,
            id: business_id.as_uuid(),
        }
    }

    /// Schedule row
    pub fn schedule(schedule_id: Uuid) -> Self {
        Self {
            rank: LockRank::Schedule,
            id: schedule_id,
        }
    }

    /// Job row
    pub fn job(job_id: Uuid) -> Self {
        Self {
            rank: LockRank::Job,
            id: job_id,
        }
    }

    /// Deposit row
    pub fn deposit(deposit_id: Uuid) -> Self {
        Self {
            rank: LockRank::Deposit,
            id: deposit_id,
        }
    }

    /// Lock class
    pub fn rank(&self) -> LockRank {
        self.rank
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.rank, self.id)
    }
}

/// Table of per-row async mutexes
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl LockManager {
    /// Empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an empty scope
    pub fn scope(&self) -> LockScope<'_> {
        LockScope {
            manager: self,
            held: Vec::new(),
        }
    }

    fn handle(&self, key: LockKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop table entries nobody holds or waits on
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    /// Number of table entries
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Set of locks held by one operation, released on drop
pub struct LockScope<'a> {
    manager: &'a LockManager,
    held: Vec<(LockKey, OwnedMutexGuard<()>)>,
}

impl fmt::Debug for LockScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.held.iter().map(|(key, _)| key.to_string()))
            .finish()
    }
}

impl<'a> LockScope<'a> {
    /// Acquire `key`, waiting if another scope holds it.
    ///
    /// Re-acquiring a held key is a no-op. A key ordered before the last
    /// acquired one fails with [`Error::LockOrderViolation`].
    pub async fn lock(&mut self, key: LockKey) -> Result<()> {
        if self.holds(&key) {
            return Ok(());
        }
        if let Some((last, _)) = self.held.last() {
            if key < *last {
                return Err(Error::LockOrderViolation {
                    held: last.to_string(),
                    requested: key.to_string(),
                });
            }
        }

        let guard = self.manager.handle(key).lock_owned().await;
        self.held.push((key, guard));
        Ok(())
    }

    /// Acquire a business lock
    pub async fn lock_business(&mut self, business_id: BusinessId) -> Result<()> {
        self.lock(LockKey::business(business_id)).await
    }

    /// Acquire a schedule lock
    pub async fn lock_schedule(&mut self, schedule_id: Uuid) -> Result<()> {
        self.lock(LockKey::schedule(schedule_id)).await
    }

    /// Acquire a job lock
    pub async fn lock_job(&mut self, job_id: Uuid) -> Result<()> {
        self.lock(LockKey::job(job_id)).await
    }

    /// Acquire a deposit lock
    pub async fn lock_deposit(&mut self, deposit_id: Uuid) -> Result<()> {
        self.lock(LockKey::deposit(deposit_id)).await
    }

    /// Whether `key` is held by this scope
    pub fn holds(&self, key: &LockKey) -> bool {
        self.held.iter().any(|(k, _)| k == key)
    }

    /// Fail unless this scope holds the business lock
    pub fn require_business(&self, business_id: BusinessId) -> Result<()> {
        let key = LockKey::business(business_id);
        if self.holds(&key) {
            Ok(())
        } else {
            Err(Error::LockNotHeld(key.to_string()))
        }
    }

    /// Fail unless this scope holds the job lock
    pub fn require_job(&self, job_id: Uuid) -> Result<()> {
        let key = LockKey::job(job_id);
        if self.holds(&key) {
            Ok(())
        } else {
            Err(Error::LockNotHeld(key.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_order_enforced() {
        let manager = LockManager::new();
        let business = BusinessId::new();
        let job = Uuid::now_v7();

        let mut scope = manager.scope();
        scope.lock_job(job).await.unwrap();
        let result = scope.lock_business(business).await;
        assert!(matches!(result, Err(Error::LockOrderViolation { .. })));

        // Re-locking a held key is fine
        scope.lock_job(job).await.unwrap();
        assert!(scope.require_business(business).is_err());
        scope.require_job(job).unwrap();
    }

    #[tokio::test]
    async fn test_full_order_accepted() {
        let manager = LockManager::new();
        let mut scope = manager.scope();
        scope.lock_business(BusinessId::new()).await.unwrap();
        scope.lock_schedule(Uuid::now_v7()).await.unwrap();
        scope.lock_job(Uuid::now_v7()).await.unwrap();
        scope.lock_deposit(Uuid::now_v7()).await.unwrap();
    }

    #[tokio::test]
    async fn test_business_lock_excludes() {
        let manager = Arc::new(LockManager::new());
        let business = BusinessId::new();

        let mut first = manager.scope();
        first.lock_business(business).await.unwrap();

        let contender = {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut scope = manager.scope();
                scope.lock_business(business).await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(manager.prune(), 1);
        assert!(manager.is_empty());
    }
}
