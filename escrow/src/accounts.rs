//! Escrow account projection
//!
//! One `EscrowAccount` per business caches the ledger's ESCROW balance plus
//! the amount held by admitted reservations. It is only written while the
//! business lock is held, in the same transaction as the ledger posting
//! that justifies the change.

use crate::{locks::LockManager, locks::LockScope, Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::{AuditAction, AuditEvent, AuditTrail, BusinessId, Storage, WriteTxn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Escrow accounts, keyed by business id
pub const CF_ACCOUNTS: &str = "escrow_accounts";

/// Per-business balance projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowAccount {
    /// Owning business
    pub business_id: BusinessId,
    /// Deposited funds not yet disbursed
    pub balance: Decimal,
    /// Funds earmarked by active reservations
    pub hold_amount: Decimal,
    /// Bumped on every write
    pub version: u64,
    /// Frozen accounts admit nothing
    pub is_frozen: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
}

impl EscrowAccount {
    /// Zeroed account
    pub fn new(business_id: BusinessId) -> Self {
        let now = Utc::now();
        Self {
            business_id,
            balance: Decimal::ZERO,
            hold_amount: Decimal::ZERO,
            version: 0,
            is_frozen: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// `balance − hold_amount`
    pub fn available(&self) -> Decimal {
        self.balance - self.hold_amount
    }

    /// `balance ≥ 0`, `hold_amount ≥ 0`, `hold_amount ≤ balance`
    pub fn check_invariants(&self) -> Result<()> {
        if self.balance < Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "{}: negative balance {}",
                self.business_id, self.balance
            )));
        }
        if self.hold_amount < Decimal::ZERO {
            return Err(Error::InvariantViolation(format!(
                "{}: negative hold {}",
                self.business_id, self.hold_amount
            )));
        }
        if self.hold_amount > self.balance {
            return Err(Error::InvariantViolation(format!(
                "{}: hold {} exceeds balance {}",
                self.business_id, self.hold_amount, self.balance
            )));
        }
        Ok(())
    }

    /// Apply the ESCROW effect of a posting
    pub fn apply_escrow_delta(&mut self, delta: Decimal) -> Result<()> {
        self.balance += delta;
        self.check_invariants()
    }

    /// Earmark `amount`
    pub fn hold(&mut self, amount: Decimal) -> Result<()> {
        self.hold_amount += amount;
        self.check_invariants()
    }

    /// Drop an earmark of `amount`
    pub fn release_hold(&mut self, amount: Decimal) -> Result<()> {
        if amount > self.hold_amount {
            return Err(Error::InvariantViolation(format!(
                "{}: releasing {} but only {} held",
                self.business_id, amount, self.hold_amount
            )));
        }
        self.hold_amount -= amount;
        self.check_invariants()
    }
}

/// Reads and writes escrow accounts
#[derive(Debug, Clone)]
pub struct AccountStore {
    storage: Arc<Storage>,
    trail: AuditTrail,
}

impl AccountStore {
    /// Store over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        let trail = AuditTrail::new(storage.clone());
        Self { storage, trail }
    }

    /// Account of a business, if opened
    pub fn get(&self, business_id: BusinessId) -> Result<Option<EscrowAccount>> {
        Ok(self.storage.get(CF_ACCOUNTS, business_id.as_bytes())?)
    }

    /// Account of an active business; a missing projection is [`Error::BalanceUnknown`]
    pub fn require(&self, business_id: BusinessId) -> Result<EscrowAccount> {
        self.get(business_id)?.ok_or_else(|| {
            tracing::error!(business_id = %business_id, "Escrow balance unknown");
            Error::BalanceUnknown(business_id)
        })
    }

    /// Every account
    pub fn list(&self) -> Result<Vec<EscrowAccount>> {
        Ok(self
            .storage
            .scan_all::<EscrowAccount>(CF_ACCOUNTS)?
            .into_iter()
            .map(|(_, account)| account)
            .collect())
    }

    /// Stage a locked write: checks invariants and bumps the version
    pub fn stage(
        &self,
        scope: &LockScope<'_>,
        txn: &mut WriteTxn<'_>,
        account: &mut EscrowAccount,
    ) -> Result<()> {
        scope.require_business(account.business_id)?;
        account.check_invariants()?;
        account.version += 1;
        account.updated_at = Utc::now();
        txn.put(CF_ACCOUNTS, account.business_id.as_bytes(), account)?;
        Ok(())
    }

    /// Stage a write computed from a copy read at `expected_version`.
    ///
    /// Fails with [`Error::ConcurrentModification`] if the stored account
    /// moved since.
    pub fn compare_and_stage(
        &self,
        scope: &LockScope<'_>,
        txn: &mut WriteTxn<'_>,
        account: &mut EscrowAccount,
        expected_version: u64,
    ) -> Result<()> {
        scope.require_business(account.business_id)?;
        let current = self.require(account.business_id)?;
        if current.version != expected_version {
            return Err(Error::ConcurrentModification {
                entity: format!("escrow account {}", account.business_id),
                expected: expected_version,
                found: current.version,
            });
        }
        account.version = current.version;
        self.stage(scope, txn, account)
    }

    /// Create the zeroed projection; returns the existing one if already open
    pub async fn open_account(
        &self,
        locks: &LockManager,
        business_id: BusinessId,
    ) -> Result<EscrowAccount> {
        let mut scope = locks.scope();
        scope.lock_business(business_id).await?;

        if let Some(existing) = self.get(business_id)? {
            return Ok(existing);
        }

        let mut account = EscrowAccount::new(business_id);
        let mut txn = self.storage.begin();
        self.stage(&scope, &mut txn, &mut account)?;
        let event = AuditEvent::new(
            AuditAction::AccountOpened,
            "escrow.accounts",
            format!("account:{}", business_id),
        )
        .business(business_id);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        tracing::info!(business_id = %business_id, "Escrow account opened");
        Ok(account)
    }

    /// Freeze or unfreeze an account
    pub async fn set_frozen(
        &self,
        locks: &LockManager,
        business_id: BusinessId,
        frozen: bool,
        actor: &str,
    ) -> Result<EscrowAccount> {
        let mut scope = locks.scope();
        scope.lock_business(business_id).await?;

        let mut account = self.require(business_id)?;
        if account.is_frozen == frozen {
            return Ok(account);
        }
        account.is_frozen = frozen;

        let mut txn = self.storage.begin();
        self.stage(&scope, &mut txn, &mut account)?;
        let action = if frozen {
            AuditAction::AccountFrozen
        } else {
            AuditAction::AccountUnfrozen
        };
        let event = AuditEvent::new(action, actor, format!("account:{}", business_id))
            .business(business_id);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        tracing::warn!(business_id = %business_id, frozen, actor, "Escrow account freeze changed");
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::Config;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, AccountStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Storage::open_with_families(&config, crate::COLUMN_FAMILIES).unwrap();
        (temp_dir, AccountStore::new(Arc::new(storage)))
    }

    #[test]
    fn test_account_invariants() {
        let mut account = EscrowAccount::new(BusinessId::new());
        account.apply_escrow_delta(dec!(100)).unwrap();
        account.hold(dec!(60)).unwrap();
        assert_eq!(account.available(), dec!(40));

        let mut over = account.clone();
        assert!(over.hold(dec!(41)).is_err());
        let mut negative = account.clone();
        assert!(negative.apply_escrow_delta(dec!(-101)).is_err());
        assert!(account.release_hold(dec!(61)).is_err());
        account.release_hold(dec!(60)).unwrap();
        assert_eq!(account.hold_amount, dec!(0));
    }

    #[tokio::test]
    async fn test_open_is_idempotent_and_missing_is_unknown() {
        let (_dir, store) = open_store();
        let locks = LockManager::new();
        let business = BusinessId::new();

        assert!(matches!(store.require(business), Err(Error::BalanceUnknown(_))));

        let opened = store.open_account(&locks, business).await.unwrap();
        assert_eq!(opened.version, 1);
        let again = store.open_account(&locks, business).await.unwrap();
        assert_eq!(again, opened);
    }

    #[tokio::test]
    async fn test_stage_requires_lock_and_cas_detects_change() {
        let (_dir, store) = open_store();
        let locks = LockManager::new();
        let business = BusinessId::new();
        let opened = store.open_account(&locks, business).await.unwrap();

        let unlocked = locks.scope();
        let mut txn = store.storage.begin();
        let mut copy = opened.clone();
        assert!(matches!(
            store.stage(&unlocked, &mut txn, &mut copy),
            Err(Error::LockNotHeld(_))
        ));

        store.set_frozen(&locks, business, true, "ops").await.unwrap();

        let mut scope = locks.scope();
        scope.lock_business(business).await.unwrap();
        let mut stale = opened.clone();
        let result = store.compare_and_stage(&scope, &mut txn, &mut stale, opened.version);
        assert!(matches!(result, Err(Error::ConcurrentModification { .. })));

        let frozen = store.require(business).unwrap();
        assert!(frozen.is_frozen);
        assert_eq!(frozen.version, 2);
    }
}
