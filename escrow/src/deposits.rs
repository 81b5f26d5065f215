//! Deposit confirmation
//!
//! A confirmed top-up posts DEBIT CLEARING / CREDIT ESCROW and raises the
//! projection in the same transaction. Confirmations are idempotent on the
//! external reference supplied by the banking collaborator.

use crate::{accounts::AccountStore, locks::LockManager, Error, Result};
use chrono::{DateTime, Utc};
use ledger_core::{
    storage::keys, AccountType, AuditAction, AuditEvent, AuditTrail, BusinessId, EntryReference,
    Ledger, PostingLine, PostingRequest, ReferenceKind,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Deposits, keyed by deposit id
pub const CF_DEPOSITS: &str = "escrow_deposits";
/// business || sha256(external reference) -> deposit id
pub const CF_DEPOSIT_REFS: &str = "escrow_deposit_refs";

/// Confirmed escrow top-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    /// Deposit ID (also the posting's correlation id)
    pub deposit_id: Uuid,
    /// Business credited
    pub business_id: BusinessId,
    /// Amount credited
    pub amount: Decimal,
    /// Bank or operator reference
    pub external_reference: String,
    /// Confirmation time
    pub confirmed_at: DateTime<Utc>,
}

/// Confirms deposits
#[derive(Debug, Clone)]
pub struct DepositService {
    ledger: Arc<Ledger>,
    accounts: AccountStore,
    locks: Arc<LockManager>,
    trail: AuditTrail,
}

impl DepositService {
    /// Service over a shared ledger and lock table
    pub fn new(ledger: Arc<Ledger>, locks: Arc<LockManager>) -> Self {
        let storage = ledger.storage().clone();
        Self {
            accounts: AccountStore::new(storage.clone()),
            trail: AuditTrail::new(storage),
            ledger,
            locks,
        }
    }

    fn reference_digest(business_id: BusinessId, external_reference: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(business_id.as_bytes());
        hasher.update(external_reference.as_bytes());
        hasher.finalize().into()
    }

    /// Credit a confirmed deposit.
    ///
    /// Replaying the same `(business, external_reference)` returns the
    /// original deposit; replaying it with another amount is a conflict.
    pub async fn confirm_deposit(
        &self,
        business_id: BusinessId,
        amount: Decimal,
        external_reference: &str,
    ) -> Result<Deposit> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(amount));
        }

        let digest = Self::reference_digest(business_id, external_reference);
        let mut lock_id = [0u8; 16];
        lock_id.copy_from_slice(&digest[..16]);

        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;
        scope.lock_deposit(Uuid::from_bytes(lock_id)).await?;

        let storage = self.ledger.storage();
        let ref_key = keys::scoped(&business_id, &digest);
        if let Some(existing_id) = storage.get::<Uuid>(CF_DEPOSIT_REFS, &ref_key)? {
            let existing = self.get_deposit(existing_id)?;
            if existing.amount != amount {
                return Err(Error::DepositConflict(format!(
                    "reference {} already confirmed for {}",
                    external_reference, existing.amount
                )));
            }
            tracing::info!(
                business_id = %business_id,
                deposit_id = %existing.deposit_id,
                external_reference,
                "Deposit already confirmed"
            );
            return Ok(existing);
        }

        let mut account = self.accounts.require(business_id)?;
        let deposit = Deposit {
            deposit_id: Uuid::now_v7(),
            business_id,
            amount,
            external_reference: external_reference.to_string(),
            confirmed_at: Utc::now(),
        };
        let reference = EntryReference::new(ReferenceKind::Deposit, deposit.deposit_id);

        let mut txn = storage.begin();
        let posting = self.ledger.post_in(
            &mut txn,
            PostingRequest::new(
                deposit.deposit_id,
                vec![
                    PostingLine::debit(business_id, AccountType::Clearing, amount, reference)
                        .with_metadata("external_reference", external_reference),
                    PostingLine::credit(business_id, AccountType::Escrow, amount, reference)
                        .with_metadata("external_reference", external_reference),
                ],
            ),
        )?;
        account.apply_escrow_delta(posting.escrow_delta(business_id))?;
        self.accounts.stage(&scope, &mut txn, &mut account)?;

        txn.put(CF_DEPOSITS, deposit.deposit_id.as_bytes(), &deposit)?;
        txn.put(CF_DEPOSIT_REFS, &ref_key, &deposit.deposit_id)?;
        let event = AuditEvent::new(
            AuditAction::DepositConfirmed,
            "escrow.deposits",
            format!("deposit:{}", deposit.deposit_id),
        )
        .business(business_id)
        .detail("amount", amount)
        .detail("external_reference", external_reference);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        tracing::info!(
            business_id = %business_id,
            deposit_id = %deposit.deposit_id,
            amount = %amount,
            balance = %account.balance,
            "Deposit confirmed"
        );
        Ok(deposit)
    }

    /// Load a deposit
    pub fn get_deposit(&self, deposit_id: Uuid) -> Result<Deposit> {
        self.ledger
            .storage()
            .get(CF_DEPOSITS, deposit_id.as_bytes())?
            .ok_or(Error::DepositNotFound(deposit_id))
    }
}
