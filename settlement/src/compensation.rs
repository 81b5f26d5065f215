//! Reversal and compensation of posted money movements
//!
//! Corrections never edit history: they post reversing entries and move the
//! escrow projection by the same delta in the same transaction.

use crate::{
    metrics::EngineMetrics,
    store::JobStore,
    types::JobStatus,
    Error, Result,
};
use chrono::{DateTime, Utc};
use escrow::{AccountStore, LockManager};
use ledger_core::{
    storage::keys, AccountType, AuditAction, AuditEvent, AuditTrail, BusinessId, Ledger,
    LedgerEntry,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Compensation records, keyed by business || compensation id
pub const CF_COMPENSATIONS: &str = "settlement_compensations";

/// One correction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationRecord {
    /// Record ID
    pub compensation_id: Uuid,
    /// Business
    pub business_id: BusinessId,
    /// Job whose disbursement was reversed
    pub job_id: Option<Uuid>,
    /// Single entry reversed
    pub entry_id: Option<Uuid>,
    /// Correlation of the reversing entries
    pub reversal_correlation_id: Uuid,
    /// Change applied to the escrow balance
    pub escrow_delta: Decimal,
    /// Operator reason
    pub reason: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Issues corrective postings
#[derive(Debug, Clone)]
pub struct CompensationManager {
    ledger: Arc<Ledger>,
    store: JobStore,
    accounts: AccountStore,
    locks: Arc<LockManager>,
    trail: AuditTrail,
    metrics: Arc<EngineMetrics>,
}

impl CompensationManager {
    /// Manager over a shared ledger and lock table
    pub fn new(ledger: Arc<Ledger>, locks: Arc<LockManager>, metrics: Arc<EngineMetrics>) -> Self {
        let storage = ledger.storage().clone();
        Self {
            store: JobStore::new(storage.clone()),
            accounts: AccountStore::new(storage.clone()),
            trail: AuditTrail::new(storage),
            ledger,
            locks,
            metrics,
        }
    }

    /// Reverse the disbursement of a succeeded job and give the funds back
    /// to escrow
    pub async fn compensate_disbursement(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<CompensationRecord> {
        let business_id = self.store.get(job_id)?.business_id;
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;
        scope.lock_job(job_id).await?;

        let mut job = self.store.get(job_id)?;
        if job.compensated_at.is_some() {
            return Err(Error::AlreadyCompensated(job_id));
        }
        if job.status != JobStatus::Succeeded {
            return Err(Error::InvalidTransition {
                job_id,
                from: job.status.to_string(),
                to: "compensated".to_string(),
            });
        }

        let mut txn = self.store.storage().begin();
        let reversal = self
            .ledger
            .reverse_correlation_in(&mut txn, job.job_id, reason)?;
        let delta = reversal.escrow_delta(business_id);

        let mut account = self.accounts.require(business_id)?;
        account.apply_escrow_delta(delta)?;
        self.accounts.stage(&scope, &mut txn, &mut account)?;

        let now = Utc::now();
        job.compensated_at = Some(now);
        self.store.stage_update(&mut txn, &mut job)?;

        let record = CompensationRecord {
            compensation_id: Uuid::now_v7(),
            business_id,
            job_id: Some(job_id),
            entry_id: None,
            reversal_correlation_id: reversal.correlation_id,
            escrow_delta: delta,
            reason: reason.to_string(),
            created_at: now,
        };
        self.put_record(&mut txn, &record)?;

        let event = AuditEvent::new(
            AuditAction::DisbursementCompensated,
            "settlement.compensation",
            format!("job:{}", job_id),
        )
        .business(business_id)
        .detail("amount", job.amount)
        .detail("reversal_correlation_id", reversal.correlation_id)
        .detail("reason", reason);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        self.metrics.compensations.inc();
        tracing::warn!(
            job_id = %job_id,
            business_id = %business_id,
            amount = %job.amount,
            balance = %account.balance,
            reason,
            "Disbursement compensated"
        );
        Ok(record)
    }

    /// Reverse a single entry; an ESCROW entry moves the projection with it
    pub async fn reverse_entry(&self, entry_id: Uuid, reason: &str) -> Result<LedgerEntry> {
        let business_id = self.ledger.get_entry(entry_id)?.business_id;
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        let original = self.ledger.get_entry(entry_id)?;
        let mut txn = self.store.storage().begin();
        let reversal = self.ledger.reverse_in(&mut txn, entry_id, reason)?;

        let delta = if original.account_type == AccountType::Escrow {
            let mut account = self.accounts.require(business_id)?;
            account.apply_escrow_delta(reversal.signed_amount())?;
            self.accounts.stage(&scope, &mut txn, &mut account)?;
            reversal.signed_amount()
        } else {
            Decimal::ZERO
        };

        let record = CompensationRecord {
            compensation_id: Uuid::now_v7(),
            business_id,
            job_id: None,
            entry_id: Some(entry_id),
            reversal_correlation_id: reversal.correlation_id,
            escrow_delta: delta,
            reason: reason.to_string(),
            created_at: Utc::now(),
        };
        self.put_record(&mut txn, &record)?;

        let event = AuditEvent::new(
            AuditAction::EntryReversed,
            "settlement.compensation",
            format!("entry:{}", entry_id),
        )
        .business(business_id)
        .detail("reversal_id", reversal.entry_id)
        .detail("amount", original.amount)
        .detail("reason", reason);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        Ok(reversal)
    }

    /// Every compensation of a business, oldest first
    pub fn compensations(&self, business_id: BusinessId) -> Result<Vec<CompensationRecord>> {
        Ok(self
            .store
            .storage()
            .scan_prefix::<CompensationRecord>(CF_COMPENSATIONS, business_id.as_bytes())?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    fn put_record(
        &self,
        txn: &mut ledger_core::WriteTxn<'_>,
        record: &CompensationRecord,
    ) -> Result<()> {
        txn.put(
            CF_COMPENSATIONS,
            &keys::scoped(&record.business_id, record.compensation_id.as_bytes()),
            record,
        )?;
        Ok(())
    }
}
