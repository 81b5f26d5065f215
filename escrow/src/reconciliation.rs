//! Reconciliation engine
//!
//! Recomputes ESCROW balances from the ledger, compares them with the
//! cached projection (and optionally an externally observed balance) and
//! records discrepancies. Nothing is corrected without an operator
//! approving the discrepancy first.

use crate::{accounts::AccountStore, locks::LockManager, Error, Result};
use chrono::{DateTime, NaiveDate, Utc};
use ledger_core::{
    storage::keys, AccountType, AuditAction, AuditEvent, AuditTrail, BalanceSnapshot, BusinessId,
    EntryReference, Ledger, PostingLine, PostingRequest, ReferenceKind,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Discrepancies, keyed by business || discrepancy id
pub const CF_DISCREPANCIES: &str = "escrow_discrepancies";

/// What diverged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscrepancyKind {
    /// Cached projection vs ledger
    ProjectionDrift,
    /// Ledger vs externally observed balance
    ExternalMismatch,
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscrepancyKind::ProjectionDrift => write!(f, "projection_drift"),
            DiscrepancyKind::ExternalMismatch => write!(f, "external_mismatch"),
        }
    }
}

/// Approval workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscrepancyStatus {
    /// Awaiting review
    Pending,
    /// Operator approved compensation
    Approved,
    /// Correction applied
    Compensated,
    /// Closed without correction
    Resolved,
}

impl DiscrepancyStatus {
    /// Allowed workflow steps
    pub fn can_transition_to(&self, next: DiscrepancyStatus) -> bool {
        use DiscrepancyStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Resolved) | (Approved, Compensated) | (Approved, Resolved)
        )
    }

    /// Still awaiting a decision or a correction
    pub fn is_open(&self) -> bool {
        matches!(self, DiscrepancyStatus::Pending | DiscrepancyStatus::Approved)
    }
}

impl fmt::Display for DiscrepancyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscrepancyStatus::Pending => write!(f, "pending"),
            DiscrepancyStatus::Approved => write!(f, "approved"),
            DiscrepancyStatus::Compensated => write!(f, "compensated"),
            DiscrepancyStatus::Resolved => write!(f, "resolved"),
        }
    }
}

/// Recorded divergence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationDiscrepancy {
    /// Discrepancy ID
    pub discrepancy_id: Uuid,
    /// Business
    pub business_id: BusinessId,
    /// What diverged
    pub kind: DiscrepancyKind,
    /// Workflow state
    pub status: DiscrepancyStatus,
    /// Projection balance at detection
    pub stored_balance: Decimal,
    /// Ledger balance at detection
    pub ledger_balance: Decimal,
    /// Externally observed balance, for external mismatches
    pub external_balance: Option<Decimal>,
    /// Amount the correction must move
    pub difference: Decimal,
    /// Projection version at detection
    pub account_version: u64,
    /// Detection time
    pub detected_at: DateTime<Utc>,
    /// Approving operator
    pub approved_by: Option<String>,
    /// Closing operator
    pub resolved_by: Option<String>,
    /// Operator note
    pub note: Option<String>,
    /// Adjustment posting, for compensated external mismatches
    pub compensation_correlation_id: Option<Uuid>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reconciliation {
    /// Business
    pub business_id: BusinessId,
    /// Projection balance
    pub stored_balance: Decimal,
    /// Ledger balance
    pub ledger_balance: Decimal,
    /// Whether the two agree within tolerance
    pub matched: bool,
    /// Discrepancy recorded or still open for this divergence
    pub discrepancy_id: Option<Uuid>,
    /// Last ledger sequence folded in
    pub last_sequence: u64,
}

/// Current and reconciled balance of a business
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceView {
    /// Business
    pub business_id: BusinessId,
    /// Projection balance
    pub balance: Decimal,
    /// Held by active reservations
    pub hold_amount: Decimal,
    /// `balance − hold_amount`
    pub available: Decimal,
    /// Projection version
    pub version: u64,
    /// Frozen flag
    pub is_frozen: bool,
    /// Balance replayed from the ledger
    pub ledger_balance: Decimal,
    /// Whether projection and ledger agree within tolerance
    pub reconciled: bool,
    /// Sequence of the snapshot replay started from
    pub last_snapshot_sequence: Option<u64>,
    /// Last ledger sequence folded in
    pub last_sequence: u64,
}

/// Reconciliation engine
#[derive(Debug, Clone)]
pub struct ReconciliationEngine {
    ledger: Arc<Ledger>,
    accounts: AccountStore,
    locks: Arc<LockManager>,
    trail: AuditTrail,
    tolerance: Decimal,
}

impl ReconciliationEngine {
    /// Engine over a shared ledger and lock table
    pub fn new(ledger: Arc<Ledger>, locks: Arc<LockManager>, tolerance: Decimal) -> Self {
        let storage = ledger.storage().clone();
        Self {
            accounts: AccountStore::new(storage.clone()),
            trail: AuditTrail::new(storage),
            ledger,
            locks,
            tolerance,
        }
    }

    /// Rounding tolerance
    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    /// ESCROW balance replayed from the latest snapshot (or from zero)
    pub fn recalculate_balance(&self, business_id: BusinessId) -> Result<Decimal> {
        let (replay, _) = self.replay(business_id)?;
        Ok(replay.balance)
    }

    fn replay(
        &self,
        business_id: BusinessId,
    ) -> Result<(ledger_core::BalanceReplay, Option<BalanceSnapshot>)> {
        let snapshot = self.ledger.latest_snapshot(business_id, AccountType::Escrow)?;
        let replay =
            self.ledger
                .replay_balance(business_id, AccountType::Escrow, snapshot.as_ref())?;
        Ok((replay, snapshot))
    }

    fn within_tolerance(&self, a: Decimal, b: Decimal) -> bool {
        (a - b).abs() <= self.tolerance
    }

    /// Compare projection and ledger; record a discrepancy if they diverge
    pub async fn reconcile(&self, business_id: BusinessId) -> Result<Reconciliation> {
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        let account = self.accounts.require(business_id)?;
        let (replay, _) = self.replay(business_id)?;
        let matched = self.within_tolerance(account.balance, replay.balance);

        let discrepancy_id = if matched {
            tracing::debug!(
                business_id = %business_id,
                balance = %account.balance,
                last_sequence = replay.last_sequence,
                "Balance reconciled"
            );
            None
        } else {
            let discrepancy = self.record(
                business_id,
                DiscrepancyKind::ProjectionDrift,
                account.balance,
                replay.balance,
                None,
                replay.balance - account.balance,
                account.version,
            )?;
            Some(discrepancy.discrepancy_id)
        };

        Ok(Reconciliation {
            business_id,
            stored_balance: account.balance,
            ledger_balance: replay.balance,
            matched,
            discrepancy_id,
            last_sequence: replay.last_sequence,
        })
    }

    /// Reconcile and fail with [`Error::ReconciliationDiscrepancyDetected`] on divergence
    pub async fn verify(&self, business_id: BusinessId) -> Result<Reconciliation> {
        let result = self.reconcile(business_id).await?;
        match result.discrepancy_id {
            Some(discrepancy_id) => Err(Error::ReconciliationDiscrepancyDetected {
                business_id,
                discrepancy_id,
                stored: result.stored_balance,
                computed: result.ledger_balance,
            }),
            None => Ok(result),
        }
    }

    /// Compare the ledger with a balance observed at the bank
    pub async fn reconcile_external(
        &self,
        business_id: BusinessId,
        observed: Decimal,
    ) -> Result<Reconciliation> {
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        let account = self.accounts.require(business_id)?;
        let (replay, _) = self.replay(business_id)?;
        let matched = self.within_tolerance(observed, replay.balance);

        let discrepancy_id = if matched {
            None
        } else {
            let discrepancy = self.record(
                business_id,
                DiscrepancyKind::ExternalMismatch,
                account.balance,
                replay.balance,
                Some(observed),
                observed - replay.balance,
                account.version,
            )?;
            Some(discrepancy.discrepancy_id)
        };

        Ok(Reconciliation {
            business_id,
            stored_balance: observed,
            ledger_balance: replay.balance,
            matched,
            discrepancy_id,
            last_sequence: replay.last_sequence,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        business_id: BusinessId,
        kind: DiscrepancyKind,
        stored_balance: Decimal,
        ledger_balance: Decimal,
        external_balance: Option<Decimal>,
        difference: Decimal,
        account_version: u64,
    ) -> Result<ReconciliationDiscrepancy> {
        if let Some(open) = self
            .discrepancies(business_id)?
            .into_iter()
            .find(|d| d.kind == kind && d.status.is_open())
        {
            tracing::warn!(
                business_id = %business_id,
                discrepancy_id = %open.discrepancy_id,
                kind = %kind,
                "Discrepancy already open"
            );
            return Ok(open);
        }

        let now = Utc::now();
        let discrepancy = ReconciliationDiscrepancy {
            discrepancy_id: Uuid::now_v7(),
            business_id,
            kind,
            status: DiscrepancyStatus::Pending,
            stored_balance,
            ledger_balance,
            external_balance,
            difference,
            account_version,
            detected_at: now,
            approved_by: None,
            resolved_by: None,
            note: None,
            compensation_correlation_id: None,
            updated_at: now,
        };

        let mut txn = self.ledger.storage().begin();
        txn.put(CF_DISCREPANCIES, &Self::key(&discrepancy), &discrepancy)?;
        let event = AuditEvent::new(
            AuditAction::DiscrepancyRecorded,
            "escrow.reconciliation",
            format!("discrepancy:{}", discrepancy.discrepancy_id),
        )
        .business(business_id)
        .detail("kind", kind)
        .detail("stored", stored_balance)
        .detail("ledger", ledger_balance)
        .detail("difference", difference);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        tracing::error!(
            business_id = %business_id,
            discrepancy_id = %discrepancy.discrepancy_id,
            kind = %kind,
            stored = %stored_balance,
            ledger = %ledger_balance,
            difference = %difference,
            "Reconciliation discrepancy recorded"
        );
        Ok(discrepancy)
    }

    fn key(discrepancy: &ReconciliationDiscrepancy) -> Vec<u8> {
        keys::scoped(&discrepancy.business_id, discrepancy.discrepancy_id.as_bytes())
    }

    /// Load a discrepancy
    pub fn get_discrepancy(
        &self,
        business_id: BusinessId,
        discrepancy_id: Uuid,
    ) -> Result<ReconciliationDiscrepancy> {
        self.ledger
            .storage()
            .get(
                CF_DISCREPANCIES,
                &keys::scoped(&business_id, discrepancy_id.as_bytes()),
            )?
            .ok_or(Error::DiscrepancyNotFound(discrepancy_id))
    }

    /// Every discrepancy of a business, oldest first
    pub fn discrepancies(&self, business_id: BusinessId) -> Result<Vec<ReconciliationDiscrepancy>> {
        Ok(self
            .ledger
            .storage()
            .scan_prefix::<ReconciliationDiscrepancy>(CF_DISCREPANCIES, business_id.as_bytes())?
            .into_iter()
            .map(|(_, d)| d)
            .collect())
    }

    fn transition(
        discrepancy: &mut ReconciliationDiscrepancy,
        next: DiscrepancyStatus,
    ) -> Result<()> {
        if !discrepancy.status.can_transition_to(next) {
            return Err(Error::InvalidDiscrepancyTransition {
                id: discrepancy.discrepancy_id,
                from: discrepancy.status.to_string(),
                to: next.to_string(),
            });
        }
        discrepancy.status = next;
        discrepancy.updated_at = Utc::now();
        Ok(())
    }

    fn audit_transition(
        &self,
        txn: &mut ledger_core::WriteTxn<'_>,
        discrepancy: &ReconciliationDiscrepancy,
        actor: &str,
    ) -> Result<()> {
        let event = AuditEvent::new(
            AuditAction::DiscrepancyTransitioned,
            actor,
            format!("discrepancy:{}", discrepancy.discrepancy_id),
        )
        .business(discrepancy.business_id)
        .detail("status", discrepancy.status);
        self.trail.record_in(txn, &event)?;
        Ok(())
    }

    /// Approve a pending discrepancy for compensation
    pub async fn approve(
        &self,
        business_id: BusinessId,
        discrepancy_id: Uuid,
        actor: &str,
    ) -> Result<ReconciliationDiscrepancy> {
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        let mut discrepancy = self.get_discrepancy(business_id, discrepancy_id)?;
        Self::transition(&mut discrepancy, DiscrepancyStatus::Approved)?;
        discrepancy.approved_by = Some(actor.to_string());

        let mut txn = self.ledger.storage().begin();
        txn.put(CF_DISCREPANCIES, &Self::key(&discrepancy), &discrepancy)?;
        self.audit_transition(&mut txn, &discrepancy, actor)?;
        txn.commit()?;

        tracing::info!(discrepancy_id = %discrepancy_id, actor, "Discrepancy approved");
        Ok(discrepancy)
    }

    /// Close a discrepancy without correcting anything
    pub async fn resolve(
        &self,
        business_id: BusinessId,
        discrepancy_id: Uuid,
        actor: &str,
        note: &str,
    ) -> Result<ReconciliationDiscrepancy> {
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        let mut discrepancy = self.get_discrepancy(business_id, discrepancy_id)?;
        Self::transition(&mut discrepancy, DiscrepancyStatus::Resolved)?;
        discrepancy.resolved_by = Some(actor.to_string());
        discrepancy.note = Some(note.to_string());

        let mut txn = self.ledger.storage().begin();
        txn.put(CF_DISCREPANCIES, &Self::key(&discrepancy), &discrepancy)?;
        self.audit_transition(&mut txn, &discrepancy, actor)?;
        txn.commit()?;

        tracing::info!(discrepancy_id = %discrepancy_id, actor, "Discrepancy resolved");
        Ok(discrepancy)
    }

    /// Apply the correction of an approved discrepancy.
    ///
    /// Projection drift rewrites the cached balance to the ledger balance,
    /// provided the account has not moved since detection. An external
    /// mismatch posts an ESCROW/SUSPENSE adjustment for the difference.
    pub async fn compensate(
        &self,
        business_id: BusinessId,
        discrepancy_id: Uuid,
        actor: &str,
    ) -> Result<ReconciliationDiscrepancy> {
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        let mut discrepancy = self.get_discrepancy(business_id, discrepancy_id)?;
        Self::transition(&mut discrepancy, DiscrepancyStatus::Compensated)?;
        discrepancy.resolved_by = Some(actor.to_string());

        let mut account = self.accounts.require(business_id)?;
        let mut txn = self.ledger.storage().begin();

        match discrepancy.kind {
            DiscrepancyKind::ProjectionDrift => {
                account.balance = discrepancy.ledger_balance;
                self.accounts.compare_and_stage(
                    &scope,
                    &mut txn,
                    &mut account,
                    discrepancy.account_version,
                )?;
            }
            DiscrepancyKind::ExternalMismatch => {
                let amount = discrepancy.difference.abs();
                let correlation_id = Uuid::now_v7();
                let reference = EntryReference::new(ReferenceKind::Adjustment, discrepancy_id);
                let lines = if discrepancy.difference > Decimal::ZERO {
                    vec![
                        PostingLine::debit(business_id, AccountType::Suspense, amount, reference),
                        PostingLine::credit(business_id, AccountType::Escrow, amount, reference),
                    ]
                } else {
                    vec![
                        PostingLine::debit(business_id, AccountType::Escrow, amount, reference),
                        PostingLine::credit(business_id, AccountType::Suspense, amount, reference),
                    ]
                };
                let posting = self.ledger.post_in(
                    &mut txn,
                    PostingRequest::new(correlation_id, lines),
                )?;
                account.apply_escrow_delta(posting.escrow_delta(business_id))?;
                self.accounts.stage(&scope, &mut txn, &mut account)?;
                discrepancy.compensation_correlation_id = Some(correlation_id);
            }
        }

        txn.put(CF_DISCREPANCIES, &Self::key(&discrepancy), &discrepancy)?;
        self.audit_transition(&mut txn, &discrepancy, actor)?;
        txn.commit()?;

        tracing::warn!(
            business_id = %business_id,
            discrepancy_id = %discrepancy_id,
            kind = %discrepancy.kind,
            difference = %discrepancy.difference,
            balance = %account.balance,
            actor,
            "Discrepancy compensated"
        );
        Ok(discrepancy)
    }

    /// Daily snapshot of an account, taken under the business lock
    pub async fn snapshot(
        &self,
        business_id: BusinessId,
        account: AccountType,
        date: NaiveDate,
    ) -> Result<BalanceSnapshot> {
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        if let Some(existing) = self
            .ledger
            .latest_snapshot(business_id, account)?
            .filter(|s| s.snapshot_date == date)
        {
            return Ok(existing);
        }

        let mut txn = self.ledger.storage().begin();
        let snapshot = self
            .ledger
            .create_snapshot_in(&mut txn, business_id, account, date)?;
        let event = AuditEvent::new(
            AuditAction::SnapshotCreated,
            "escrow.reconciliation",
            format!("snapshot:{}", snapshot.snapshot_id),
        )
        .business(business_id)
        .detail("account", account)
        .detail("sequence", snapshot.sequence_number)
        .detail("checksum", snapshot.checksum_hex());
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;
        Ok(snapshot)
    }

    /// Projection plus ledger view of a business
    pub fn balance_view(&self, business_id: BusinessId) -> Result<BalanceView> {
        let account = self.accounts.require(business_id)?;
        let (replay, snapshot) = self.replay(business_id)?;
        Ok(BalanceView {
            business_id,
            balance: account.balance,
            hold_amount: account.hold_amount,
            available: account.available(),
            version: account.version,
            is_frozen: account.is_frozen,
            ledger_balance: replay.balance,
            reconciled: self.within_tolerance(account.balance, replay.balance),
            last_snapshot_sequence: snapshot.map(|s| s.sequence_number),
            last_sequence: replay.last_sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposits::DepositService;
    use ledger_core::{Config, Storage};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ledger: Arc<Ledger>,
        locks: Arc<LockManager>,
        accounts: AccountStore,
        engine: ReconciliationEngine,
    }

    async fn fixture(deposit: Decimal) -> (Fixture, BusinessId) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage =
            Arc::new(Storage::open_with_families(&config, crate::COLUMN_FAMILIES).unwrap());
        let ledger = Arc::new(Ledger::with_storage(storage.clone(), config).unwrap());
        let locks = Arc::new(LockManager::new());
        let accounts = AccountStore::new(storage);

        let business = BusinessId::new();
        accounts.open_account(&locks, business).await.unwrap();
        DepositService::new(ledger.clone(), locks.clone())
            .confirm_deposit(business, deposit, "seed")
            .await
            .unwrap();

        let engine = ReconciliationEngine::new(ledger.clone(), locks.clone(), dec!(0.005));
        (
            Fixture {
                _dir: temp_dir,
                ledger,
                locks,
                accounts,
                engine,
            },
            business,
        )
    }

    async fn corrupt(fx: &Fixture, business: BusinessId, balance: Decimal) {
        let mut scope = fx.locks.scope();
        scope.lock_business(business).await.unwrap();
        let mut account = fx.accounts.require(business).unwrap();
        account.balance = balance;
        let mut txn = fx.ledger.storage().begin();
        fx.accounts.stage(&scope, &mut txn, &mut account).unwrap();
        txn.commit().unwrap();
    }

    #[tokio::test]
    async fn test_matching_balance_reconciles() {
        let (fx, business) = fixture(dec!(500)).await;
        let result = fx.engine.verify(business).await.unwrap();
        assert!(result.matched);
        assert_eq!(result.ledger_balance, dec!(500));
        assert!(fx.engine.discrepancies(business).unwrap().is_empty());

        let view = fx.engine.balance_view(business).unwrap();
        assert!(view.reconciled);
        assert_eq!(view.available, dec!(500));
    }

    #[tokio::test]
    async fn test_drift_requires_approval_before_correction() {
        let (fx, business) = fixture(dec!(500)).await;
        corrupt(&fx, business, dec!(450)).await;

        let err = fx.engine.verify(business).await.unwrap_err();
        let discrepancy_id = match err {
            Error::ReconciliationDiscrepancyDetected {
                discrepancy_id,
                stored,
                computed,
                ..
            } => {
                assert_eq!(stored, dec!(450));
                assert_eq!(computed, dec!(500));
                discrepancy_id
            }
            other => panic!("unexpected error: {other}"),
        };

        // Never auto-corrected
        assert_eq!(fx.accounts.require(business).unwrap().balance, dec!(450));
        // Not recorded twice while open
        let again = fx.engine.reconcile(business).await.unwrap();
        assert_eq!(again.discrepancy_id, Some(discrepancy_id));
        assert_eq!(fx.engine.discrepancies(business).unwrap().len(), 1);

        let premature = fx.engine.compensate(business, discrepancy_id, "ops").await;
        assert!(matches!(
            premature,
            Err(Error::InvalidDiscrepancyTransition { .. })
        ));

        fx.engine.approve(business, discrepancy_id, "ops").await.unwrap();
        let done = fx
            .engine
            .compensate(business, discrepancy_id, "ops")
            .await
            .unwrap();
        assert_eq!(done.status, DiscrepancyStatus::Compensated);
        assert_eq!(fx.accounts.require(business).unwrap().balance, dec!(500));
        assert!(fx.engine.reconcile(business).await.unwrap().matched);
    }

    #[tokio::test]
    async fn test_drift_compensation_detects_concurrent_change() {
        let (fx, business) = fixture(dec!(500)).await;
        corrupt(&fx, business, dec!(450)).await;
        let id = fx
            .engine
            .reconcile(business)
            .await
            .unwrap()
            .discrepancy_id
            .unwrap();
        fx.engine.approve(business, id, "ops").await.unwrap();

        // Account moves after detection
        fx.accounts
            .set_frozen(&fx.locks, business, true, "ops")
            .await
            .unwrap();

        let result = fx.engine.compensate(business, id, "ops").await;
        assert!(matches!(result, Err(Error::ConcurrentModification { .. })));
        let stored = fx.engine.get_discrepancy(business, id).unwrap();
        assert_eq!(stored.status, DiscrepancyStatus::Approved);
    }

    #[tokio::test]
    async fn test_external_mismatch_posts_adjustment() {
        let (fx, business) = fixture(dec!(500)).await;
        let result = fx
            .engine
            .reconcile_external(business, dec!(520))
            .await
            .unwrap();
        assert!(!result.matched);
        let id = result.discrepancy_id.unwrap();

        fx.engine.approve(business, id, "ops").await.unwrap();
        let done = fx.engine.compensate(business, id, "ops").await.unwrap();
        let correlation = done.compensation_correlation_id.unwrap();
        fx.ledger.verify_correlation(correlation).unwrap();

        assert_eq!(fx.engine.recalculate_balance(business).unwrap(), dec!(520));
        assert_eq!(fx.accounts.require(business).unwrap().balance, dec!(520));
        assert!(fx.engine.reconcile(business).await.unwrap().matched);
    }

    #[tokio::test]
    async fn test_snapshot_bounds_replay() {
        let (fx, business) = fixture(dec!(300)).await;
        let today = Utc::now().date_naive();
        let snapshot = fx
            .engine
            .snapshot(business, AccountType::Escrow, today)
            .await
            .unwrap();
        assert_eq!(snapshot.balance, dec!(300));

        let view = fx.engine.balance_view(business).unwrap();
        assert_eq!(view.last_snapshot_sequence, Some(snapshot.sequence_number));
        assert_eq!(view.ledger_balance, dec!(300));
        assert!(view.reconciled);
    }

    #[tokio::test]
    async fn test_snapshot_and_audit_event_commit_together() {
        let (fx, business) = fixture(dec!(80)).await;
        let from = Utc::now() - chrono::Duration::seconds(1);
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();

        let first = fx
            .engine
            .snapshot(business, AccountType::Escrow, day)
            .await
            .unwrap();
        let again = fx
            .engine
            .snapshot(business, AccountType::Escrow, day)
            .await
            .unwrap();
        assert_eq!(first.snapshot_id, again.snapshot_id);

        let trail = AuditTrail::new(fx.ledger.storage().clone());
        let events: Vec<_> = trail
            .events_in_range(Some(business), from, Utc::now() + chrono::Duration::seconds(1))
            .unwrap()
            .into_iter()
            .filter(|e| e.action == AuditAction::SnapshotCreated)
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject, format!("snapshot:{}", first.snapshot_id));
    }

    #[tokio::test]
    async fn test_resolve_closes_without_change() {
        let (fx, business) = fixture(dec!(100)).await;
        corrupt(&fx, business, dec!(90)).await;
        let id = fx
            .engine
            .reconcile(business)
            .await
            .unwrap()
            .discrepancy_id
            .unwrap();
        let closed = fx
            .engine
            .resolve(business, id, "ops", "bank fee pending")
            .await
            .unwrap();
        assert_eq!(closed.status, DiscrepancyStatus::Resolved);
        assert_eq!(fx.accounts.require(business).unwrap().balance, dec!(90));
        assert!(fx.engine.approve(business, id, "ops").await.is_err());
    }
}
