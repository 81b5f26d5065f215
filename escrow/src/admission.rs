//! Admission control
//!
//! The only gate between "intent to pay" and "funds are committed".
//! `reserve` runs with the business lock held for the whole transaction:
//!
//! 1. `amount ≤ 0` is rejected.
//! 2. A missing projection is [`Error::BalanceUnknown`].
//! 3. Frozen accounts and non-positive balances are rejected.
//! 4. `available = balance − hold_amount` must be positive.
//! 5. `available` must cover this request.
//! 6. Active reservations without a hold, plus this one, must fit in `available`.
//! 7. Under [`AdmissionPolicy::SoftHold`] the amount is added to `hold_amount`.
//!
//! The same check is re-run at disbursement time and for schedule
//! projected costs.

use crate::{
    accounts::{AccountStore, EscrowAccount},
    config::AdmissionPolicy,
    locks::{LockManager, LockScope},
    Error, Result,
};
use chrono::{DateTime, Utc};
use ledger_core::{
    storage::keys, AuditAction, AuditEvent, AuditTrail, BusinessId, EntryReference, Storage,
    WriteTxn,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Reservations, keyed by business || reservation id
pub const CF_RESERVATIONS: &str = "escrow_reservations";

/// Reservation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Funds committed, disbursement not yet posted
    Active,
    /// Job failed or was cancelled
    Released,
    /// Disbursement posted
    Consumed,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReservationStatus::Active => write!(f, "active"),
            ReservationStatus::Released => write!(f, "released"),
            ReservationStatus::Consumed => write!(f, "consumed"),
        }
    }
}

/// Admitted capacity for one disbursement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation ID
    pub reservation_id: Uuid,
    /// Business
    pub business_id: BusinessId,
    /// Reserved amount
    pub amount: Decimal,
    /// Whether `amount` is included in the account's `hold_amount`
    pub held: bool,
    /// Lifecycle
    pub status: ReservationStatus,
    /// What the funds are for
    pub reference: EntryReference,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// Outcome of the reserve endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdmissionDecision {
    /// Funds reserved
    Admitted(Reservation),
    /// Not enough available funds
    InsufficientFunds {
        /// Requested amount
        requested: Decimal,
        /// Available amount
        available: Decimal,
    },
    /// Account frozen
    AccountFrozen,
}

impl AdmissionDecision {
    /// Map a reserve result; errors other than the admission refusals propagate
    pub fn from_result(result: Result<Reservation>) -> Result<Self> {
        match result {
            Ok(reservation) => Ok(AdmissionDecision::Admitted(reservation)),
            Err(Error::InsufficientFunds {
                requested,
                available,
                ..
            }) => Ok(AdmissionDecision::InsufficientFunds {
                requested,
                available,
            }),
            Err(Error::AccountFrozen(_)) => Ok(AdmissionDecision::AccountFrozen),
            Err(other) => Err(other),
        }
    }

    /// Whether funds were reserved
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted(_))
    }
}

/// Admission controller
#[derive(Debug, Clone)]
pub struct AdmissionController {
    storage: Arc<Storage>,
    accounts: AccountStore,
    locks: Arc<LockManager>,
    trail: AuditTrail,
    policy: AdmissionPolicy,
}

impl AdmissionController {
    /// Controller over shared storage and locks
    pub fn new(storage: Arc<Storage>, locks: Arc<LockManager>, policy: AdmissionPolicy) -> Self {
        Self {
            accounts: AccountStore::new(storage.clone()),
            trail: AuditTrail::new(storage.clone()),
            storage,
            locks,
            policy,
        }
    }

    /// Configured policy
    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Steps 1 and 3–6 against a loaded account.
    ///
    /// `pending_unheld` is the sum of active reservations that are not part
    /// of `hold_amount`.
    pub fn check(
        &self,
        account: &EscrowAccount,
        amount: Decimal,
        pending_unheld: Decimal,
    ) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(amount));
        }
        if account.is_frozen {
            return Err(Error::AccountFrozen(account.business_id));
        }

        let available = account.available();
        let refuse = |available: Decimal| Error::InsufficientFunds {
            business_id: account.business_id,
            requested: amount,
            available,
        };

        if account.balance <= Decimal::ZERO || available <= Decimal::ZERO {
            return Err(refuse(available.max(Decimal::ZERO)));
        }
        if available < amount {
            return Err(refuse(available));
        }
        if pending_unheld + amount > available {
            return Err(refuse(available - pending_unheld));
        }
        Ok(())
    }

    /// Reserve `amount` in its own locked transaction
    pub async fn reserve(
        &self,
        business_id: BusinessId,
        amount: Decimal,
        reference: EntryReference,
    ) -> Result<Reservation> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidAmount(amount));
        }

        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        let mut account = self.accounts.require(business_id)?;
        let mut txn = self.storage.begin();
        let reservation = self.reserve_in(&scope, &mut txn, &mut account, amount, reference)?;
        txn.commit()?;
        Ok(reservation)
    }

    /// Run the admission check and stage a reservation in `txn`.
    ///
    /// `scope` must hold the business lock; `account` must have been read
    /// under it.
    pub fn reserve_in(
        &self,
        scope: &LockScope<'_>,
        txn: &mut WriteTxn<'_>,
        account: &mut EscrowAccount,
        amount: Decimal,
        reference: EntryReference,
    ) -> Result<Reservation> {
        let business_id = account.business_id;
        scope.require_business(business_id)?;

        let pending_unheld = self.pending_unheld(business_id, None)?;
        if let Err(e) = self.check(account, amount, pending_unheld) {
            tracing::warn!(
                business_id = %business_id,
                amount = %amount,
                available = %account.available(),
                error = %e,
                "Admission refused"
            );
            return Err(e);
        }

        let held = self.policy == AdmissionPolicy::SoftHold;
        if held {
            account.hold(amount)?;
            self.accounts.stage(scope, txn, account)?;
        }

        let now = Utc::now();
        let reservation = Reservation {
            reservation_id: Uuid::now_v7(),
            business_id,
            amount,
            held,
            status: ReservationStatus::Active,
            reference,
            created_at: now,
            updated_at: now,
        };
        self.put_reservation(txn, &reservation)?;

        let event = AuditEvent::new(
            AuditAction::FundsReserved,
            "escrow.admission",
            format!("reservation:{}", reservation.reservation_id),
        )
        .business(business_id)
        .detail("amount", amount)
        .detail("reference", reference);
        self.trail.record_in(txn, &event)?;

        tracing::info!(
            business_id = %business_id,
            reservation_id = %reservation.reservation_id,
            amount = %amount,
            held,
            available = %account.available(),
            "Funds reserved"
        );
        Ok(reservation)
    }

    /// Release an active reservation (job failed or cancelled).
    ///
    /// Releasing an already released reservation is a no-op.
    pub fn release_in(
        &self,
        scope: &LockScope<'_>,
        txn: &mut WriteTxn<'_>,
        account: &mut EscrowAccount,
        reservation_id: Uuid,
        reason: &str,
    ) -> Result<Reservation> {
        scope.require_business(account.business_id)?;
        let mut reservation = self.get_reservation(account.business_id, reservation_id)?;
        match reservation.status {
            ReservationStatus::Released => return Ok(reservation),
            ReservationStatus::Consumed => {
                return Err(Error::InvalidReservationState {
                    reservation_id,
                    status: reservation.status.to_string(),
                })
            }
            ReservationStatus::Active => {}
        }

        if reservation.held {
            account.release_hold(reservation.amount)?;
            self.accounts.stage(scope, txn, account)?;
        }
        reservation.status = ReservationStatus::Released;
        reservation.updated_at = Utc::now();
        self.put_reservation(txn, &reservation)?;

        let event = AuditEvent::new(
            AuditAction::ReservationReleased,
            "escrow.admission",
            format!("reservation:{}", reservation_id),
        )
        .business(account.business_id)
        .detail("amount", reservation.amount)
        .detail("reason", reason);
        self.trail.record_in(txn, &event)?;

        tracing::info!(
            business_id = %account.business_id,
            reservation_id = %reservation_id,
            amount = %reservation.amount,
            reason,
            "Reservation released"
        );
        Ok(reservation)
    }

    /// Mark an active reservation consumed and drop its hold.
    ///
    /// The caller applies the disbursement's ESCROW debit to `account` and
    /// stages it afterwards.
    pub fn consume_in(
        &self,
        scope: &LockScope<'_>,
        txn: &mut WriteTxn<'_>,
        account: &mut EscrowAccount,
        reservation_id: Uuid,
    ) -> Result<Reservation> {
        scope.require_business(account.business_id)?;
        let mut reservation = self.get_reservation(account.business_id, reservation_id)?;
        if reservation.status != ReservationStatus::Active {
            return Err(Error::InvalidReservationState {
                reservation_id,
                status: reservation.status.to_string(),
            });
        }

        if reservation.held {
            account.release_hold(reservation.amount)?;
        }
        reservation.status = ReservationStatus::Consumed;
        reservation.updated_at = Utc::now();
        self.put_reservation(txn, &reservation)?;

        let event = AuditEvent::new(
            AuditAction::ReservationConsumed,
            "escrow.admission",
            format!("reservation:{}", reservation_id),
        )
        .business(account.business_id)
        .detail("amount", reservation.amount);
        self.trail.record_in(txn, &event)?;
        Ok(reservation)
    }

    /// Re-evaluate funds right before a disbursement is posted.
    ///
    /// A held reservation already earmarks its amount; otherwise the full
    /// admission check runs again, excluding the job's own reservation from
    /// the pending sum.
    pub fn verify_disbursement(
        &self,
        account: &EscrowAccount,
        amount: Decimal,
        reservation: Option<&Reservation>,
    ) -> Result<()> {
        if account.is_frozen {
            return Err(Error::AccountFrozen(account.business_id));
        }

        match reservation {
            Some(r) if r.status == ReservationStatus::Active && r.held => {
                if r.amount < amount || account.hold_amount < r.amount || account.balance < amount {
                    return Err(Error::InsufficientFunds {
                        business_id: account.business_id,
                        requested: amount,
                        available: account.balance.min(account.hold_amount),
                    });
                }
                Ok(())
            }
            Some(r) if r.status == ReservationStatus::Active => {
                let pending = self.pending_unheld(account.business_id, Some(r.reservation_id))?;
                self.check(account, amount, pending)
            }
            _ => {
                let pending = self.pending_unheld(account.business_id, None)?;
                self.check(account, amount, pending)
            }
        }
    }

    /// Check a schedule's projected cost against available funds
    pub fn check_projected_cost(&self, account: &EscrowAccount, projected: Decimal) -> Result<()> {
        if projected.is_zero() {
            return Ok(());
        }
        let pending = self.pending_unheld(account.business_id, None)?;
        self.check(account, projected, pending).map_err(|e| {
            tracing::warn!(
                business_id = %account.business_id,
                projected = %projected,
                error = %e,
                "Projected cost refused"
            );
            e
        })
    }

    /// Load a reservation
    pub fn get_reservation(&self, business_id: BusinessId, reservation_id: Uuid) -> Result<Reservation> {
        self.storage
            .get(
                CF_RESERVATIONS,
                &keys::scoped(&business_id, reservation_id.as_bytes()),
            )?
            .ok_or(Error::ReservationNotFound(reservation_id))
    }

    /// Every reservation of a business, oldest first
    pub fn reservations(&self, business_id: BusinessId) -> Result<Vec<Reservation>> {
        Ok(self
            .storage
            .scan_prefix::<Reservation>(CF_RESERVATIONS, business_id.as_bytes())?
            .into_iter()
            .map(|(_, r)| r)
            .collect())
    }

    /// Active reservations across all businesses
    pub fn all_active(&self) -> Result<Vec<Reservation>> {
        Ok(self
            .storage
            .scan_all::<Reservation>(CF_RESERVATIONS)?
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.status == ReservationStatus::Active)
            .collect())
    }

    fn pending_unheld(&self, business_id: BusinessId, exclude: Option<Uuid>) -> Result<Decimal> {
        Ok(self
            .reservations(business_id)?
            .iter()
            .filter(|r| r.status == ReservationStatus::Active && !r.held)
            .filter(|r| Some(r.reservation_id) != exclude)
            .map(|r| r.amount)
            .sum())
    }

    fn put_reservation(&self, txn: &mut WriteTxn<'_>, reservation: &Reservation) -> Result<()> {
        txn.put(
            CF_RESERVATIONS,
            &keys::scoped(&reservation.business_id, reservation.reservation_id.as_bytes()),
            reservation,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_core::{Config, ReferenceKind};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        storage: Arc<Storage>,
        locks: Arc<LockManager>,
        accounts: AccountStore,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage =
            Arc::new(Storage::open_with_families(&config, crate::COLUMN_FAMILIES).unwrap());
        Fixture {
            _dir: temp_dir,
            accounts: AccountStore::new(storage.clone()),
            storage,
            locks: Arc::new(LockManager::new()),
        }
    }

    async fn funded(fx: &Fixture, balance: Decimal) -> BusinessId {
        let business = BusinessId::new();
        fx.accounts.open_account(&fx.locks, business).await.unwrap();
        let mut scope = fx.locks.scope();
        scope.lock_business(business).await.unwrap();
        let mut account = fx.accounts.require(business).unwrap();
        account.apply_escrow_delta(balance).unwrap();
        let mut txn = fx.storage.begin();
        fx.accounts.stage(&scope, &mut txn, &mut account).unwrap();
        txn.commit().unwrap();
        business
    }

    fn job_ref() -> EntryReference {
        EntryReference::new(ReferenceKind::PayrollJob, Uuid::now_v7())
    }

    #[tokio::test]
    async fn test_check_steps() {
        let fx = fixture();
        let controller =
            AdmissionController::new(fx.storage.clone(), fx.locks.clone(), AdmissionPolicy::SoftHold);
        let mut account = EscrowAccount::new(BusinessId::new());

        assert!(matches!(
            controller.check(&account, dec!(0), dec!(0)),
            Err(Error::InvalidAmount(_))
        ));
        assert!(matches!(
            controller.check(&account, dec!(1), dec!(0)),
            Err(Error::InsufficientFunds { .. })
        ));

        account.balance = dec!(100);
        account.hold_amount = dec!(100);
        assert!(controller.check(&account, dec!(1), dec!(0)).is_err());

        account.hold_amount = dec!(40);
        controller.check(&account, dec!(60), dec!(0)).unwrap();
        assert!(controller.check(&account, dec!(61), dec!(0)).is_err());
        assert!(controller.check(&account, dec!(30), dec!(31)).is_err());

        account.is_frozen = true;
        assert!(matches!(
            controller.check(&account, dec!(1), dec!(0)),
            Err(Error::AccountFrozen(_))
        ));
    }

    #[tokio::test]
    async fn test_soft_hold_reserve_release_consume() {
        let fx = fixture();
        let controller =
            AdmissionController::new(fx.storage.clone(), fx.locks.clone(), AdmissionPolicy::SoftHold);
        let business = funded(&fx, dec!(100)).await;

        let first = controller.reserve(business, dec!(70), job_ref()).await.unwrap();
        assert!(first.held);
        assert_eq!(fx.accounts.require(business).unwrap().hold_amount, dec!(70));

        let refused = controller.reserve(business, dec!(40), job_ref()).await;
        assert!(matches!(
            refused,
            Err(Error::InsufficientFunds { available, .. }) if available == dec!(30)
        ));

        let mut scope = fx.locks.scope();
        scope.lock_business(business).await.unwrap();
        let mut account = fx.accounts.require(business).unwrap();
        let mut txn = fx.storage.begin();
        let released = controller
            .release_in(&scope, &mut txn, &mut account, first.reservation_id, "job failed")
            .unwrap();
        txn.commit().unwrap();
        assert_eq!(released.status, ReservationStatus::Released);
        assert_eq!(fx.accounts.require(business).unwrap().hold_amount, dec!(0));
        drop(scope);

        let second = controller.reserve(business, dec!(40), job_ref()).await.unwrap();
        let mut scope = fx.locks.scope();
        scope.lock_business(business).await.unwrap();
        let mut account = fx.accounts.require(business).unwrap();
        controller
            .verify_disbursement(&account, dec!(40), Some(&second))
            .unwrap();
        let mut txn = fx.storage.begin();
        controller
            .consume_in(&scope, &mut txn, &mut account, second.reservation_id)
            .unwrap();
        account.apply_escrow_delta(dec!(-40)).unwrap();
        fx.accounts.stage(&scope, &mut txn, &mut account).unwrap();
        txn.commit().unwrap();

        let account = fx.accounts.require(business).unwrap();
        assert_eq!(account.balance, dec!(60));
        assert_eq!(account.hold_amount, dec!(0));

        let mut txn = fx.storage.begin();
        let mut copy = account.clone();
        assert!(matches!(
            controller.release_in(&scope, &mut txn, &mut copy, second.reservation_id, "late"),
            Err(Error::InvalidReservationState { .. })
        ));
    }

    #[tokio::test]
    async fn test_check_only_sums_pending() {
        let fx = fixture();
        let controller = AdmissionController::new(
            fx.storage.clone(),
            fx.locks.clone(),
            AdmissionPolicy::CheckOnly,
        );
        let business = funded(&fx, dec!(100)).await;

        let first = controller.reserve(business, dec!(60), job_ref()).await.unwrap();
        assert!(!first.held);
        assert_eq!(fx.accounts.require(business).unwrap().hold_amount, dec!(0));

        // Individually fits (60 ≤ 100) but not together with the pending 60
        let second = controller.reserve(business, dec!(60), job_ref()).await;
        assert!(matches!(second, Err(Error::InsufficientFunds { .. })));

        let decision = AdmissionDecision::from_result(
            controller.reserve(business, dec!(40), job_ref()).await,
        )
        .unwrap();
        assert!(decision.is_admitted());
    }

    #[tokio::test]
    async fn test_missing_account_is_balance_unknown() {
        let fx = fixture();
        let controller =
            AdmissionController::new(fx.storage.clone(), fx.locks.clone(), AdmissionPolicy::SoftHold);
        let result = controller
            .reserve(BusinessId::new(), dec!(10), job_ref())
            .await;
        assert!(matches!(result, Err(Error::BalanceUnknown(_))));
        assert!(AdmissionDecision::from_result(result).is_err());
    }
}
