//! Error types for escrow accounting and admission

use ledger_core::BusinessId;
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for escrow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Escrow errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger or storage failure
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Requested amount is zero or negative
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    /// Not enough available funds
    #[error("Insufficient funds for {business_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        /// Business
        business_id: BusinessId,
        /// Requested amount
        requested: Decimal,
        /// Available after holds and pending reservations
        available: Decimal,
    },

    /// Account is frozen
    #[error("Account frozen: {0}")]
    AccountFrozen(BusinessId),

    /// No balance projection for an active business
    #[error("Balance unknown for {0}")]
    BalanceUnknown(BusinessId),

    /// Record changed since it was read
    #[error("Concurrent modification of {entity}: expected version {expected}, found {found}")]
    ConcurrentModification {
        /// Record description
        entity: String,
        /// Version the caller read
        expected: u64,
        /// Version now stored
        found: u64,
    },

    /// Balance invariant violated
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Lock requested out of the global order
    #[error("Lock order violation: {requested} requested after {held}")]
    LockOrderViolation {
        /// Last lock held
        held: String,
        /// Lock requested
        requested: String,
    },

    /// Operation requires a lock the caller does not hold
    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    /// Cached balance diverges from the ledger
    #[error("Reconciliation discrepancy {discrepancy_id} for {business_id}: stored {stored}, ledger {computed}")]
    ReconciliationDiscrepancyDetected {
        /// Business
        business_id: BusinessId,
        /// Recorded discrepancy
        discrepancy_id: Uuid,
        /// Projection balance
        stored: Decimal,
        /// Ledger balance
        computed: Decimal,
    },

    /// Schedule not found
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(Uuid),

    /// Schedule definition rejected
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Reservation not found
    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    /// Reservation is not in a state that allows the operation
    #[error("Reservation {reservation_id} is {status}")]
    InvalidReservationState {
        /// Reservation
        reservation_id: Uuid,
        /// Current status
        status: String,
    },

    /// Deposit not found
    #[error("Deposit not found: {0}")]
    DepositNotFound(Uuid),

    /// Same external reference confirmed with different contents
    #[error("Deposit conflict: {0}")]
    DepositConflict(String),

    /// Discrepancy not found
    #[error("Discrepancy not found: {0}")]
    DiscrepancyNotFound(Uuid),

    /// Discrepancy workflow step not allowed
    #[error("Invalid discrepancy transition for {id}: {from} -> {to}")]
    InvalidDiscrepancyTransition {
        /// Discrepancy
        id: Uuid,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
