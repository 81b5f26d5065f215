//! Escrow accounting and admission control
//!
//! Per-business balance projections kept in step with the ledger, the
//! ordered lock manager every balance-mutating path goes through, the
//! admission controller, deposits, schedules and reconciliation.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod accounts;
pub mod admission;
pub mod config;
pub mod deposits;
pub mod error;
pub mod locks;
pub mod reconciliation;
pub mod schedules;

pub use accounts::{AccountStore, EscrowAccount, CF_ACCOUNTS};
pub use admission::{
    AdmissionController, AdmissionDecision, Reservation, ReservationStatus, CF_RESERVATIONS,
};
pub use config::{AdmissionPolicy, Config};
pub use deposits::{Deposit, DepositService, CF_DEPOSITS, CF_DEPOSIT_REFS};
pub use error::{Error, Result};
pub use locks::{LockKey, LockManager, LockRank, LockScope};
pub use reconciliation::{
    BalanceView, DiscrepancyKind, DiscrepancyStatus, Reconciliation, ReconciliationDiscrepancy,
    ReconciliationEngine, CF_DISCREPANCIES,
};
pub use schedules::{Schedule, ScheduleKind, ScheduleMember, ScheduleService, CF_SCHEDULES};

/// Column families the escrow layer adds to the ledger's storage
pub const COLUMN_FAMILIES: &[&str] = &[
    CF_ACCOUNTS,
    CF_RESERVATIONS,
    CF_DEPOSITS,
    CF_DEPOSIT_REFS,
    CF_SCHEDULES,
    CF_DISCREPANCIES,
];
