//! Escrow Ledger Core
//!
//! Append-only double-entry ledger backing the escrow engine.
//!
//! # Architecture
//!
//! - **Double entry**: every posting is a balanced set of DEBIT/CREDIT lines
//! - **Sequencer**: global, strictly increasing sequence numbers issued inside
//!   the posting's own write batch
//! - **Replay**: balances are derived from entries, bounded by daily snapshots
//! - **Audit**: time-ordered audit trail and hashed, signable audit packs
//!
//! # Invariants
//!
//! - Per correlation: Σ(debits) == Σ(credits)
//! - Entries are never modified except for the POSTED → REVERSED flip
//! - An entry is reversed at most once; reversals are never reversed
//! - `amount_minor_units == round(amount * 100)`

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod sequencer;
pub mod snapshot;
pub mod storage;
pub mod types;

// Re-exports
pub use audit::{AuditAction, AuditEvent, AuditPack, AuditPackExporter, AuditTrail};
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::{BalanceReplay, Ledger};
pub use snapshot::BalanceSnapshot;
pub use storage::{Storage, WriteTxn};
pub use types::{
    from_minor_units, to_minor_units, AccountType, BusinessId, EntryReference, LedgerEntry,
    PostingLine, PostingRequest, PostingResult, PostingState, ReferenceKind, TransactionType,
};
