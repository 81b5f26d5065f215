//! Escrow Engine
//!
//! Disbursement jobs funded from per-business escrow accounts.
//!
//! # Architecture
//!
//! A job is admitted against the escrow balance (funds are reserved), batched
//! into a settlement window, and executed against the payment gateway behind
//! a circuit breaker. A successful payout posts DEBIT ESCROW / CREDIT
//! PAYROLL|PAYMENT to the ledger and debits the projection in the same write
//! batch; a failure releases the reservation.
//!
//! ```text
//! create_job ─▶ admission ─▶ pending ─▶ window ─▶ executor ─▶ gateway
//!                                                    │
//!                              ledger posting ◀──────┘
//! ```
//!
//! Background workers sweep stuck and failed jobs, release orphaned
//! reservations, reconcile projections against the ledger and purge expired
//! idempotency keys.
//!
//! # Example
//!
//! ```no_run
//! use settlement::{Config, EscrowEngine, MockGateway, NewJob, PayPeriod};
//! use chrono::NaiveDate;
//! use ledger_core::BusinessId;
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> settlement::Result<()> {
//!     let engine = EscrowEngine::open(Config::default(), Arc::new(MockGateway::new()))?;
//!
//!     let business = BusinessId::new();
//!     engine.open_account(business).await?;
//!     engine
//!         .confirm_deposit(business, Decimal::new(100_000, 0), "wire-001")
//!         .await?;
//!
//!     let period = PayPeriod::new(
//!         NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
//!         NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
//!     )?;
//!     let job = engine
//!         .create_job(NewJob::payment(business, Uuid::now_v7(), Decimal::new(2_500, 0), period))
//!         .await?;
//!     let job = engine.execute_job(job.job_id).await?;
//!     println!("{} {}", job.job_id, job.status);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, missing_debug_implementations)]

pub mod circuit_breaker;
pub mod compensation;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod idempotency;
pub mod jobs;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod trigger;
pub mod types;
pub mod window;

// Re-exports
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState, CircuitState};
pub use compensation::{CompensationManager, CompensationRecord, CF_COMPENSATIONS};
pub use config::Config;
pub use engine::EscrowEngine;
pub use error::{Error, Result};
pub use executor::JobExecutor;
pub use gateway::{GatewayClient, GatewayRequest, GatewayResponse, MockBehavior, MockGateway};
pub use idempotency::{IdempotencyRecord, IdempotencyStore, CF_IDEMPOTENCY};
pub use jobs::JobManager;
pub use metrics::EngineMetrics;
pub use retry::RetryPolicy;
pub use scheduler::WorkerHandle;
pub use store::{JobStore, CF_JOBS, CF_JOB_MEMBERS, CF_JOB_STATUS, CF_WINDOWS};
pub use trigger::{ScheduleTrigger, TriggerOutcome};
pub use types::{
    CalculationSnapshot, DisbursementJob, DisbursementKind, JobStatus, NewJob, PayPeriod,
    SettlementWindow, WindowStatus, WindowType,
};
pub use window::{CycleReport, SettlementBatcher};

/// Every column family beyond the ledger's own: escrow plus settlement
pub fn column_families() -> Vec<&'static str> {
    let mut families = escrow::COLUMN_FAMILIES.to_vec();
    families.extend_from_slice(&[
        CF_JOBS,
        CF_JOB_MEMBERS,
        CF_JOB_STATUS,
        CF_WINDOWS,
        CF_IDEMPOTENCY,
        CF_COMPENSATIONS,
    ]);
    families
}
