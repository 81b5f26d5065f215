//! Error types for the settlement engine

use thiserror::Error;
use uuid::Uuid;

/// Result type for settlement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Settlement errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] ledger_core::Error),

    /// Escrow error (admission, locks, projection)
    #[error("Escrow error: {0}")]
    Escrow(#[from] escrow::Error),

    /// Job status change not in the transition table
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        /// Job
        job_id: Uuid,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// Attempt to change a field frozen at creation
    #[error("Immutable field {field} of job {job_id} cannot change")]
    ImmutableFieldViolation {
        /// Job
        job_id: Uuid,
        /// Field name
        field: &'static str,
    },

    /// Another active job covers an overlapping period
    #[error("Period overlaps active job {existing_job} for member {member_id}")]
    PeriodOverlap {
        /// Employee / recipient
        member_id: Uuid,
        /// Conflicting job
        existing_job: Uuid,
    },

    /// Another active job covers the same period
    #[error("Duplicate active job {existing_job} for member {member_id}")]
    DuplicateActiveJob {
        /// Employee / recipient
        member_id: Uuid,
        /// Existing job
        existing_job: Uuid,
    },

    /// Idempotency key replayed with a different payload
    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),

    /// Job record changed since it was read
    #[error("Concurrent modification of job {job_id}: expected version {expected}, found {found}")]
    ConcurrentModification {
        /// Job
        job_id: Uuid,
        /// Version the caller read
        expected: u64,
        /// Version now stored
        found: u64,
    },

    /// Circuit breaker is open for the operation
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Gateway did not answer in time
    #[error("Gateway timeout for job {job_id} after {timeout_ms}ms")]
    GatewayTimeout {
        /// Job
        job_id: Uuid,
        /// Timeout applied
        timeout_ms: u64,
    },

    /// Transient gateway failure
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    /// Job rejected at creation
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Job is dead-lettered and needs manual review
    #[error("Job {0} is permanently failed")]
    DeadLettered(Uuid),

    /// Disbursement already compensated
    #[error("Job {0} already compensated")]
    AlreadyCompensated(Uuid),

    /// Settlement window not found
    #[error("Settlement window not found: {0}")]
    WindowNotFound(Uuid),

    /// Settlement window in the wrong state
    #[error("Settlement window {window_id} is {status}")]
    InvalidWindowState {
        /// Window
        window_id: Uuid,
        /// Current status
        status: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error is an admission refusal for lack of funds
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(self, Error::Escrow(escrow::Error::InsufficientFunds { .. }))
    }

    /// Whether a retry of the gateway call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::GatewayTimeout { .. } | Error::GatewayUnavailable(_)
        )
    }
}
