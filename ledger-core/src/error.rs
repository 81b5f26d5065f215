//! Error types for the ledger

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Malformed posting line or entry
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Debits and credits of one correlation do not match
    #[error("Unbalanced posting {correlation_id}: debits {debits} != credits {credits}")]
    UnbalancedPosting {
        /// Correlation being posted
        correlation_id: Uuid,
        /// Sum of DEBIT lines
        debits: Decimal,
        /// Sum of CREDIT lines
        credits: Decimal,
    },

    /// Entry was reversed before; reversing again is a no-op
    #[error("Entry {0} already reversed")]
    AlreadyReversed(Uuid),

    /// Reversal refused (pending entry, reversal of a reversal, ...)
    #[error("Invalid reversal of {entry_id}: {reason}")]
    InvalidReversal {
        /// Entry the caller tried to reverse
        entry_id: Uuid,
        /// Why it was refused
        reason: String,
    },

    /// Entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// Empty or inverted time range
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Snapshot not found
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Sequence counter could not be read or advanced
    #[error("Sequence unavailable: {0}")]
    SequenceUnavailable(String),

    /// Invariant violation (money conservation, checksum mismatch, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registration error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON export error
    #[error("Export error: {0}")]
    Export(#[from] serde_json::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
