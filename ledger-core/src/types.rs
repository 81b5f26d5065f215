//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money, i64 minor units for persistence checks)
//! - Immutability once posted (only `posting_state` ever changes)

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Business (tenant) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessId(Uuid);

impl BusinessId {
    /// Create a fresh business ID
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for BusinessId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BusinessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Convert a decimal amount to integer minor units (cents), `round(amount * 100)`.
///
/// Midpoints round away from zero.
pub fn to_minor_units(amount: Decimal) -> crate::Result<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| crate::Error::InvalidEntry(format!("Amount {} overflows minor units", amount)))
}

/// Convert integer minor units back to a decimal amount
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Side of a double-entry line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionType {
    /// Decreases an escrow balance
    Debit = 1,
    /// Increases an escrow balance
    Credit = 2,
}

impl TransactionType {
    /// The opposite side (used by reversals)
    pub fn opposite(&self) -> Self {
        match self {
            TransactionType::Debit => TransactionType::Credit,
            TransactionType::Credit => TransactionType::Debit,
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Debit => write!(f, "DEBIT"),
            TransactionType::Credit => write!(f, "CREDIT"),
        }
    }
}

/// Ledger account a line is booked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccountType {
    /// Deposited funds held for the business
    Escrow = 1,
    /// Disbursed payroll
    Payroll = 2,
    /// Disbursed payments
    Payment = 3,
    /// Platform fees
    Fees = 4,
    /// Tax remittances
    Taxes = 5,
    /// External funding source (bank side of deposits)
    Clearing = 6,
    /// Offset for single-line reversals and reconciliation adjustments
    Suspense = 7,
}

impl AccountType {
    /// Every account type, in key order
    pub const ALL: [AccountType; 7] = [
        AccountType::Escrow,
        AccountType::Payroll,
        AccountType::Payment,
        AccountType::Fees,
        AccountType::Taxes,
        AccountType::Clearing,
        AccountType::Suspense,
    ];

    /// Single-byte key code
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Parse from key code
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.code() == code)
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccountType::Escrow => "ESCROW",
            AccountType::Payroll => "PAYROLL",
            AccountType::Payment => "PAYMENT",
            AccountType::Fees => "FEES",
            AccountType::Taxes => "TAXES",
            AccountType::Clearing => "CLEARING",
            AccountType::Suspense => "SUSPENSE",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle flag of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PostingState {
    /// Not yet effective
    Pending = 1,
    /// Effective
    Posted = 2,
    /// Effective, and offset by a later reversal entry
    Reversed = 3,
}

impl PostingState {
    /// Whether the entry participates in balance replay.
    ///
    /// A reversed entry still happened; its reversal entry offsets it.
    pub fn is_effective(&self) -> bool {
        !matches!(self, PostingState::Pending)
    }
}

/// What caused an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReferenceKind {
    /// Confirmed escrow top-up
    Deposit = 1,
    /// Payment disbursement job
    PaymentJob = 2,
    /// Payroll disbursement job
    PayrollJob = 3,
    /// Reversal of an earlier entry
    Reversal = 4,
    /// Reconciliation adjustment
    Adjustment = 5,
    /// Compensation of a disbursed job
    Compensation = 6,
    /// Operator action without another cause
    Manual = 7,
}

/// Type + id of the causing record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryReference {
    /// Record type
    pub kind: ReferenceKind,
    /// Record id
    pub id: Uuid,
}

impl EntryReference {
    /// Build a reference
    pub fn new(kind: ReferenceKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntryReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

/// One DEBIT or CREDIT line of a posting request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingLine {
    /// Business the line belongs to
    pub business_id: BusinessId,
    /// Account booked
    pub account_type: AccountType,
    /// DEBIT or CREDIT
    pub transaction_type: TransactionType,
    /// Positive amount
    pub amount: Decimal,
    /// Causing record
    pub reference: EntryReference,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
}

impl PostingLine {
    /// DEBIT line
    pub fn debit(
        business_id: BusinessId,
        account_type: AccountType,
        amount: Decimal,
        reference: EntryReference,
    ) -> Self {
        Self {
            business_id,
            account_type,
            transaction_type: TransactionType::Debit,
            amount,
            reference,
            metadata: BTreeMap::new(),
        }
    }

    /// CREDIT line
    pub fn credit(
        business_id: BusinessId,
        account_type: AccountType,
        amount: Decimal,
        reference: EntryReference,
    ) -> Self {
        Self {
            business_id,
            account_type,
            transaction_type: TransactionType::Credit,
            amount,
            reference,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach a metadata pair
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Atomic set of lines sharing one correlation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingRequest {
    /// Logical operation id
    pub correlation_id: Uuid,
    /// Balanced DEBIT/CREDIT lines
    pub lines: Vec<PostingLine>,
    /// Backdated effective time (defaults to now)
    pub effective_at: Option<DateTime<Utc>>,
}

impl PostingRequest {
    /// Request effective now
    pub fn new(correlation_id: Uuid, lines: Vec<PostingLine>) -> Self {
        Self {
            correlation_id,
            lines,
            effective_at: None,
        }
    }

    /// Backdate the posting
    pub fn effective_at(mut self, at: DateTime<Utc>) -> Self {
        self.effective_at = Some(at);
        self
    }
}

/// Immutable ledger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry id (UUIDv7)
    pub entry_id: Uuid,
    /// Global, strictly increasing sequence number
    pub sequence_number: u64,
    /// Logical operation this line belongs to
    pub correlation_id: Uuid,
    /// Owning business
    pub business_id: BusinessId,
    /// DEBIT or CREDIT
    pub transaction_type: TransactionType,
    /// Account booked
    pub account_type: AccountType,
    /// Positive amount
    pub amount: Decimal,
    /// `round(amount * 100)`
    pub amount_minor_units: i64,
    /// Causing record
    pub reference: EntryReference,
    /// Lifecycle flag
    pub posting_state: PostingState,
    /// Entry this one reverses
    pub reversal_of_id: Option<Uuid>,
    /// When the entry takes effect
    pub effective_at: DateTime<Utc>,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
}

impl LedgerEntry {
    /// Amount signed from the account's point of view (CREDIT positive)
    pub fn signed_amount(&self) -> Decimal {
        match self.transaction_type {
            TransactionType::Credit => self.amount,
            TransactionType::Debit => -self.amount,
        }
    }

    /// Minor units signed like [`signed_amount`](Self::signed_amount)
    pub fn signed_minor_units(&self) -> i64 {
        match self.transaction_type {
            TransactionType::Credit => self.amount_minor_units,
            TransactionType::Debit => -self.amount_minor_units,
        }
    }

    /// SHA-256 over the immutable fields.
    ///
    /// `posting_state` is excluded so checksums taken before a reversal stay valid.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence_number.to_be_bytes());
        hasher.update(self.entry_id.as_bytes());
        hasher.update(self.correlation_id.as_bytes());
        hasher.update(self.business_id.as_bytes());
        hasher.update([self.transaction_type as u8, self.account_type.code()]);
        hasher.update(self.amount.normalize().to_string().as_bytes());
        hasher.update(self.amount_minor_units.to_be_bytes());
        hasher.update([self.reference.kind as u8]);
        hasher.update(self.reference.id.as_bytes());
        match self.reversal_of_id {
            Some(id) => hasher.update(id.as_bytes()),
            None => hasher.update([0u8; 16]),
        }
        hasher.update(
            self.effective_at
                .timestamp_nanos_opt()
                .unwrap_or(0)
                .to_be_bytes(),
        );
        for (key, value) in &self.metadata {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.finalize().into()
    }
}

/// Outcome of a successful posting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostingResult {
    /// Correlation posted
    pub correlation_id: Uuid,
    /// Entries created, in sequence order
    pub entries: Vec<LedgerEntry>,
    /// Sum of DEBIT lines
    pub total_debits: Decimal,
    /// Sum of CREDIT lines
    pub total_credits: Decimal,
}

impl PostingResult {
    /// Net effect on one business's escrow balance (CREDIT − DEBIT)
    pub fn escrow_delta(&self, business_id: BusinessId) -> Decimal {
        self.entries
            .iter()
            .filter(|e| e.business_id == business_id && e.account_type == AccountType::Escrow)
            .map(LedgerEntry::signed_amount)
            .sum()
    }

    /// First sequence number issued
    pub fn first_sequence(&self) -> Option<u64> {
        self.entries.first().map(|e| e.sequence_number)
    }

    /// Last sequence number issued
    pub fn last_sequence(&self) -> Option<u64> {
        self.entries.last().map(|e| e.sequence_number)
    }
}
