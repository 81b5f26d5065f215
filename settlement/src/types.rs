//! Core types for the settlement engine

use crate::{Error, Result};
use chrono::{DateTime, Duration, DurationRound, NaiveDate, TimeZone, Utc};
use ledger_core::{AccountType, BusinessId, ReferenceKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// What a job pays out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisbursementKind {
    /// Payment to a recipient
    Payment,
    /// Salary to an employee
    Payroll,
}

impl DisbursementKind {
    /// Ledger account credited by the disbursement
    pub fn account_type(&self) -> AccountType {
        match self {
            DisbursementKind::Payment => AccountType::Payment,
            DisbursementKind::Payroll => AccountType::Payroll,
        }
    }

    /// Reference kind used for reservations and entries
    pub fn reference_kind(&self) -> ReferenceKind {
        match self {
            DisbursementKind::Payment => ReferenceKind::PaymentJob,
            DisbursementKind::Payroll => ReferenceKind::PayrollJob,
        }
    }
}

impl fmt::Display for DisbursementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisbursementKind::Payment => write!(f, "payment"),
            DisbursementKind::Payroll => write!(f, "payroll"),
        }
    }
}

/// Job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, funds reserved
    Pending,
    /// Dispatched to the gateway
    Processing,
    /// Paid and posted
    Succeeded,
    /// Gateway failure, decline or stuck
    Failed,
    /// Withdrawn
    Cancelled,
}

impl JobStatus {
    /// All statuses
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Transition table
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Failed, Processing)
                | (Failed, Cancelled)
        )
    }

    /// Counts towards the (member, period) uniqueness rule
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Processing | JobStatus::Succeeded
        )
    }

    /// No further automatic progress within a settlement window
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Stable one-byte code for index keys
    pub fn code(&self) -> u8 {
        match self {
            JobStatus::Pending => 1,
            JobStatus::Processing => 2,
            JobStatus::Succeeded => 3,
            JobStatus::Failed => 4,
            JobStatus::Cancelled => 5,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Inclusive pay period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayPeriod {
    /// First day
    pub start: NaiveDate,
    /// Last day
    pub end: NaiveDate,
}

impl PayPeriod {
    /// Period from `start` to `end`, both included
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end < start {
            return Err(Error::InvalidJob(format!(
                "period end {} before start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether the two periods share at least one day
    pub fn overlaps(&self, other: &PayPeriod) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl fmt::Display for PayPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Payroll calculation frozen at job creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationSnapshot {
    /// Gross salary
    pub gross: Decimal,
    /// Statutory and voluntary deductions by name
    pub deductions: BTreeMap<String, Decimal>,
    /// Bonuses minus corrections
    pub adjustments: Decimal,
    /// Amount paid out
    pub net: Decimal,
    /// Calculation inputs (rates, hours, …)
    pub inputs: BTreeMap<String, String>,
}

impl CalculationSnapshot {
    /// Snapshot paying the gross amount with no deductions
    pub fn gross_only(gross: Decimal) -> Self {
        Self {
            gross,
            deductions: BTreeMap::new(),
            adjustments: Decimal::ZERO,
            net: gross,
            inputs: BTreeMap::new(),
        }
    }

    /// Σ deductions
    pub fn total_deductions(&self) -> Decimal {
        self.deductions.values().copied().sum()
    }

    /// `gross − Σ deductions + adjustments`
    pub fn expected_net(&self) -> Decimal {
        self.gross - self.total_deductions() + self.adjustments
    }

    /// Always `0 < net ≤ gross + adjustments`; with `strict`, net must
    /// equal [`expected_net`](Self::expected_net) exactly.
    pub fn validate(&self, strict: bool) -> Result<()> {
        if self.net <= Decimal::ZERO {
            return Err(Error::InvalidJob(format!("net {} is not positive", self.net)));
        }
        if self.net > self.gross + self.adjustments {
            return Err(Error::InvalidJob(format!(
                "net {} exceeds gross {} plus adjustments {}",
                self.net, self.gross, self.adjustments
            )));
        }
        if self.deductions.values().any(|d| *d < Decimal::ZERO) {
            return Err(Error::InvalidJob("negative deduction".to_string()));
        }
        if strict && self.net != self.expected_net() {
            return Err(Error::InvalidJob(format!(
                "net {} differs from gross minus deductions plus adjustments {}",
                self.net,
                self.expected_net()
            )));
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON encoding, hex
    pub fn hash(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

/// Job creation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Paying business
    pub business_id: BusinessId,
    /// Payment or payroll
    pub kind: DisbursementKind,
    /// Originating schedule
    pub schedule_id: Option<Uuid>,
    /// Recipient / employee
    pub member_id: Uuid,
    /// Amount to pay (net salary for payroll)
    pub amount: Decimal,
    /// Pay period
    pub period: PayPeriod,
    /// Payroll calculation
    pub calculation: Option<CalculationSnapshot>,
    /// Deposit funding the job
    pub escrow_deposit_id: Option<Uuid>,
    /// Client idempotency key
    pub idempotency_key: Option<String>,
}

impl NewJob {
    /// Payment job
    pub fn payment(
        business_id: BusinessId,
        recipient_id: Uuid,
        amount: Decimal,
        period: PayPeriod,
    ) -> Self {
        Self {
            business_id,
            kind: DisbursementKind::Payment,
            schedule_id: None,
            member_id: recipient_id,
            amount,
            period,
            calculation: None,
            escrow_deposit_id: None,
            idempotency_key: None,
        }
    }

    /// Payroll job paying the calculation's net salary
    pub fn payroll(
        business_id: BusinessId,
        employee_id: Uuid,
        period: PayPeriod,
        calculation: CalculationSnapshot,
    ) -> Self {
        Self {
            business_id,
            kind: DisbursementKind::Payroll,
            schedule_id: None,
            member_id: employee_id,
            amount: calculation.net,
            period,
            calculation: Some(calculation),
            escrow_deposit_id: None,
            idempotency_key: None,
        }
    }

    /// Set the originating schedule
    pub fn schedule(mut self, schedule_id: Uuid) -> Self {
        self.schedule_id = Some(schedule_id);
        self
    }

    /// Set the funding deposit
    pub fn deposit(mut self, deposit_id: Uuid) -> Self {
        self.escrow_deposit_id = Some(deposit_id);
        self
    }

    /// Set the idempotency key
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Hash of everything but the idempotency key
    pub fn payload_hash(&self) -> Result<String> {
        let mut payload = self.clone();
        payload.idempotency_key = None;
        let canonical = serde_json::to_vec(&payload)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }
}

/// One disbursement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisbursementJob {
    /// Job ID (also the disbursement correlation id and gateway idempotency key)
    pub job_id: Uuid,
    /// Paying business
    pub business_id: BusinessId,
    /// Payment or payroll
    pub kind: DisbursementKind,
    /// Originating schedule
    pub schedule_id: Option<Uuid>,
    /// Recipient / employee
    pub member_id: Uuid,
    /// Amount paid
    pub amount: Decimal,
    /// Pay period
    pub period: PayPeriod,
    /// Frozen payroll calculation
    pub calculation: Option<CalculationSnapshot>,
    /// Hash of `calculation`
    pub calculation_hash: Option<String>,
    /// Deposit funding the job
    pub escrow_deposit_id: Option<Uuid>,
    /// Lifecycle
    pub status: JobStatus,
    /// Current reservation
    pub reservation_id: Option<Uuid>,
    /// Settlement window the job was batched into
    pub settlement_window_id: Option<Uuid>,
    /// Times the job entered processing
    pub attempts: u32,
    /// Last failure reason
    pub error_message: Option<String>,
    /// Gateway transaction of the payout
    pub gateway_transaction_id: Option<String>,
    /// Idempotency key it was created under
    pub idempotency_key: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// Last entry into processing
    pub processing_started_at: Option<DateTime<Utc>>,
    /// Succeeded or cancelled at
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure time
    pub failed_at: Option<DateTime<Utc>>,
    /// Dead-letter mark; excluded from automatic retry
    pub permanently_failed_at: Option<DateTime<Utc>>,
    /// Disbursement reversed at
    pub compensated_at: Option<DateTime<Utc>>,
    /// Bumped on every write
    pub version: u64,
}

impl DisbursementJob {
    /// Job in `pending` built from a request
    pub fn from_request(job_id: Uuid, request: &NewJob, calculation_hash: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            business_id: request.business_id,
            kind: request.kind,
            schedule_id: request.schedule_id,
            member_id: request.member_id,
            amount: request.amount,
            period: request.period,
            calculation: request.calculation.clone(),
            calculation_hash,
            escrow_deposit_id: request.escrow_deposit_id,
            status: JobStatus::Pending,
            reservation_id: None,
            settlement_window_id: None,
            attempts: 0,
            error_message: None,
            gateway_transaction_id: None,
            idempotency_key: request.idempotency_key.clone(),
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            completed_at: None,
            failed_at: None,
            permanently_failed_at: None,
            compensated_at: None,
            version: 0,
        }
    }

    /// Fail with [`Error::ImmutableFieldViolation`] if `updated` changes a
    /// field frozen at creation
    pub fn check_immutable(&self, updated: &DisbursementJob) -> Result<()> {
        let violation = |field| {
            Err(Error::ImmutableFieldViolation {
                job_id: self.job_id,
                field,
            })
        };
        if self.job_id != updated.job_id {
            return violation("job_id");
        }
        if self.business_id != updated.business_id {
            return violation("business_id");
        }
        if self.kind != updated.kind {
            return violation("kind");
        }
        if self.schedule_id != updated.schedule_id {
            return violation("schedule_id");
        }
        if self.member_id != updated.member_id {
            return violation("member_id");
        }
        if self.amount != updated.amount {
            return violation("amount");
        }
        if self.period != updated.period {
            return violation("period");
        }
        if self.calculation != updated.calculation {
            return violation("calculation");
        }
        if self.calculation_hash != updated.calculation_hash {
            return violation("calculation_hash");
        }
        if self.escrow_deposit_id != updated.escrow_deposit_id {
            return violation("escrow_deposit_id");
        }
        if self.idempotency_key != updated.idempotency_key {
            return violation("idempotency_key");
        }
        if self.created_at != updated.created_at {
            return violation("created_at");
        }
        Ok(())
    }

    /// Dead-lettered
    pub fn is_dead_lettered(&self) -> bool {
        self.permanently_failed_at.is_some()
    }
}

/// Settlement window bucket size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    /// One window per hour
    Hourly,
    /// One window per day
    Daily,
    /// Fixed-size buckets
    Custom {
        /// Bucket length
        seconds: u64,
    },
}

impl WindowType {
    /// `[start, end)` of the bucket containing `at`
    pub fn bucket(&self, at: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let length = match self {
            WindowType::Hourly => Duration::hours(1),
            WindowType::Daily => Duration::days(1),
            WindowType::Custom { seconds } => {
                if *seconds == 0 {
                    return Err(Error::Config("custom window of zero seconds".to_string()));
                }
                let seconds = i64::try_from(*seconds)
                    .map_err(|_| Error::Config("custom window too long".to_string()))?;
                let start = at.timestamp().div_euclid(seconds) * seconds;
                let start = Utc
                    .timestamp_opt(start, 0)
                    .single()
                    .ok_or_else(|| Error::Config("window start out of range".to_string()))?;
                return Ok((start, start + Duration::seconds(seconds)));
            }
        };
        let start = at
            .duration_trunc(length)
            .map_err(|e| Error::Config(format!("cannot bucket {}: {}", at, e)))?;
        Ok((start, start + length))
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowType::Hourly => write!(f, "hourly"),
            WindowType::Daily => write!(f, "daily"),
            WindowType::Custom { seconds } => write!(f, "custom({}s)", seconds),
        }
    }
}

/// Window lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    /// Collecting jobs, not claimed
    Pending,
    /// Claimed by a worker
    Processing,
    /// Every member job terminal
    Settled,
    /// Batch could not complete
    Failed,
}

impl fmt::Display for WindowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowStatus::Pending => write!(f, "pending"),
            WindowStatus::Processing => write!(f, "processing"),
            WindowStatus::Settled => write!(f, "settled"),
            WindowStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Time-bounded batch of jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementWindow {
    /// Window ID
    pub window_id: Uuid,
    /// Bucket size
    pub window_type: WindowType,
    /// Bucket start
    pub window_start: DateTime<Utc>,
    /// Bucket end (exclusive)
    pub window_end: DateTime<Utc>,
    /// Lifecycle
    pub status: WindowStatus,
    /// Member jobs
    pub job_ids: Vec<Uuid>,
    /// Number of member jobs
    pub transaction_count: u64,
    /// Σ member job amounts
    pub total_amount: Decimal,
    /// Worker that claimed it
    pub claimed_by: Option<String>,
    /// Why the batch failed
    pub failure_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Settled at
    pub settled_at: Option<DateTime<Utc>>,
}
