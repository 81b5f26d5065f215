//! Double-entry ledger
//!
//! Every balance-affecting operation is a [`PostingRequest`]: a set of
//! DEBIT/CREDIT lines sharing one correlation id whose debits equal their
//! credits. Lines are numbered by the [`LedgerSequencer`] inside the same
//! [`WriteTxn`] that writes them, so a posting is all-or-nothing.
//!
//! # Example
//!
//! ```no_run
//! use ledger_core::{
//!     AccountType, BusinessId, Config, EntryReference, Ledger, PostingLine, PostingRequest,
//!     ReferenceKind,
//! };
//! use rust_decimal::Decimal;
//! use uuid::Uuid;
//!
//! fn main() -> ledger_core::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!     let business = BusinessId::new();
//!     let deposit = EntryReference::new(ReferenceKind::Deposit, Uuid::now_v7());
//!     let amount = Decimal::new(100000, 2);
//!
//!     let result = ledger.post(PostingRequest::new(
//!         Uuid::now_v7(),
//!         vec![
//!             PostingLine::debit(business, AccountType::Clearing, amount, deposit),
//!             PostingLine::credit(business, AccountType::Escrow, amount, deposit),
//!         ],
//!     ))?;
//!     assert_eq!(result.escrow_delta(business), amount);
//!     Ok(())
//! }
//! ```

use crate::{
    crypto::KeyPair,
    metrics::LedgerMetrics,
    sequencer::LedgerSequencer,
    snapshot::BalanceSnapshot,
    storage::{keys, Storage, WriteTxn, CF_ACCOUNT_IDX, CF_CORRELATION_IDX, CF_ENTRIES, CF_ENTRY_IDS},
    types::{
        to_minor_units, AccountType, BusinessId, EntryReference, LedgerEntry, PostingLine,
        PostingRequest, PostingResult, PostingState, ReferenceKind, TransactionType,
    },
    Config, Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Result of replaying an account's entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReplay {
    /// Business replayed
    pub business_id: BusinessId,
    /// Account replayed
    pub account_type: AccountType,
    /// Σ CREDIT − Σ DEBIT
    pub balance: Decimal,
    /// Same sum in minor units
    pub balance_minor_units: i64,
    /// Last sequence included (0 if none)
    pub last_sequence: u64,
    /// Entries folded in on top of the starting snapshot
    pub entries_replayed: usize,
}

/// Main ledger interface
pub struct Ledger {
    storage: Arc<Storage>,
    sequencer: LedgerSequencer,
    metrics: LedgerMetrics,
    signer: Option<Arc<KeyPair>>,
    config: Config,
    // Serializes the read-check-flip of self-committing reversals
    reversal_lock: Mutex<()>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("last_sequence", &self.sequencer.current())
            .field("signing", &self.signer.is_some())
            .finish()
    }
}

impl Ledger {
    /// Open ledger with its own storage
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        Self::with_storage(storage, config)
    }

    /// Open ledger on storage shared with other components
    pub fn with_storage(storage: Arc<Storage>, config: Config) -> Result<Self> {
        let sequencer = LedgerSequencer::load(&storage)?;
        let signer = config.signing_key()?.map(Arc::new);
        let metrics = LedgerMetrics::new()?;

        tracing::info!(
            service = %config.service_name,
            last_sequence = sequencer.current(),
            signing = signer.is_some(),
            "Ledger opened"
        );

        Ok(Self {
            storage,
            sequencer,
            metrics,
            signer,
            config,
            reversal_lock: Mutex::new(()),
        })
    }

    /// Replace the signing key
    pub fn with_signer(mut self, keypair: KeyPair) -> Self {
        self.signer = Some(Arc::new(keypair));
        self
    }

    /// Underlying storage
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Metrics collector
    pub fn metrics(&self) -> &LedgerMetrics {
        &self.metrics
    }

    /// Signing key, if configured
    pub fn signer(&self) -> Option<&KeyPair> {
        self.signer.as_deref()
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Last issued sequence number
    pub fn last_sequence(&self) -> u64 {
        self.sequencer.current()
    }

    // Posting

    /// Validate and post a request in its own transaction
    pub fn post(&self, request: PostingRequest) -> Result<PostingResult> {
        let mut txn = self.storage.begin();
        let result = self.post_in(&mut txn, request)?;
        txn.commit()?;

        tracing::info!(
            correlation_id = %result.correlation_id,
            entries = result.entries.len(),
            total = %result.total_debits,
            "Posting committed"
        );
        Ok(result)
    }

    /// Validate a request and stage its entries in `txn`
    pub fn post_in(&self, txn: &mut WriteTxn<'_>, request: PostingRequest) -> Result<PostingResult> {
        let started = Instant::now();
        let effective_at = match self.validate(&request) {
            Ok(at) => at,
            Err(e) => {
                self.metrics.record_rejected();
                tracing::warn!(
                    correlation_id = %request.correlation_id,
                    error = %e,
                    "Posting rejected"
                );
                return Err(e);
            }
        };

        let lines = request.lines.into_iter().map(|line| (line, None)).collect();
        let result = self.stage(txn, request.correlation_id, lines, effective_at)?;

        self.metrics
            .record_posting(result.entries.len(), started.elapsed().as_secs_f64());
        Ok(result)
    }

    fn validate(&self, request: &PostingRequest) -> Result<DateTime<Utc>> {
        if request.lines.is_empty() {
            return Err(Error::InvalidEntry("Posting has no lines".to_string()));
        }

        let mut debits = Decimal::ZERO;
        let mut credits = Decimal::ZERO;
        for line in &request.lines {
            if line.amount <= Decimal::ZERO {
                return Err(Error::InvalidEntry(format!(
                    "Amount must be positive, got {}",
                    line.amount
                )));
            }
            match line.transaction_type {
                TransactionType::Debit => debits += line.amount,
                TransactionType::Credit => credits += line.amount,
            }
        }

        if debits != credits {
            return Err(Error::UnbalancedPosting {
                correlation_id: request.correlation_id,
                debits,
                credits,
            });
        }

        let now = Utc::now();
        let effective_at = request.effective_at.unwrap_or(now);
        if effective_at > now + Duration::seconds(self.config.posting.max_future_skew_secs) {
            return Err(Error::InvalidEntry(format!(
                "effective_at {} is in the future",
                effective_at
            )));
        }

        Ok(effective_at)
    }

    fn stage(
        &self,
        txn: &mut WriteTxn<'_>,
        correlation_id: Uuid,
        lines: Vec<(PostingLine, Option<Uuid>)>,
        effective_at: DateTime<Utc>,
    ) -> Result<PostingResult> {
        let created_at = Utc::now();
        let mut entries = Vec::with_capacity(lines.len());
        let mut total_debits = Decimal::ZERO;
        let mut total_credits = Decimal::ZERO;

        for (line, reversal_of_id) in lines {
            let sequence_number = self.sequencer.next_sequence(txn)?;
            let entry = LedgerEntry {
                entry_id: Uuid::now_v7(),
                sequence_number,
                correlation_id,
                business_id: line.business_id,
                transaction_type: line.transaction_type,
                account_type: line.account_type,
                amount: line.amount,
                amount_minor_units: to_minor_units(line.amount)?,
                reference: line.reference,
                posting_state: PostingState::Posted,
                reversal_of_id,
                effective_at,
                created_at,
                metadata: line.metadata,
            };

            match entry.transaction_type {
                TransactionType::Debit => total_debits += entry.amount,
                TransactionType::Credit => total_credits += entry.amount,
            }

            txn.put(CF_ENTRIES, &keys::entry(sequence_number), &entry)?;
            txn.put(CF_ENTRY_IDS, entry.entry_id.as_bytes(), &sequence_number)?;
            txn.put_raw(
                CF_CORRELATION_IDX,
                &keys::correlation(&correlation_id, Some(sequence_number)),
                &[],
            )?;
            txn.put_raw(
                CF_ACCOUNT_IDX,
                &keys::account(&entry.business_id, entry.account_type, Some(sequence_number)),
                &[],
            )?;

            tracing::debug!(
                entry_id = %entry.entry_id,
                sequence = sequence_number,
                business_id = %entry.business_id,
                account = %entry.account_type,
                side = %entry.transaction_type,
                amount = %entry.amount,
                "Entry staged"
            );
            entries.push(entry);
        }

        Ok(PostingResult {
            correlation_id,
            entries,
            total_debits,
            total_credits,
        })
    }

    // Reversal

    /// Reverse one entry in its own transaction.
    ///
    /// Creates the swapped entry plus an offsetting SUSPENSE line so the new
    /// correlation stays balanced, then flips the original to REVERSED.
    pub fn reverse(&self, entry_id: Uuid, reason: &str) -> Result<LedgerEntry> {
        let _guard = self.reversal_lock.lock();
        let mut txn = self.storage.begin();
        let reversal = self.reverse_in(&mut txn, entry_id, reason)?;
        txn.commit()?;
        Ok(reversal)
    }

    /// Stage the reversal of one entry in `txn`.
    ///
    /// Callers must serialize reversals of the same business (the escrow
    /// layer holds the business lock) so two transactions cannot both
    /// observe the entry as POSTED.
    pub fn reverse_in(
        &self,
        txn: &mut WriteTxn<'_>,
        entry_id: Uuid,
        reason: &str,
    ) -> Result<LedgerEntry> {
        let original = self.get_entry(entry_id)?;
        Self::check_reversible(&original)?;

        let reference = EntryReference::new(ReferenceKind::Reversal, original.entry_id);
        let swapped = PostingLine {
            business_id: original.business_id,
            account_type: original.account_type,
            transaction_type: original.transaction_type.opposite(),
            amount: original.amount,
            reference,
            metadata: Default::default(),
        }
        .with_metadata("reason", reason)
        .with_metadata("original_correlation_id", original.correlation_id.to_string());

        let offset = PostingLine {
            business_id: original.business_id,
            account_type: AccountType::Suspense,
            transaction_type: original.transaction_type,
            amount: original.amount,
            reference,
            metadata: Default::default(),
        }
        .with_metadata("reason", reason);

        let result = self.stage(
            txn,
            Uuid::now_v7(),
            vec![(swapped, Some(original.entry_id)), (offset, None)],
            Utc::now(),
        )?;
        self.flip_reversed(txn, original.clone())?;

        let reversal = result
            .entries
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvariantViolation("Reversal produced no entry".to_string()))?;

        self.metrics.record_reversal(1);
        tracing::info!(
            entry_id = %original.entry_id,
            reversal_id = %reversal.entry_id,
            business_id = %original.business_id,
            amount = %original.amount,
            reason,
            "Entry reversed"
        );
        Ok(reversal)
    }

    /// Stage the reversal of every line of a correlation in `txn`.
    ///
    /// The swapped lines are balanced among themselves, so no SUSPENSE line
    /// is needed. Same locking contract as [`reverse_in`](Self::reverse_in).
    pub fn reverse_correlation_in(
        &self,
        txn: &mut WriteTxn<'_>,
        correlation_id: Uuid,
        reason: &str,
    ) -> Result<PostingResult> {
        let originals = self.entries_for_correlation(correlation_id)?;
        if originals.is_empty() {
            return Err(Error::EntryNotFound(format!("correlation {}", correlation_id)));
        }
        for original in &originals {
            Self::check_reversible(original)?;
        }

        let lines = originals
            .iter()
            .map(|original| {
                let line = PostingLine {
                    business_id: original.business_id,
                    account_type: original.account_type,
                    transaction_type: original.transaction_type.opposite(),
                    amount: original.amount,
                    reference: EntryReference::new(ReferenceKind::Reversal, original.entry_id),
                    metadata: Default::default(),
                }
                .with_metadata("reason", reason)
                .with_metadata("original_correlation_id", correlation_id.to_string());
                (line, Some(original.entry_id))
            })
            .collect();

        let result = self.stage(txn, Uuid::now_v7(), lines, Utc::now())?;
        for original in originals.iter().cloned() {
            self.flip_reversed(txn, original)?;
        }

        self.metrics.record_reversal(originals.len());
        tracing::info!(
            correlation_id = %correlation_id,
            reversal_correlation_id = %result.correlation_id,
            entries = originals.len(),
            reason,
            "Correlation reversed"
        );
        Ok(result)
    }

    /// Reverse a whole correlation in its own transaction
    pub fn reverse_correlation(&self, correlation_id: Uuid, reason: &str) -> Result<PostingResult> {
        let _guard = self.reversal_lock.lock();
        let mut txn = self.storage.begin();
        let result = self.reverse_correlation_in(&mut txn, correlation_id, reason)?;
        txn.commit()?;
        Ok(result)
    }

    fn check_reversible(entry: &LedgerEntry) -> Result<()> {
        match entry.posting_state {
            PostingState::Reversed => return Err(Error::AlreadyReversed(entry.entry_id)),
            PostingState::Pending => {
                return Err(Error::InvalidReversal {
                    entry_id: entry.entry_id,
                    reason: "entry is pending".to_string(),
                })
            }
            PostingState::Posted => {}
        }
        if entry.reversal_of_id.is_some() {
            return Err(Error::InvalidReversal {
                entry_id: entry.entry_id,
                reason: "entry is itself a reversal".to_string(),
            });
        }
        Ok(())
    }

    fn flip_reversed(&self, txn: &mut WriteTxn<'_>, mut original: LedgerEntry) -> Result<()> {
        original.posting_state = PostingState::Reversed;
        txn.put(CF_ENTRIES, &keys::entry(original.sequence_number), &original)
    }

    // Queries

    /// Get entry by ID
    pub fn get_entry(&self, entry_id: Uuid) -> Result<LedgerEntry> {
        let sequence: u64 = self
            .storage
            .get(CF_ENTRY_IDS, entry_id.as_bytes())?
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))?;
        self.get_by_sequence(sequence)?
            .ok_or_else(|| Error::EntryNotFound(entry_id.to_string()))
    }

    /// Get entry by sequence number
    pub fn get_by_sequence(&self, sequence: u64) -> Result<Option<LedgerEntry>> {
        self.storage.get(CF_ENTRIES, &keys::entry(sequence))
    }

    /// All lines of a correlation, in sequence order
    pub fn entries_for_correlation(&self, correlation_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let prefix = keys::correlation(&correlation_id, None);
        let sequences = self
            .storage
            .scan_prefix_keys(CF_CORRELATION_IDX, &prefix)?
            .iter()
            .filter_map(|key| keys::trailing_u64(key))
            .collect::<Vec<_>>();
        self.load_sequences(&sequences)
    }

    /// Entries of one account with `sequence_number > after_sequence`
    pub fn entries_for_account(
        &self,
        business_id: BusinessId,
        account: AccountType,
        after_sequence: u64,
    ) -> Result<Vec<LedgerEntry>> {
        let sequences = self.account_sequences(business_id, account, after_sequence)?;
        self.load_sequences(&sequences)
    }

    /// Entries of every account of a business with `from <= effective_at < to`
    pub fn entries_in_range(
        &self,
        business_id: BusinessId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::new();
        for account in AccountType::ALL {
            for entry in self.entries_for_account(business_id, account, 0)? {
                if entry.effective_at >= from && entry.effective_at < to {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by_key(|e| e.sequence_number);
        Ok(entries)
    }

    fn account_sequences(
        &self,
        business_id: BusinessId,
        account: AccountType,
        after_sequence: u64,
    ) -> Result<Vec<u64>> {
        let from = keys::account(&business_id, account, Some(after_sequence.saturating_add(1)));
        let mut to = keys::account(&business_id, account, None);
        // Exclusive upper bound: next account code
        if let Some(code) = to.last_mut() {
            *code = code.saturating_add(1);
        }
        Ok(self
            .storage
            .scan_range_keys(CF_ACCOUNT_IDX, &from, &to)?
            .iter()
            .filter_map(|key| keys::trailing_u64(key))
            .collect())
    }

    fn load_sequences(&self, sequences: &[u64]) -> Result<Vec<LedgerEntry>> {
        sequences
            .iter()
            .map(|seq| {
                self.get_by_sequence(*seq)?.ok_or_else(|| {
                    Error::InvariantViolation(format!("Index points at missing entry {}", seq))
                })
            })
            .collect()
    }

    /// Check that a correlation's debits equal its credits
    pub fn verify_correlation(&self, correlation_id: Uuid) -> Result<()> {
        let entries = self.entries_for_correlation(correlation_id)?;
        let (debits, credits) = entries.iter().fold(
            (Decimal::ZERO, Decimal::ZERO),
            |(d, c), e| match e.transaction_type {
                TransactionType::Debit => (d + e.amount, c),
                TransactionType::Credit => (d, c + e.amount),
            },
        );
        if debits != credits {
            return Err(Error::UnbalancedPosting {
                correlation_id,
                debits,
                credits,
            });
        }
        Ok(())
    }

    // Replay

    /// Net CREDIT − DEBIT of an account's effective entries, starting from
    /// `from_snapshot` (or zero) and folding every later entry in.
    pub fn replay_balance(
        &self,
        business_id: BusinessId,
        account: AccountType,
        from_snapshot: Option<&BalanceSnapshot>,
    ) -> Result<BalanceReplay> {
        let (mut balance, mut minor, mut last_sequence) = match from_snapshot {
            Some(snapshot) => {
                if snapshot.business_id != business_id || snapshot.account_type != account {
                    return Err(Error::InvalidEntry(format!(
                        "Snapshot {} belongs to another account",
                        snapshot.snapshot_id
                    )));
                }
                (
                    snapshot.balance,
                    snapshot.balance_minor_units,
                    snapshot.sequence_number,
                )
            }
            None => (Decimal::ZERO, 0i64, 0u64),
        };

        let entries = self.entries_for_account(business_id, account, last_sequence)?;
        let mut entries_replayed = 0;
        for entry in &entries {
            last_sequence = entry.sequence_number;
            if !entry.posting_state.is_effective() {
                continue;
            }
            balance += entry.signed_amount();
            minor += entry.signed_minor_units();
            entries_replayed += 1;
        }

        Ok(BalanceReplay {
            business_id,
            account_type: account,
            balance,
            balance_minor_units: minor,
            last_sequence,
            entries_replayed,
        })
    }
}
