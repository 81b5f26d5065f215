//! Balance snapshots
//!
//! A snapshot checkpoints one (business, account type) at a sequence number.
//! Its checksum is a hash chain over the content hashes of every entry of
//! that account up to and including the checkpoint, so a later snapshot only
//! folds in the entries since the previous one while still committing to the
//! whole history.
//!
//! Snapshots must be taken while no posting for the business is in flight
//! (the escrow layer holds the business lock), otherwise an entry with a
//! lower sequence number could commit after the checkpoint.

use crate::{
    crypto::{chain_hash, verify_signature},
    storage::{keys, WriteTxn, CF_SNAPSHOTS},
    types::{AccountType, BusinessId},
    Error, Ledger, Result,
};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Daily checkpoint of one account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    /// Snapshot ID
    pub snapshot_id: Uuid,
    /// Business
    pub business_id: BusinessId,
    /// Account
    pub account_type: AccountType,
    /// Day the checkpoint belongs to
    pub snapshot_date: NaiveDate,
    /// Exact balance (CREDIT − DEBIT)
    pub balance: Decimal,
    /// Balance in minor units
    pub balance_minor_units: i64,
    /// Last sequence included
    pub sequence_number: u64,
    /// Hash chain over every included entry
    pub checksum: [u8; 32],
    /// Number of included entries
    pub entry_count: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Ed25519 signature over [`signing_bytes`](Self::signing_bytes)
    pub signature: Option<Vec<u8>>,
    /// Public key of the signer
    pub signer_public_key: Option<[u8; 32]>,
}

impl BalanceSnapshot {
    /// Bytes covered by the signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(100);
        bytes.extend_from_slice(&self.checksum);
        bytes.extend_from_slice(self.business_id.as_bytes());
        bytes.push(self.account_type.code());
        bytes.extend_from_slice(&self.snapshot_date.num_days_from_ce().to_be_bytes());
        bytes.extend_from_slice(&self.sequence_number.to_be_bytes());
        bytes.extend_from_slice(&self.balance_minor_units.to_be_bytes());
        bytes.extend_from_slice(&self.entry_count.to_be_bytes());
        bytes
    }

    /// Hex-encoded checksum
    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }
}

impl Ledger {
    /// Latest snapshot of an account
    pub fn latest_snapshot(
        &self,
        business_id: BusinessId,
        account: AccountType,
    ) -> Result<Option<BalanceSnapshot>> {
        let prefix = keys::account(&business_id, account, None);
        Ok(self
            .storage()
            .scan_prefix::<BalanceSnapshot>(CF_SNAPSHOTS, &prefix)?
            .pop()
            .map(|(_, snapshot)| snapshot))
    }

    /// All snapshots of an account, oldest first
    pub fn snapshots(
        &self,
        business_id: BusinessId,
        account: AccountType,
    ) -> Result<Vec<BalanceSnapshot>> {
        let prefix = keys::account(&business_id, account, None);
        Ok(self
            .storage()
            .scan_prefix::<BalanceSnapshot>(CF_SNAPSHOTS, &prefix)?
            .into_iter()
            .map(|(_, snapshot)| snapshot)
            .collect())
    }

    /// Write the snapshot of `date`, or return the one already written for it
    pub fn create_snapshot(
        &self,
        business_id: BusinessId,
        account: AccountType,
        date: NaiveDate,
    ) -> Result<BalanceSnapshot> {
        let mut txn = self.storage().begin();
        let snapshot = self.create_snapshot_in(&mut txn, business_id, account, date)?;
        txn.commit()?;
        Ok(snapshot)
    }

    /// Stage the snapshot of `date` into `txn`.
    ///
    /// Snapshots are keyed by day, so a day with no new postings still gets
    /// its own record and earlier days are never overwritten. If `date`
    /// already has a snapshot it is returned and nothing is staged.
    pub fn create_snapshot_in(
        &self,
        txn: &mut WriteTxn<'_>,
        business_id: BusinessId,
        account: AccountType,
        date: NaiveDate,
    ) -> Result<BalanceSnapshot> {
        let previous = self.latest_snapshot(business_id, account)?;
        if let Some(existing) = previous.as_ref().filter(|s| s.snapshot_date == date) {
            return Ok(existing.clone());
        }
        if let Some(prev) = previous.as_ref().filter(|s| s.snapshot_date > date) {
            return Err(Error::InvalidRange(format!(
                "Snapshot for {} already exists after {}",
                prev.snapshot_date, date
            )));
        }

        let mut snapshot = self.compute_snapshot(business_id, account, date, previous.as_ref())?;
        if let Some(signer) = self.signer() {
            snapshot.signature = Some(signer.sign(&snapshot.signing_bytes()));
            snapshot.signer_public_key = Some(signer.public_key());
        }

        txn.put(
            CF_SNAPSHOTS,
            &keys::snapshot(&business_id, account, date),
            &snapshot,
        )?;

        self.metrics().record_snapshot();
        tracing::info!(
            snapshot_id = %snapshot.snapshot_id,
            business_id = %business_id,
            account = %account,
            date = %date,
            sequence = snapshot.sequence_number,
            balance = %snapshot.balance,
            checksum = %snapshot.checksum_hex(),
            "Balance snapshot staged"
        );
        Ok(snapshot)
    }

    fn compute_snapshot(
        &self,
        business_id: BusinessId,
        account: AccountType,
        date: NaiveDate,
        previous: Option<&BalanceSnapshot>,
    ) -> Result<BalanceSnapshot> {
        let (mut checksum, mut entry_count, after) = match previous {
            Some(prev) => (prev.checksum, prev.entry_count, prev.sequence_number),
            None => ([0u8; 32], 0, 0),
        };

        for entry in self.entries_for_account(business_id, account, after)? {
            checksum = chain_hash(&checksum, &entry.content_hash());
            entry_count += 1;
        }

        let replay = self.replay_balance(business_id, account, previous)?;

        Ok(BalanceSnapshot {
            snapshot_id: Uuid::now_v7(),
            business_id,
            account_type: account,
            snapshot_date: date,
            balance: replay.balance,
            balance_minor_units: replay.balance_minor_units,
            sequence_number: replay.last_sequence,
            checksum,
            entry_count,
            created_at: Utc::now(),
            signature: None,
            signer_public_key: None,
        })
    }

    /// Recompute a snapshot from genesis and check checksum, totals and signature
    pub fn verify_snapshot(&self, snapshot: &BalanceSnapshot) -> Result<()> {
        let mut checksum = [0u8; 32];
        let mut entry_count = 0u64;
        let mut balance = Decimal::ZERO;

        for entry in self.entries_for_account(snapshot.business_id, snapshot.account_type, 0)? {
            if entry.sequence_number > snapshot.sequence_number {
                break;
            }
            checksum = chain_hash(&checksum, &entry.content_hash());
            entry_count += 1;
            if entry.posting_state.is_effective() {
                balance += entry.signed_amount();
            }
        }

        if checksum != snapshot.checksum || entry_count != snapshot.entry_count {
            return Err(Error::InvariantViolation(format!(
                "Snapshot {} checksum mismatch",
                snapshot.snapshot_id
            )));
        }
        if balance != snapshot.balance {
            return Err(Error::InvariantViolation(format!(
                "Snapshot {} balance {} != replayed {}",
                snapshot.snapshot_id, snapshot.balance, balance
            )));
        }

        match (&snapshot.signature, &snapshot.signer_public_key) {
            (Some(signature), Some(public_key)) => {
                verify_signature(&snapshot.signing_bytes(), signature, public_key)
            }
            (None, None) => Ok(()),
            _ => Err(Error::SignatureError(format!(
                "Snapshot {} has incomplete signature",
                snapshot.snapshot_id
            ))),
        }
    }
}
