//! Audit trail and audit pack export
//!
//! Audit events are stored time-ordered and staged in the same transaction
//! as the action they describe. An [`AuditPack`] bundles a business's ledger
//! entries and audit events for a date range under one content hash.

use crate::{
    crypto::{chain_hash, merkle_root, to_hex, verify_signature},
    storage::{keys, Storage, WriteTxn, CF_AUDIT},
    types::{BusinessId, LedgerEntry, TransactionType},
    Error, Ledger, Result,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    /// Escrow account opened
    AccountOpened,
    /// Account frozen
    AccountFrozen,
    /// Account unfrozen
    AccountUnfrozen,
    /// Deposit confirmed
    DepositConfirmed,
    /// Funds reserved
    FundsReserved,
    /// Reservation released
    ReservationReleased,
    /// Reservation consumed by a disbursement
    ReservationConsumed,
    /// Schedule created or edited
    ScheduleChanged,
    /// Member attached to or detached from a schedule
    ScheduleMembershipChanged,
    /// Job created
    JobCreated,
    /// Job changed status
    JobTransitioned,
    /// Job marked permanently failed
    JobDeadLettered,
    /// Disbursement posted
    DisbursementPosted,
    /// Ledger entry reversed
    EntryReversed,
    /// Disbursement compensated
    DisbursementCompensated,
    /// Reconciliation discrepancy recorded
    DiscrepancyRecorded,
    /// Discrepancy moved through its workflow
    DiscrepancyTransitioned,
    /// Balance snapshot written
    SnapshotCreated,
    /// Settlement window settled or failed
    WindowClosed,
}

/// One audit trail record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event ID
    pub event_id: Uuid,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub action: AuditAction,
    /// Who did it (service, worker or operator)
    pub actor: String,
    /// Affected business
    pub business_id: Option<BusinessId>,
    /// Affected record, e.g. `job:<uuid>`
    pub subject: String,
    /// Free-form details
    pub details: BTreeMap<String, String>,
    /// SHA-256 over the fields above
    pub content_hash: [u8; 32],
}

impl AuditEvent {
    /// New event, timestamped now
    pub fn new(action: AuditAction, actor: impl Into<String>, subject: impl Into<String>) -> Self {
        let mut event = Self {
            event_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            action,
            actor: actor.into(),
            business_id: None,
            subject: subject.into(),
            details: BTreeMap::new(),
            content_hash: [0u8; 32],
        };
        event.content_hash = event.compute_hash();
        event
    }

    /// Attach the affected business
    pub fn business(mut self, business_id: BusinessId) -> Self {
        self.business_id = Some(business_id);
        self.content_hash = self.compute_hash();
        self
    }

    /// Attach a detail
    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.insert(key.into(), value.to_string());
        self.content_hash = self.compute_hash();
        self
    }

    /// Recompute the content hash
    pub fn compute_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.event_id.as_bytes());
        hasher.update(
            self.timestamp
                .timestamp_nanos_opt()
                .unwrap_or(0)
                .to_be_bytes(),
        );
        hasher.update(format!("{:?}", self.action).as_bytes());
        hasher.update([0u8]);
        hasher.update(self.actor.as_bytes());
        hasher.update([0u8]);
        match self.business_id {
            Some(id) => hasher.update(id.as_bytes()),
            None => hasher.update([0u8; 16]),
        }
        hasher.update(self.subject.as_bytes());
        hasher.update([0u8]);
        for (key, value) in &self.details {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.finalize().into()
    }

    fn key(&self) -> Vec<u8> {
        keys::timed(self.timestamp.timestamp_nanos_opt().unwrap_or(0), &self.event_id)
    }
}

/// Append-only audit trail
#[derive(Debug, Clone)]
pub struct AuditTrail {
    storage: Arc<Storage>,
}

impl AuditTrail {
    /// Trail over shared storage
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Stage an event in `txn`
    pub fn record_in(&self, txn: &mut WriteTxn<'_>, event: &AuditEvent) -> Result<()> {
        txn.put(CF_AUDIT, &event.key(), event)
    }

    /// Record an event in its own transaction
    pub fn record(&self, event: &AuditEvent) -> Result<()> {
        let mut txn = self.storage.begin();
        self.record_in(&mut txn, event)?;
        txn.commit()
    }

    /// Events with `from <= timestamp < to`, optionally for one business
    pub fn events_in_range(
        &self,
        business_id: Option<BusinessId>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditEvent>> {
        let lower = keys::timed_bound(from.timestamp_nanos_opt().unwrap_or(i64::MIN));
        let upper = keys::timed_bound(to.timestamp_nanos_opt().unwrap_or(i64::MAX));
        Ok(self
            .storage
            .scan_range::<AuditEvent>(CF_AUDIT, &lower, &upper)?
            .into_iter()
            .map(|(_, event)| event)
            .filter(|event| business_id.is_none() || event.business_id == business_id)
            .collect())
    }
}

/// Exported bundle of entries and events for external audit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPack {
    /// Pack ID
    pub pack_id: Uuid,
    /// Business covered
    pub business_id: BusinessId,
    /// Range start (inclusive)
    pub from: DateTime<Utc>,
    /// Range end (exclusive)
    pub to: DateTime<Utc>,
    /// Generation time
    pub generated_at: DateTime<Utc>,
    /// Ledger entries, sequence order
    pub entries: Vec<LedgerEntry>,
    /// Audit events, time order
    pub events: Vec<AuditEvent>,
    /// Number of entries
    pub entry_count: usize,
    /// Number of events
    pub event_count: usize,
    /// Sum of DEBIT entries
    pub total_debits: Decimal,
    /// Sum of CREDIT entries
    pub total_credits: Decimal,
    /// First sequence included
    pub first_sequence: Option<u64>,
    /// Last sequence included
    pub last_sequence: Option<u64>,
    /// Hex SHA-256 over the entry and event Merkle roots
    pub content_hash: String,
    /// Hex Ed25519 signature over the content hash
    pub signature: Option<String>,
    /// Hex public key of the signer
    pub signer_public_key: Option<String>,
}

impl AuditPack {
    fn compute_hash(entries: &[LedgerEntry], events: &[AuditEvent]) -> [u8; 32] {
        let entry_hashes: Vec<[u8; 32]> = entries.iter().map(LedgerEntry::content_hash).collect();
        let event_hashes: Vec<[u8; 32]> = events.iter().map(AuditEvent::compute_hash).collect();
        chain_hash(&merkle_root(&entry_hashes), &merkle_root(&event_hashes))
    }

    /// Recompute the content hash and check the signature
    pub fn verify(&self) -> Result<()> {
        if self.entries.len() != self.entry_count || self.events.len() != self.event_count {
            return Err(Error::InvariantViolation(format!(
                "Audit pack {} counts do not match contents",
                self.pack_id
            )));
        }

        let hash = Self::compute_hash(&self.entries, &self.events);
        if to_hex(&hash) != self.content_hash {
            return Err(Error::InvariantViolation(format!(
                "Audit pack {} content hash mismatch",
                self.pack_id
            )));
        }

        match (&self.signature, &self.signer_public_key) {
            (Some(signature), Some(public_key)) => {
                let signature = hex::decode(signature)
                    .map_err(|e| Error::SignatureError(format!("Bad signature hex: {}", e)))?;
                let public_key: [u8; 32] = hex::decode(public_key)
                    .map_err(|e| Error::SignatureError(format!("Bad public key hex: {}", e)))?
                    .try_into()
                    .map_err(|_| Error::SignatureError("Public key must be 32 bytes".to_string()))?;
                verify_signature(&hash, &signature, &public_key)
            }
            (None, None) => Ok(()),
            _ => Err(Error::SignatureError(format!(
                "Audit pack {} has incomplete signature",
                self.pack_id
            ))),
        }
    }

    /// Pretty JSON rendering
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write as JSON to `path`
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

/// Builds audit packs from the ledger and the audit trail
#[derive(Debug, Clone)]
pub struct AuditPackExporter {
    ledger: Arc<Ledger>,
    trail: AuditTrail,
}

impl AuditPackExporter {
    /// Exporter over a ledger
    pub fn new(ledger: Arc<Ledger>) -> Self {
        let trail = AuditTrail::new(ledger.storage().clone());
        Self { ledger, trail }
    }

    /// Export entries with `from <= effective_at < to` and events in the same range
    pub fn export(
        &self,
        business_id: BusinessId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditPack> {
        if from >= to {
            return Err(Error::InvalidRange(format!("{} is not before {}", from, to)));
        }

        let entries = self.ledger.entries_in_range(business_id, from, to)?;
        let events = self.trail.events_in_range(Some(business_id), from, to)?;

        let (total_debits, total_credits) = entries.iter().fold(
            (Decimal::ZERO, Decimal::ZERO),
            |(d, c), e| match e.transaction_type {
                TransactionType::Debit => (d + e.amount, c),
                TransactionType::Credit => (d, c + e.amount),
            },
        );

        let hash = AuditPack::compute_hash(&entries, &events);
        let (signature, signer_public_key) = match self.ledger.signer() {
            Some(signer) => (
                Some(to_hex(&signer.sign(&hash))),
                Some(to_hex(&signer.public_key())),
            ),
            None => (None, None),
        };

        let pack = AuditPack {
            pack_id: Uuid::now_v7(),
            business_id,
            from,
            to,
            generated_at: Utc::now(),
            entry_count: entries.len(),
            event_count: events.len(),
            first_sequence: entries.first().map(|e| e.sequence_number),
            last_sequence: entries.last().map(|e| e.sequence_number),
            entries,
            events,
            total_debits,
            total_credits,
            content_hash: to_hex(&hash),
            signature,
            signer_public_key,
        };

        tracing::info!(
            pack_id = %pack.pack_id,
            business_id = %business_id,
            entries = pack.entry_count,
            events = pack.event_count,
            content_hash = %pack.content_hash,
            "Audit pack exported"
        );
        Ok(pack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::KeyPair, AccountType, Config, EntryReference, PostingLine, PostingRequest,
        ReferenceKind,
    };
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn create_test_ledger(signed: bool) -> (TempDir, Arc<Ledger>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let mut ledger = Ledger::open(config).unwrap();
        if signed {
            ledger = ledger.with_signer(KeyPair::generate());
        }
        (temp_dir, Arc::new(ledger))
    }

    fn deposit_with_event(ledger: &Ledger, trail: &AuditTrail, business: BusinessId) {
        let deposit_id = Uuid::now_v7();
        let reference = EntryReference::new(ReferenceKind::Deposit, deposit_id);
        let mut txn = ledger.storage().begin();
        ledger
            .post_in(
                &mut txn,
                PostingRequest::new(
                    Uuid::now_v7(),
                    vec![
                        PostingLine::debit(business, AccountType::Clearing, dec!(80), reference),
                        PostingLine::credit(business, AccountType::Escrow, dec!(80), reference),
                    ],
                ),
            )
            .unwrap();
        let event = AuditEvent::new(
            AuditAction::DepositConfirmed,
            "test",
            format!("deposit:{}", deposit_id),
        )
        .business(business)
        .detail("amount", dec!(80));
        trail.record_in(&mut txn, &event).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_event_hash_tracks_details() {
        let event = AuditEvent::new(AuditAction::JobCreated, "api", "job:1");
        let detailed = event.clone().detail("amount", "10");
        assert_ne!(event.content_hash, detailed.content_hash);
        assert_eq!(detailed.content_hash, detailed.compute_hash());
    }

    #[test]
    fn test_export_signed_pack() {
        let (dir, ledger) = create_test_ledger(true);
        let trail = AuditTrail::new(ledger.storage().clone());
        let business = BusinessId::new();
        let other = BusinessId::new();

        deposit_with_event(&ledger, &trail, business);
        deposit_with_event(&ledger, &trail, business);
        deposit_with_event(&ledger, &trail, other);

        let exporter = AuditPackExporter::new(ledger.clone());
        let from = Utc::now() - Duration::hours(1);
        let to = Utc::now() + Duration::hours(1);
        let pack = exporter.export(business, from, to).unwrap();

        assert_eq!(pack.entry_count, 4);
        assert_eq!(pack.event_count, 2);
        assert_eq!(pack.total_debits, dec!(160));
        assert_eq!(pack.total_credits, dec!(160));
        assert!(pack.first_sequence < pack.last_sequence);
        assert!(pack.signature.is_some());
        pack.verify().unwrap();

        let path = dir.path().join("pack.json");
        pack.write_to(&path).unwrap();
        let loaded: AuditPack =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        loaded.verify().unwrap();

        let mut tampered = pack;
        tampered.entries[0].amount = dec!(1);
        assert!(tampered.verify().is_err());
    }

    #[test]
    fn test_export_rejects_inverted_range() {
        let (_dir, ledger) = create_test_ledger(false);
        let exporter = AuditPackExporter::new(ledger);
        let now = Utc::now();
        let result = exporter.export(BusinessId::new(), now, now);
        assert!(matches!(result, Err(Error::InvalidRange(_))));
    }

    #[test]
    fn test_empty_range_pack_verifies() {
        let (_dir, ledger) = create_test_ledger(false);
        let exporter = AuditPackExporter::new(ledger);
        let to = Utc::now() - Duration::days(30);
        let pack = exporter
            .export(BusinessId::new(), to - Duration::days(1), to)
            .unwrap();
        assert_eq!(pack.entry_count, 0);
        assert!(pack.signature.is_none());
        pack.verify().unwrap();
    }
}
