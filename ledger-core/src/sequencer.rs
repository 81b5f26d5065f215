//! Ledger sequence numbers
//!
//! A single counter in the `meta` family, advanced with an atomic
//! increment and staged in the same [`WriteTxn`] as the entries it numbers.
//! Aborted transactions leave gaps; duplicates are impossible because the
//! in-memory counter only moves forward.

use crate::{
    error::{Error, Result},
    storage::{keys, Storage, WriteTxn, CF_ENTRIES, CF_META},
};
use std::sync::atomic::{AtomicU64, Ordering};

const SEQUENCE_KEY: &[u8] = b"ledger_sequence";

/// Issues strictly increasing sequence numbers
#[derive(Debug)]
pub struct LedgerSequencer {
    last: AtomicU64,
}

impl LedgerSequencer {
    /// Recover the high-water mark from storage
    pub fn load(storage: &Storage) -> Result<Self> {
        let stored: u64 = storage
            .get(CF_META, SEQUENCE_KEY)
            .map_err(|e| Error::SequenceUnavailable(e.to_string()))?
            .unwrap_or(0);

        // Concurrent commits may persist the counter out of order; the
        // highest entry key is authoritative.
        let highest_entry = storage
            .last_key(CF_ENTRIES)
            .map_err(|e| Error::SequenceUnavailable(e.to_string()))?
            .and_then(|key| keys::trailing_u64(&key))
            .unwrap_or(0);

        let last = stored.max(highest_entry);
        tracing::debug!(last_sequence = last, "Ledger sequencer loaded");

        Ok(Self {
            last: AtomicU64::new(last),
        })
    }

    /// Issue the next sequence number and stage the counter in `txn`
    pub fn next_sequence(&self, txn: &mut WriteTxn<'_>) -> Result<u64> {
        let next = self.last.fetch_add(1, Ordering::SeqCst) + 1;
        txn.put(CF_META, SEQUENCE_KEY, &next)
            .map_err(|e| Error::SequenceUnavailable(e.to_string()))?;
        Ok(next)
    }

    /// Last issued sequence number (0 if none)
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
