//! Idempotency keys for job creation
//!
//! A create-job request replayed with the same key and payload hash returns
//! the original job. Keys are scoped to the business and expire after a TTL.

use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use ledger_core::{storage::keys, BusinessId, Storage, WriteTxn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Idempotency records, keyed by business || sha256(key)
pub const CF_IDEMPOTENCY: &str = "settlement_idempotency";

/// Stored outcome of a keyed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Business
    pub business_id: BusinessId,
    /// Client key
    pub key: String,
    /// Hash of the request payload
    pub payload_hash: String,
    /// Job the request created
    pub job_id: Uuid,
    /// First seen
    pub created_at: DateTime<Utc>,
    /// No longer honoured after this
    pub expires_at: DateTime<Utc>,
}

/// Keyed request records
#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    storage: Arc<Storage>,
    ttl: Duration,
}

impl IdempotencyStore {
    /// Store with a key lifetime of `ttl_secs`
    pub fn new(storage: Arc<Storage>, ttl_secs: u64) -> Self {
        let ttl = Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX / 1_000));
        Self { storage, ttl }
    }

    fn record_key(business_id: &BusinessId, key: &str) -> Vec<u8> {
        keys::scoped(business_id, &Sha256::digest(key.as_bytes()))
    }

    /// Job created by an earlier request under `key`, if still live.
    ///
    /// A live key with another payload hash is an [`Error::IdempotencyConflict`].
    /// Callers hold the business lock so lookup and insert cannot interleave.
    pub fn lookup(
        &self,
        business_id: BusinessId,
        key: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Uuid>> {
        let record: Option<IdempotencyRecord> = self
            .storage
            .get(CF_IDEMPOTENCY, &Self::record_key(&business_id, key))?;
        match record {
            Some(record) if record.expires_at > now => {
                if record.payload_hash != payload_hash {
                    tracing::warn!(
                        business_id = %business_id,
                        key,
                        job_id = %record.job_id,
                        "Idempotency key replayed with a different payload"
                    );
                    return Err(Error::IdempotencyConflict(format!(
                        "key {} already used for job {}",
                        key, record.job_id
                    )));
                }
                Ok(Some(record.job_id))
            }
            _ => Ok(None),
        }
    }

    /// Stage a record for a newly created job
    pub fn stage(
        &self,
        txn: &mut WriteTxn<'_>,
        business_id: BusinessId,
        key: &str,
        payload_hash: &str,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<IdempotencyRecord> {
        let record = IdempotencyRecord {
            business_id,
            key: key.to_string(),
            payload_hash: payload_hash.to_string(),
            job_id,
            created_at: now,
            expires_at: now + self.ttl,
        };
        txn.put(CF_IDEMPOTENCY, &Self::record_key(&business_id, key), &record)?;
        Ok(record)
    }

    /// Delete records expired at `now`
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<Vec<u8>> = self
            .storage
            .scan_all::<IdempotencyRecord>(CF_IDEMPOTENCY)?
            .into_iter()
            .filter(|(_, record)| record.expires_at <= now)
            .map(|(key, _)| key)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }
        let mut txn = self.storage.begin();
        for key in &expired {
            txn.delete(CF_IDEMPOTENCY, key)?;
        }
        txn.commit()?;

        tracing::info!(purged = expired.len(), "Expired idempotency keys purged");
        Ok(expired.len())
    }
}
