//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! Ledger families (always opened):
//!
//! - `entries` - Append-only ledger entries (key: sequence_number BE)
//! - `entry_ids` - entry_id -> sequence_number
//! - `correlation_idx` - correlation_id || sequence -> empty
//! - `account_idx` - business_id || account_code || sequence -> empty
//! - `meta` - Counters (sequence high-water mark)
//! - `snapshots` - Balance snapshots (key: business || account || sequence)
//! - `audit` - Audit trail (key: timestamp_nanos BE || event_id)
//!
//! Downstream crates register their own families through
//! [`Storage::open_with_families`]; every write still goes through one
//! [`WriteTxn`] so a posting and the records it affects commit together.

use crate::{
    error::{Error, Result},
    types::{AccountType, BusinessId},
    Config,
};
use chrono::{Datelike, NaiveDate};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle, Direction, IteratorMode, Options,
    WriteBatch, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Ledger entries, keyed by sequence number
pub const CF_ENTRIES: &str = "entries";
/// entry_id -> sequence number
pub const CF_ENTRY_IDS: &str = "entry_ids";
/// correlation_id || sequence
pub const CF_CORRELATION_IDX: &str = "correlation_idx";
/// business || account || sequence
pub const CF_ACCOUNT_IDX: &str = "account_idx";
/// Counters
pub const CF_META: &str = "meta";
/// Balance snapshots
pub const CF_SNAPSHOTS: &str = "snapshots";
/// Audit trail
pub const CF_AUDIT: &str = "audit";

const LEDGER_FAMILIES: [&str; 7] = [
    CF_ENTRIES,
    CF_ENTRY_IDS,
    CF_CORRELATION_IDX,
    CF_ACCOUNT_IDX,
    CF_META,
    CF_SNAPSHOTS,
    CF_AUDIT,
];

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database with the ledger families only
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_with_families(config, &[])
    }

    /// Open or create database with the ledger families plus `extra`
    pub fn open_with_families(config: &Config, extra: &[&str]) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.rocksdb.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.rocksdb.level0_file_num_compaction_trigger,
        );

        // Universal compaction for write-heavy workload
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let mut cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_ENTRY_IDS, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_CORRELATION_IDX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_IDX, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_META, Self::cf_options_state()),
            ColumnFamilyDescriptor::new(CF_SNAPSHOTS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_AUDIT, Self::cf_options_log()),
        ];
        for name in extra {
            if LEDGER_FAMILIES.contains(name) {
                continue;
            }
            cf_descriptors.push(ColumnFamilyDescriptor::new(*name, Self::cf_options_state()));
        }
        let family_count = cf_descriptors.len();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = family_count,
            "Opened RocksDB"
        );

        Ok(Self { db: Arc::new(db) })
    }

    // Column family options

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bottommost_compression_type(rocksdb::DBCompressionType::Zstd);
        opts
    }

    fn cf_options_state() -> Options {
        let mut opts = Options::default();
        // Frequently read, use LZ4 for speed
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false); // 10 bits per key
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    pub(crate) fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Start a write transaction
    pub fn begin(&self) -> WriteTxn<'_> {
        WriteTxn {
            storage: self,
            batch: WriteBatch::default(),
        }
    }

    /// Read and decode one value
    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.get_raw(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Read raw bytes
    pub fn get_raw(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.cf_handle(cf)?;
        Ok(self.db.get_cf(handle, key)?)
    }

    /// Decode every value whose key starts with `prefix`, in key order
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        cf: &str,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for (key, value) in self.scan_prefix_raw(cf, prefix)? {
            out.push((key, bincode::deserialize(&value)?));
        }
        Ok(out)
    }

    /// Keys starting with `prefix`, in key order
    pub fn scan_prefix_keys(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .scan_prefix_raw(cf, prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    fn scan_prefix_raw(&self, cf: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    /// Decode values with `from <= key < to`, in key order
    pub fn scan_range<T: DeserializeOwned>(
        &self,
        cf: &str,
        from: &[u8],
        to: &[u8],
    ) -> Result<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for (key, value) in self.scan_range_raw(cf, from, to)? {
            out.push((key, bincode::deserialize(&value)?));
        }
        Ok(out)
    }

    /// Keys with `from <= key < to`, in key order
    pub fn scan_range_keys(&self, cf: &str, from: &[u8], to: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .scan_range_raw(cf, from, to)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    fn scan_range_raw(&self, cf: &str, from: &[u8], to: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.cf_handle(cf)?;
        let iter = self
            .db
            .iterator_cf(handle, IteratorMode::From(from, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if key.as_ref() >= to {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    /// Decode every value of a family
    pub fn scan_all<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(Vec<u8>, T)>> {
        let handle = self.cf_handle(cf)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, value) = item?;
            out.push((key.to_vec(), bincode::deserialize(&value)?));
        }
        Ok(out)
    }

    /// Last key of a family, if any
    pub fn last_key(&self, cf: &str) -> Result<Option<Vec<u8>>> {
        let handle = self.cf_handle(cf)?;
        if let Some(item) = self.db.iterator_cf(handle, IteratorMode::End).next() {
            let (key, _) = item?;
            return Ok(Some(key.to_vec()));
        }
        Ok(None)
    }

    /// Approximate number of keys in a family
    pub fn approximate_count(&self, cf: &str) -> Result<u64> {
        let handle = self.cf_handle(cf)?;
        Ok(self
            .db
            .property_int_value_cf(handle, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }
}

/// Atomic write set over any number of column families.
///
/// Dropping a transaction without calling [`commit`](WriteTxn::commit)
/// discards every staged write.
pub struct WriteTxn<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn")
            .field("staged", &self.batch.len())
            .finish()
    }
}

impl<'a> WriteTxn<'a> {
    /// Stage an encoded value
    pub fn put<T: Serialize>(&mut self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.put_raw(cf, key, &bytes)
    }

    /// Stage raw bytes
    pub fn put_raw(&mut self, cf: &str, key: &[u8], value: &[u8]) -> Result<()> {
        let handle = self.storage.cf_handle(cf)?;
        self.batch.put_cf(handle, key, value);
        Ok(())
    }

    /// Stage a delete
    pub fn delete(&mut self, cf: &str, key: &[u8]) -> Result<()> {
        let handle = self.storage.cf_handle(cf)?;
        self.batch.delete_cf(handle, key);
        Ok(())
    }

    /// Number of staged operations
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Storage the transaction writes to
    pub fn storage(&self) -> &'a Storage {
        self.storage
    }

    /// Commit atomically
    pub fn commit(self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        self.storage.db.write(self.batch)?;
        Ok(())
    }
}

/// Key builders. All integers are big-endian so byte order is numeric order.
pub mod keys {
    use super::*;

    /// `sequence`
    pub fn entry(sequence: u64) -> [u8; 8] {
        sequence.to_be_bytes()
    }

    /// `correlation_id || sequence`
    pub fn correlation(correlation_id: &Uuid, sequence: Option<u64>) -> Vec<u8> {
        let mut key = correlation_id.as_bytes().to_vec();
        if let Some(seq) = sequence {
            key.extend_from_slice(&seq.to_be_bytes());
        }
        key
    }

    /// `business || account_code || sequence`
    pub fn account(business_id: &BusinessId, account: AccountType, sequence: Option<u64>) -> Vec<u8> {
        let mut key = business_id.as_bytes().to_vec();
        key.push(account.code());
        if let Some(seq) = sequence {
            key.extend_from_slice(&seq.to_be_bytes());
        }
        key
    }

    /// `business || account_code || days_from_ce`
    pub fn snapshot(business_id: &BusinessId, account: AccountType, date: NaiveDate) -> Vec<u8> {
        let mut key = business_id.as_bytes().to_vec();
        key.push(account.code());
        // Offset so the key stays ordered for dates before the epoch
        let ordered = (date.num_days_from_ce() as u32) ^ (1u32 << 31);
        key.extend_from_slice(&ordered.to_be_bytes());
        key
    }

    /// `business || id`
    pub fn scoped(business_id: &BusinessId, id: &[u8]) -> Vec<u8> {
        let mut key = business_id.as_bytes().to_vec();
        key.extend_from_slice(id);
        key
    }

    /// `timestamp_nanos || id`
    pub fn timed(timestamp_nanos: i64, id: &Uuid) -> Vec<u8> {
        // Offset so negative timestamps still sort before positive ones
        let ordered = (timestamp_nanos as u64) ^ (1u64 << 63);
        let mut key = ordered.to_be_bytes().to_vec();
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// Lower bound for [`timed`] keys at `timestamp_nanos`
    pub fn timed_bound(timestamp_nanos: i64) -> Vec<u8> {
        let ordered = (timestamp_nanos as u64) ^ (1u64 << 63);
        ordered.to_be_bytes().to_vec()
    }

    /// Trailing big-endian u64 of a key
    pub fn trailing_u64(key: &[u8]) -> Option<u64> {
        if key.len() < 8 {
            return None;
        }
        let bytes: [u8; 8] = key[key.len() - 8..].try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}
