//! Configuration for the ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Posting validation
    pub posting: PostingConfig,

    /// Snapshot configuration
    pub snapshot: SnapshotConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/escrow"),
            service_name: "escrow-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            posting: PostingConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
        }
    }
}

/// Posting validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostingConfig {
    /// How far `effective_at` may lie in the future (seconds)
    pub max_future_skew_secs: i64,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            max_future_skew_secs: 60,
        }
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Hex-encoded Ed25519 seed; snapshots and audit packs are signed when set
    pub signing_seed_hex: Option<String>,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `LEDGER_*` environment overrides
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(seed) = std::env::var("LEDGER_SIGNING_SEED") {
            self.snapshot.signing_seed_hex = Some(seed);
        }

        if let Ok(skew) = std::env::var("LEDGER_MAX_FUTURE_SKEW_SECS") {
            self.posting.max_future_skew_secs = skew.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_MAX_FUTURE_SKEW_SECS: {}", e))
            })?;
        }

        Ok(())
    }

    /// Signing key from the configured seed, if any
    pub fn signing_key(&self) -> crate::Result<Option<crate::crypto::KeyPair>> {
        self.snapshot
            .signing_seed_hex
            .as_deref()
            .map(crate::crypto::KeyPair::from_hex_seed)
            .transpose()
    }
}
