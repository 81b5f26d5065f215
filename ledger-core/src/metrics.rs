//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `ledger_postings_total` - Correlations posted
//! - `ledger_entries_total` - Entries written
//! - `ledger_reversals_total` - Entries reversed
//! - `ledger_rejected_postings_total` - Postings refused by validation
//! - `ledger_snapshots_total` - Balance snapshots written
//! - `ledger_posting_duration_seconds` - Histogram of posting latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Ledger metrics collector
#[derive(Clone)]
pub struct LedgerMetrics {
    /// Correlations posted
    pub postings_total: IntCounter,

    /// Entries written
    pub entries_total: IntCounter,

    /// Entries reversed
    pub reversals_total: IntCounter,

    /// Postings refused by validation
    pub rejected_total: IntCounter,

    /// Snapshots written
    pub snapshots_total: IntCounter,

    /// Posting duration histogram
    pub posting_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl std::fmt::Debug for LedgerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerMetrics")
            .field("postings_total", &self.postings_total.get())
            .field("entries_total", &self.entries_total.get())
            .finish()
    }
}

impl LedgerMetrics {
    /// Create a collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let postings_total = IntCounter::new("ledger_postings_total", "Correlations posted")?;
        registry.register(Box::new(postings_total.clone()))?;

        let entries_total = IntCounter::new("ledger_entries_total", "Ledger entries written")?;
        registry.register(Box::new(entries_total.clone()))?;

        let reversals_total = IntCounter::new("ledger_reversals_total", "Ledger entries reversed")?;
        registry.register(Box::new(reversals_total.clone()))?;

        let rejected_total = IntCounter::new(
            "ledger_rejected_postings_total",
            "Postings refused by validation",
        )?;
        registry.register(Box::new(rejected_total.clone()))?;

        let snapshots_total = IntCounter::new("ledger_snapshots_total", "Balance snapshots written")?;
        registry.register(Box::new(snapshots_total.clone()))?;

        let posting_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ledger_posting_duration_seconds",
                "Histogram of posting latencies",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250]),
        )?;
        registry.register(Box::new(posting_duration.clone()))?;

        Ok(Self {
            postings_total,
            entries_total,
            reversals_total,
            rejected_total,
            snapshots_total,
            posting_duration,
            registry,
        })
    }

    /// Record a committed posting
    pub fn record_posting(&self, entry_count: usize, duration_seconds: f64) {
        self.postings_total.inc();
        self.entries_total.inc_by(entry_count as u64);
        self.posting_duration.observe(duration_seconds);
    }

    /// Record a reversal
    pub fn record_reversal(&self, reversed: usize) {
        self.reversals_total.inc_by(reversed as u64);
    }

    /// Record a rejected posting
    pub fn record_rejected(&self) {
        self.rejected_total.inc();
    }

    /// Record snapshot creation
    pub fn record_snapshot(&self) {
        self.snapshots_total.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
