//! Metrics collection for the escrow engine
//!
//! # Metrics
//!
//! - `engine_jobs_created_total` - Jobs admitted and created
//! - `engine_admissions_refused_total` - Job creations refused for lack of funds
//! - `engine_job_transitions_total` - Job status changes
//! - `engine_gateway_calls_total` - Gateway calls made
//! - `engine_gateway_failures_total` - Transient gateway failures and timeouts
//! - `engine_windows_settled_total` - Settlement windows settled
//! - `engine_windows_failed_total` - Settlement windows failed
//! - `engine_stuck_jobs_swept_total` - Processing jobs force-failed
//! - `engine_dead_lettered_total` - Jobs marked permanently failed
//! - `engine_compensations_total` - Disbursements compensated
//! - `engine_gateway_duration_seconds` - Histogram of gateway call latencies

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Engine metrics collector
#[derive(Clone)]
pub struct EngineMetrics {
    /// Jobs created
    pub jobs_created: IntCounter,

    /// Creations refused with insufficient funds
    pub admissions_refused: IntCounter,

    /// Job status changes
    pub job_transitions: IntCounter,

    /// Gateway calls
    pub gateway_calls: IntCounter,

    /// Transient gateway failures
    pub gateway_failures: IntCounter,

    /// Windows settled
    pub windows_settled: IntCounter,

    /// Windows failed
    pub windows_failed: IntCounter,

    /// Stuck jobs swept
    pub stuck_swept: IntCounter,

    /// Jobs dead-lettered
    pub dead_lettered: IntCounter,

    /// Disbursements compensated
    pub compensations: IntCounter,

    /// Gateway latency
    pub gateway_duration: Histogram,

    registry: Arc<Registry>,
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics")
            .field("jobs_created", &self.jobs_created.get())
            .field("job_transitions", &self.job_transitions.get())
            .field("gateway_calls", &self.gateway_calls.get())
            .finish()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl EngineMetrics {
    /// Create a collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let jobs_created = counter(&registry, "engine_jobs_created_total", "Jobs created")?;
        let admissions_refused = counter(
            &registry,
            "engine_admissions_refused_total",
            "Job creations refused for lack of funds",
        )?;
        let job_transitions =
            counter(&registry, "engine_job_transitions_total", "Job status changes")?;
        let gateway_calls = counter(&registry, "engine_gateway_calls_total", "Gateway calls")?;
        let gateway_failures = counter(
            &registry,
            "engine_gateway_failures_total",
            "Transient gateway failures and timeouts",
        )?;
        let windows_settled =
            counter(&registry, "engine_windows_settled_total", "Settlement windows settled")?;
        let windows_failed =
            counter(&registry, "engine_windows_failed_total", "Settlement windows failed")?;
        let stuck_swept = counter(
            &registry,
            "engine_stuck_jobs_swept_total",
            "Processing jobs force-failed by the stuck sweep",
        )?;
        let dead_lettered = counter(
            &registry,
            "engine_dead_lettered_total",
            "Jobs marked permanently failed",
        )?;
        let compensations = counter(
            &registry,
            "engine_compensations_total",
            "Disbursements compensated",
        )?;

        let gateway_duration = Histogram::with_opts(
            HistogramOpts::new(
                "engine_gateway_duration_seconds",
                "Histogram of gateway call latencies",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(gateway_duration.clone()))?;

        Ok(Self {
            jobs_created,
            admissions_refused,
            job_transitions,
            gateway_calls,
            gateway_failures,
            windows_settled,
            windows_failed,
            stuck_swept,
            dead_lettered,
            compensations,
            gateway_duration,
            registry,
        })
    }

    /// Record a gateway call
    pub fn record_gateway_call(&self, duration_seconds: f64, transient_failure: bool) {
        self.gateway_calls.inc();
        self.gateway_duration.observe(duration_seconds);
        if transient_failure {
            self.gateway_failures.inc();
        }
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
