//! Configuration for the escrow engine

use crate::types::WindowType;
use serde::{Deserialize, Serialize};

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Ledger storage and signing
    pub ledger: ledger_core::Config,

    /// Admission and reconciliation
    pub escrow: escrow::Config,

    /// Job lifecycle
    pub jobs: JobConfig,

    /// Gateway retry
    pub retry: RetryConfig,

    /// Gateway circuit breaker
    pub circuit_breaker: CircuitBreakerConfig,

    /// Settlement windows
    pub window: WindowConfig,

    /// Background workers
    pub workers: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "escrow-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            ledger: ledger_core::Config::default(),
            escrow: escrow::Config::default(),
            jobs: JobConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            window: WindowConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

/// Job lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Processing jobs untouched this long are force-failed (default: 2 hours)
    pub stuck_timeout_secs: u64,

    /// Failed jobs older than this are dead-lettered (default: 24 hours)
    pub dead_letter_grace_secs: u64,

    /// Executions before automatic retry stops
    pub max_attempts: u32,

    /// Idempotency key lifetime (default: 24 hours)
    pub idempotency_ttl_secs: u64,

    /// Per-call gateway timeout
    pub gateway_timeout_ms: u64,

    /// Require net == gross − deductions + adjustments exactly
    pub strict_net_salary: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            stuck_timeout_secs: 7200,
            dead_letter_grace_secs: 86400,
            max_attempts: 3,
            idempotency_ttl_secs: 86400,
            gateway_timeout_ms: 30_000,
            strict_net_salary: false,
        }
    }
}

/// Gateway retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Gateway calls per execution
    pub max_attempts: u32,

    /// First backoff
    pub base_delay_ms: u64,

    /// Backoff ceiling
    pub max_delay_ms: u64,

    /// Add up to 50% random jitter
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Seconds before an open circuit admits a probe
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

/// Settlement window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Bucket size
    pub window_type: WindowType,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            window_type: WindowType::Hourly,
        }
    }
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Name used when claiming windows
    pub worker_id: String,

    /// Settlement cycle period
    pub settlement_interval_secs: u64,

    /// Stuck, dead-letter, retry and reservation sweep period
    pub sweep_interval_secs: u64,

    /// Reconciliation and daily snapshot period
    pub reconciliation_interval_secs: u64,

    /// Idempotency purge and lock table prune period
    pub purge_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            settlement_interval_secs: 60,
            sweep_interval_secs: 300,
            reconciliation_interval_secs: 3600,
            purge_interval_secs: 3600,
        }
    }
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

    /// Apply `LEDGER_*`, `ESCROW_*` and `SETTLEMENT_*` overrides
    pub fn apply_env(&mut self) -> crate::Result<()> {
        self.ledger.apply_env()?;
        self.escrow.apply_env()?;

        if let Ok(worker) = std::env::var("SETTLEMENT_WORKER_ID") {
            self.workers.worker_id = worker;
        }

        if let Ok(secs) = std::env::var("SETTLEMENT_STUCK_TIMEOUT_SECS") {
            self.jobs.stuck_timeout_secs = parse_env("SETTLEMENT_STUCK_TIMEOUT_SECS", &secs)?;
        }

        if let Ok(secs) = std::env::var("SETTLEMENT_DEAD_LETTER_GRACE_SECS") {
            self.jobs.dead_letter_grace_secs =
                parse_env("SETTLEMENT_DEAD_LETTER_GRACE_SECS", &secs)?;
        }

        if let Ok(ms) = std::env::var("SETTLEMENT_GATEWAY_TIMEOUT_MS") {
            self.jobs.gateway_timeout_ms = parse_env("SETTLEMENT_GATEWAY_TIMEOUT_MS", &ms)?;
        }

        if let Ok(strict) = std::env::var("SETTLEMENT_STRICT_NET_SALARY") {
            self.jobs.strict_net_salary = parse_env("SETTLEMENT_STRICT_NET_SALARY", &strict)?;
        }

        if let Ok(window) = std::env::var("SETTLEMENT_WINDOW") {
            self.window.window_type = match window.as_str() {
                "hourly" => WindowType::Hourly,
                "daily" => WindowType::Daily,
                other => WindowType::Custom {
                    seconds: parse_env("SETTLEMENT_WINDOW", other)?,
                },
            };
        }

        Ok(())
    }
}

fn parse_env<T>(name: &str, value: &str) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.jobs.stuck_timeout_secs, 7200);
        assert_eq!(config.jobs.dead_letter_grace_secs, 86400);
        assert!(!config.jobs.strict_net_salary);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.window.window_type, WindowType::Hourly);
        assert_eq!(config.escrow.admission.policy, escrow::AdmissionPolicy::SoftHold);
    }

    #[test]
    fn test_nested_toml() {
        let config: Config = toml::from_str(
            r#"
            service_name = "engine-test"

            [ledger]
            data_dir = "/tmp/escrow-test"

            [escrow.admission]
            policy = "check_only"

            [jobs]
            stuck_timeout_secs = 60
            strict_net_salary = true

            [window]
            window_type = { custom = { seconds = 900 } }
            "#,
        )
        .unwrap();

        assert_eq!(config.service_name, "engine-test");
        assert_eq!(
            config.ledger.data_dir,
            std::path::PathBuf::from("/tmp/escrow-test")
        );
        assert_eq!(config.escrow.admission.policy, escrow::AdmissionPolicy::CheckOnly);
        assert_eq!(config.jobs.stuck_timeout_secs, 60);
        assert_eq!(config.jobs.dead_letter_grace_secs, 86400);
        assert!(config.jobs.strict_net_salary);
        assert_eq!(config.window.window_type, WindowType::Custom { seconds: 900 });
        assert_eq!(config.retry.max_attempts, 3);
    }
}
