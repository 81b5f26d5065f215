//! Configuration for escrow admission and reconciliation

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a successful admission does to the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Raise `hold_amount` by the reserved amount
    SoftHold,
    /// Record the reservation without a hold; pending reservations are
    /// summed against `available` on every admission
    CheckOnly,
}

/// Escrow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admission settings
    pub admission: AdmissionConfig,

    /// Reconciliation settings
    pub reconciliation: ReconciliationConfig,
}

/// Admission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Reservation policy
    pub policy: AdmissionPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            policy: AdmissionPolicy::SoftHold,
        }
    }
}

/// Reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Largest |stored − ledger| difference treated as rounding
    pub tolerance: Decimal,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            tolerance: Decimal::new(5, 3), // 0.005
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `ESCROW_*` environment overrides
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(policy) = std::env::var("ESCROW_ADMISSION_POLICY") {
            self.admission.policy = match policy.as_str() {
                "soft_hold" => AdmissionPolicy::SoftHold,
                "check_only" => AdmissionPolicy::CheckOnly,
                other => {
                    return Err(crate::Error::Config(format!(
                        "Unknown admission policy: {}",
                        other
                    )))
                }
            };
        }

        if let Ok(tolerance) = std::env::var("ESCROW_RECONCILIATION_TOLERANCE") {
            self.reconciliation.tolerance = tolerance.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid ESCROW_RECONCILIATION_TOLERANCE: {}", e))
            })?;
        }

        Ok(())
    }
}
