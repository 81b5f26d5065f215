//! Bounded retry with exponential backoff and jitter

use crate::{config::RetryConfig, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry policy for transient gateway failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    /// Policy from configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Attempts per run
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before attempt `attempt + 1` (1-based `attempt`)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
            delay + Duration::from_millis(extra)
        } else {
            delay
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. `op` receives the 1-based attempt number.
    pub async fn run<F, Fut, T>(&self, mut op: F, retryable: impl Fn(&crate::Error) -> bool) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay(attempt);
                    tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
