//! Circuit breaker guarding gateway calls
//!
//! Per operation key: `closed` → N consecutive failures → `open` (fail
//! fast) → cool-down elapsed → `half_open` (one probe) → success closes,
//! failure re-opens.

use crate::{config::CircuitBreakerConfig, Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// One probe allowed
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// State of one operation key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Operation key
    pub key: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Successes since last failure
    pub success_count: u32,
    /// Last time the circuit opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Last failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Last success
    pub last_success_at: Option<DateTime<Utc>>,
    /// A half-open probe is in flight
    pub probe_in_flight: bool,
}

impl CircuitBreakerState {
    fn closed(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_failure_at: None,
            last_success_at: None,
            probe_in_flight: false,
        }
    }
}

/// Table of breakers keyed by operation
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    states: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreaker {
    /// Breaker table with the given thresholds
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::seconds(i64::try_from(config.cooldown_secs).unwrap_or(i64::MAX / 1_000)),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn cooled_down(&self, state: &CircuitBreakerState, now: DateTime<Utc>) -> bool {
        match state.opened_at {
            Some(opened) => now - opened >= self.cooldown,
            None => true,
        }
    }

    /// Whether a call would be short-circuited right now, without taking a probe slot
    pub fn is_open(&self, key: &str, now: DateTime<Utc>) -> bool {
        let states = self.states.lock();
        match states.get(key) {
            Some(s) if s.state == CircuitState::Open => !self.cooled_down(s, now),
            Some(s) if s.state == CircuitState::HalfOpen => s.probe_in_flight,
            _ => false,
        }
    }

    /// Permission for one call. Fails with [`Error::CircuitOpen`] while open
    /// or while the half-open probe is out.
    pub fn acquire(&self, key: &str, now: DateTime<Utc>) -> Result<()> {
        let mut states = self.states.lock();
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreakerState::closed(key));

        match state.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if self.cooled_down(state, now) {
                    tracing::info!(key, "Circuit breaker transitioning to half-open");
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    state.probe_in_flight = true;
                    Ok(())
                } else {
                    tracing::warn!(key, "Circuit breaker is open, rejecting call");
                    Err(Error::CircuitOpen(key.to_string()))
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(Error::CircuitOpen(key.to_string()))
                } else {
                    state.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self, key: &str, now: DateTime<Utc>) {
        let mut states = self.states.lock();
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreakerState::closed(key));

        state.last_success_at = Some(now);
        state.success_count += 1;
        state.probe_in_flight = false;
        if state.state == CircuitState::HalfOpen {
            tracing::info!(key, "Circuit breaker recovered, closing");
        }
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.opened_at = None;
    }

    /// Hand back a permit from [`acquire`](Self::acquire) when no call was made
    pub fn release(&self, key: &str) {
        if let Some(state) = self.states.lock().get_mut(key) {
            state.probe_in_flight = false;
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, key: &str, now: DateTime<Utc>) {
        let mut states = self.states.lock();
        let state = states
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreakerState::closed(key));

        state.last_failure_at = Some(now);
        state.success_count = 0;
        state.probe_in_flight = false;
        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.failure_threshold {
                    tracing::warn!(
                        key,
                        failures = state.failure_count,
                        "Circuit breaker tripped, opening"
                    );
                    state.state = CircuitState::Open;
                    state.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(key, "Circuit breaker probe failed, re-opening");
                state.state = CircuitState::Open;
                state.opened_at = Some(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` under the breaker
    pub async fn call<F, Fut, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.acquire(key, Utc::now())?;
        match f().await {
            Ok(value) => {
                self.record_success(key, Utc::now());
                Ok(value)
            }
            Err(e) => {
                self.record_failure(key, Utc::now());
                Err(e)
            }
        }
    }

    /// Current state of a key
    pub fn state(&self, key: &str) -> CircuitBreakerState {
        self.states
            .lock()
            .get(key)
            .cloned()
            .unwrap_or_else(|| CircuitBreakerState::closed(key))
    }

    /// Force a key back to closed
    pub fn reset(&self, key: &str) {
        tracing::info!(key, "Circuit breaker manually reset");
        self.states
            .lock()
            .insert(key.to_string(), CircuitBreakerState::closed(key));
    }
}
