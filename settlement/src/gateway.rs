//! Payment gateway seam
//!
//! The engine only talks to a payment rail through [`GatewayClient`]. The
//! job id is passed as the gateway idempotency key, so a retry after a
//! timeout cannot pay twice.

use crate::{types::DisbursementKind, Error, Result};
use async_trait::async_trait;
use ledger_core::BusinessId;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// One payout instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Job being paid
    pub job_id: Uuid,
    /// Paying business
    pub business_id: BusinessId,
    /// Recipient / employee
    pub member_id: Uuid,
    /// Amount
    pub amount: Decimal,
    /// Payment or payroll
    pub kind: DisbursementKind,
    /// Key the rail deduplicates on
    pub idempotency_key: String,
}

/// Authoritative answer from the rail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Paid
    pub success: bool,
    /// Rail transaction reference
    pub transaction_id: Option<String>,
    /// Decline reason
    pub error_message: Option<String>,
}

impl GatewayResponse {
    /// Successful payout
    pub fn paid(transaction_id: impl Into<String>) -> Self {
        Self {
            success: true,
            transaction_id: Some(transaction_id.into()),
            error_message: None,
        }
    }

    /// Authoritative decline
    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_id: None,
            error_message: Some(reason.into()),
        }
    }
}

/// Payment rail client.
///
/// `Ok` is an authoritative outcome (paid or declined). `Err` is a transient
/// failure that may be retried.
#[async_trait]
pub trait GatewayClient: Send + Sync + std::fmt::Debug {
    /// Execute a payout
    async fn execute(&self, request: &GatewayRequest) -> Result<GatewayResponse>;

    /// Name used as the circuit breaker key
    fn name(&self) -> &str {
        "gateway"
    }
}

/// Scripted behaviour of the next mock call
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Pay
    Succeed,
    /// Authoritative decline
    Decline(String),
    /// Transient failure
    Fail(String),
    /// Sleep before paying
    Hang(Duration),
}

/// In-memory gateway for tests and local runs
#[derive(Debug, Default)]
pub struct MockGateway {
    script: Mutex<VecDeque<MockBehavior>>,
    fallback: Mutex<Option<MockBehavior>>,
    paid: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl MockGateway {
    /// Gateway that pays every request
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue behaviours for the next calls
    pub fn script(&self, behaviors: impl IntoIterator<Item = MockBehavior>) {
        self.script.lock().extend(behaviors);
    }

    /// Behaviour once the script is exhausted (default: succeed)
    pub fn set_fallback(&self, behavior: MockBehavior) {
        *self.fallback.lock() = Some(behavior);
    }

    /// Calls received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Distinct payouts made
    pub fn payouts(&self) -> usize {
        self.paid.lock().len()
    }

    fn pay(&self, request: &GatewayRequest) -> GatewayResponse {
        let mut paid = self.paid.lock();
        let transaction_id = paid
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| format!("mock-{}", Uuid::now_v7().simple()))
            .clone();
        GatewayResponse::paid(transaction_id)
    }
}

#[async_trait]
impl GatewayClient for MockGateway {
    async fn execute(&self, request: &GatewayRequest) -> Result<GatewayResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .pop_front()
            .or_else(|| self.fallback.lock().clone())
            .unwrap_or(MockBehavior::Succeed);

        match behavior {
            MockBehavior::Succeed => Ok(self.pay(request)),
            MockBehavior::Decline(reason) => Ok(GatewayResponse::declined(reason)),
            MockBehavior::Fail(reason) => Err(Error::GatewayUnavailable(reason)),
            MockBehavior::Hang(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.pay(request))
            }
        }
    }

    fn name(&self) -> &str {
        "mock-gateway"
    }
}
