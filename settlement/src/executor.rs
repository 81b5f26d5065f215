//! Job execution against the payment gateway
//!
//! Execution runs in three steps so no lock is held across the gateway call:
//!
//! 1. Under the business and job locks: take a circuit breaker permit,
//!    re-check funds, move the job to `processing` (a retry from `failed`
//!    reserves funds again) and commit. An open circuit leaves the job as it
//!    was.
//! 2. Unlocked: call the gateway with a timeout and bounded retry. The first
//!    attempt uses the permit from step 1; later attempts take their own.
//!    The job id is the gateway idempotency key.
//! 3. Under the locks again: on success post DEBIT ESCROW / CREDIT
//!    PAYROLL|PAYMENT with the job id as correlation, consume the
//!    reservation and debit the projection; on failure fail the job and
//!    release its reservation.

use crate::{
    circuit_breaker::CircuitBreaker,
    gateway::{GatewayClient, GatewayRequest, GatewayResponse},
    jobs::JobManager,
    metrics::EngineMetrics,
    retry::RetryPolicy,
    types::{DisbursementJob, JobStatus},
    Error, Result,
};
use chrono::Utc;
use escrow::LockScope;
use ledger_core::{
    AccountType, AuditAction, AuditEvent, AuditTrail, EntryReference, Ledger, PostingLine,
    PostingRequest,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Runs jobs through the gateway
#[derive(Debug, Clone)]
pub struct JobExecutor {
    jobs: JobManager,
    ledger: Arc<Ledger>,
    gateway: Arc<dyn GatewayClient>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
    trail: AuditTrail,
    metrics: Arc<EngineMetrics>,
}

impl JobExecutor {
    /// Executor over a job manager and a gateway
    pub fn new(
        jobs: JobManager,
        ledger: Arc<Ledger>,
        gateway: Arc<dyn GatewayClient>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let timeout = Duration::from_millis(jobs.config().gateway_timeout_ms);
        Self {
            trail: AuditTrail::new(ledger.storage().clone()),
            jobs,
            ledger,
            gateway,
            breaker,
            retry,
            timeout,
            metrics,
        }
    }

    /// Job manager the executor drives
    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    /// Circuit breaker key of the gateway
    pub fn breaker_key(&self) -> &str {
        self.gateway.name()
    }

    /// Execute a pending job, or retry a failed one.
    ///
    /// Returns the job in its final state for this run (`succeeded` or
    /// `failed`). An open circuit fails with [`Error::CircuitOpen`] and
    /// leaves the job untouched.
    pub async fn execute(&self, job_id: Uuid) -> Result<DisbursementJob> {
        let key = self.breaker_key().to_string();
        if self.breaker.is_open(&key, Utc::now()) {
            tracing::warn!(job_id = %job_id, key = %key, "Circuit open, job not dispatched");
            return Err(Error::CircuitOpen(key));
        }

        let job = match self.begin(job_id).await? {
            Begin::Dispatch(job) => job,
            Begin::Refused(job) => return Ok(job),
        };

        let outcome = self.dispatch(&job).await;
        self.finish(job_id, outcome).await
    }

    async fn begin(&self, job_id: Uuid) -> Result<Begin> {
        let business_id = self.jobs.get_job(job_id)?.business_id;
        let mut scope = self.jobs.locks().scope();
        scope.lock_business(business_id).await?;
        scope.lock_job(job_id).await?;

        let job = self.jobs.get_job(job_id)?;
        if job.is_dead_lettered() {
            return Err(Error::DeadLettered(job_id));
        }
        if !job.status.can_transition_to(JobStatus::Processing) {
            return Err(Error::InvalidTransition {
                job_id,
                from: job.status.to_string(),
                to: JobStatus::Processing.to_string(),
            });
        }

        let key = self.breaker_key();
        self.breaker.acquire(key, Utc::now()).map_err(|e| {
            tracing::warn!(job_id = %job_id, key, "Circuit open, job not dispatched");
            e
        })?;
        let begun = self.begin_locked(&scope, job);
        if !matches!(&begun, Ok(Begin::Dispatch(_))) {
            self.breaker.release(key);
        }
        begun
    }

    fn begin_locked(&self, scope: &LockScope<'_>, mut job: DisbursementJob) -> Result<Begin> {
        let job_id = job.job_id;
        let business_id = job.business_id;
        let mut txn = self.jobs.store().storage().begin();
        let verified = if job.status == JobStatus::Failed {
            // A retry runs the full admission check for fresh funds
            self.jobs.reserve_for(scope, &mut txn, &mut job).map(|_| ())
        } else {
            let account = self.jobs.accounts().require(business_id)?;
            let reservation = match job.reservation_id {
                Some(id) => Some(self.jobs.admission().get_reservation(business_id, id)?),
                None => None,
            };
            self.jobs
                .admission()
                .verify_disbursement(&account, job.amount, reservation.as_ref())
                .map_err(Error::from)
        };

        match verified {
            Ok(()) => {
                self.jobs
                    .transition_in(scope, &mut txn, &mut job, JobStatus::Processing, None)?;
                txn.commit()?;
                Ok(Begin::Dispatch(job))
            }
            Err(e) if !is_refusal(&e) => Err(e),
            Err(e) => {
                let reason = format!("funds re-check failed: {}", e);
                tracing::warn!(
                    job_id = %job_id,
                    business_id = %business_id,
                    error = %e,
                    "Disbursement refused at execution time"
                );
                self.jobs
                    .apply_transition(&mut job, JobStatus::Processing, None)?;
                self.fail_in(scope, &mut txn, &mut job, &reason)?;
                txn.commit()?;
                Ok(Begin::Refused(job))
            }
        }
    }

    async fn dispatch(&self, job: &DisbursementJob) -> Result<GatewayResponse> {
        let request = GatewayRequest {
            job_id: job.job_id,
            business_id: job.business_id,
            member_id: job.member_id,
            amount: job.amount,
            kind: job.kind,
            idempotency_key: job.job_id.to_string(),
        };
        let request = &request;
        self.retry
            .run(
                |attempt| async move { self.call_gateway(request, attempt).await },
                Error::is_transient,
            )
            .await
    }

    async fn call_gateway(&self, request: &GatewayRequest, attempt: u32) -> Result<GatewayResponse> {
        let key = self.breaker_key();
        if attempt > 1 {
            self.breaker.acquire(key, Utc::now())?;
        }

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.gateway.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::GatewayTimeout {
                job_id: request.job_id,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };
        self.metrics.record_gateway_call(
            started.elapsed().as_secs_f64(),
            matches!(&result, Err(e) if e.is_transient()),
        );

        match &result {
            Ok(_) => self.breaker.record_success(key, Utc::now()),
            Err(e) => {
                tracing::warn!(
                    job_id = %request.job_id,
                    attempt,
                    error = %e,
                    "Gateway call failed"
                );
                self.breaker.record_failure(key, Utc::now());
            }
        }
        result
    }

    async fn finish(
        &self,
        job_id: Uuid,
        outcome: Result<GatewayResponse>,
    ) -> Result<DisbursementJob> {
        let business_id = self.jobs.get_job(job_id)?.business_id;
        let mut scope = self.jobs.locks().scope();
        scope.lock_business(business_id).await?;
        scope.lock_job(job_id).await?;

        let mut job = self.jobs.get_job(job_id)?;
        if job.status != JobStatus::Processing {
            tracing::error!(
                job_id = %job_id,
                status = %job.status,
                paid = matches!(&outcome, Ok(r) if r.success),
                "Gateway outcome arrived for a job no longer processing, manual review required"
            );
            return Err(Error::InvalidTransition {
                job_id,
                from: job.status.to_string(),
                to: match &outcome {
                    Ok(r) if r.success => JobStatus::Succeeded.to_string(),
                    _ => JobStatus::Failed.to_string(),
                },
            });
        }

        let mut txn = self.jobs.store().storage().begin();
        match outcome {
            Ok(response) if response.success => {
                self.post_disbursement(&scope, &mut txn, &mut job, &response)?;
            }
            Ok(response) => {
                let reason = response
                    .error_message
                    .unwrap_or_else(|| "declined by gateway".to_string());
                self.fail_in(&scope, &mut txn, &mut job, &reason)?;
            }
            Err(e) => {
                self.fail_in(&scope, &mut txn, &mut job, &e.to_string())?;
            }
        }
        txn.commit()?;
        Ok(job)
    }

    fn post_disbursement(
        &self,
        scope: &LockScope<'_>,
        txn: &mut ledger_core::WriteTxn<'_>,
        job: &mut DisbursementJob,
        response: &GatewayResponse,
    ) -> Result<()> {
        let business_id = job.business_id;
        let reference = EntryReference::new(job.kind.reference_kind(), job.job_id);
        let transaction_id = response.transaction_id.clone().unwrap_or_default();
        let lines = vec![
            PostingLine::debit(business_id, AccountType::Escrow, job.amount, reference)
                .with_metadata("member_id", job.member_id.to_string()),
            PostingLine::credit(business_id, job.kind.account_type(), job.amount, reference)
                .with_metadata("member_id", job.member_id.to_string())
                .with_metadata("gateway_transaction_id", transaction_id.clone()),
        ];
        let posted = self
            .ledger
            .post_in(txn, PostingRequest::new(job.job_id, lines))?;

        let mut account = self.jobs.accounts().require(business_id)?;
        if let Some(reservation_id) = job.reservation_id {
            self.jobs
                .admission()
                .consume_in(scope, txn, &mut account, reservation_id)?;
        }
        account.apply_escrow_delta(posted.escrow_delta(business_id))?;
        self.jobs.accounts().stage(scope, txn, &mut account)?;

        job.gateway_transaction_id = response.transaction_id.clone();
        self.jobs
            .transition_in(scope, txn, job, JobStatus::Succeeded, None)?;

        let event = AuditEvent::new(
            AuditAction::DisbursementPosted,
            "settlement.executor",
            format!("job:{}", job.job_id),
        )
        .business(business_id)
        .detail("amount", job.amount)
        .detail("account", job.kind.account_type())
        .detail("gateway_transaction_id", &transaction_id)
        .detail("balance", account.balance);
        self.trail.record_in(txn, &event)?;

        tracing::info!(
            job_id = %job.job_id,
            business_id = %business_id,
            amount = %job.amount,
            gateway_transaction_id = %transaction_id,
            balance = %account.balance,
            "Disbursement posted"
        );
        Ok(())
    }

    fn fail_in(
        &self,
        scope: &LockScope<'_>,
        txn: &mut ledger_core::WriteTxn<'_>,
        job: &mut DisbursementJob,
        reason: &str,
    ) -> Result<()> {
        self.jobs
            .transition_in(scope, txn, job, JobStatus::Failed, Some(reason))?;
        self.jobs.release_for(scope, txn, job, reason)
    }
}

enum Begin {
    Dispatch(DisbursementJob),
    Refused(DisbursementJob),
}

fn is_refusal(error: &Error) -> bool {
    matches!(
        error,
        Error::Escrow(
            escrow::Error::InsufficientFunds { .. }
                | escrow::Error::AccountFrozen(_)
                | escrow::Error::InvalidAmount(_)
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, JobConfig, RetryConfig};
    use crate::gateway::{MockBehavior, MockGateway};
    use crate::types::{NewJob, PayPeriod};
    use chrono::NaiveDate;
    use escrow::{AdmissionController, AdmissionPolicy, LockManager, ReservationStatus};
    use ledger_core::{BusinessId, ReferenceKind, Storage};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ledger: Arc<Ledger>,
        gateway: Arc<MockGateway>,
        executor: JobExecutor,
        jobs: JobManager,
    }

    fn fixture(failure_threshold: u32) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger_config = ledger_core::Config::default();
        ledger_config.data_dir = dir.path().to_path_buf();
        let storage =
            Arc::new(Storage::open_with_families(&ledger_config, &crate::column_families()).unwrap());
        let ledger = Arc::new(Ledger::with_storage(storage.clone(), ledger_config).unwrap());
        let locks = Arc::new(LockManager::new());
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let admission =
            AdmissionController::new(storage.clone(), locks.clone(), AdmissionPolicy::SoftHold);
        let jobs = JobManager::new(storage, admission, locks, metrics.clone(), JobConfig::default());
        let gateway = Arc::new(MockGateway::new());
        let breaker = Arc::new(CircuitBreaker::new(&CircuitBreakerConfig {
            failure_threshold,
            cooldown_secs: 300,
        }));
        let retry = RetryPolicy::new(&RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: false,
        });
        let executor = JobExecutor::new(
            jobs.clone(),
            ledger.clone(),
            gateway.clone(),
            breaker,
            retry,
            metrics,
        );
        Fixture {
            _dir: dir,
            ledger,
            gateway,
            executor,
            jobs,
        }
    }

    async fn funded(f: &Fixture, amount: Decimal) -> BusinessId {
        let business = BusinessId::new();
        f.jobs
            .accounts()
            .open_account(f.jobs.locks(), business)
            .await
            .unwrap();
        let reference = EntryReference::new(ReferenceKind::Deposit, Uuid::now_v7());
        let mut scope = f.jobs.locks().scope();
        scope.lock_business(business).await.unwrap();
        let mut account = f.jobs.accounts().require(business).unwrap();
        let mut txn = f.ledger.storage().begin();
        let posted = f
            .ledger
            .post_in(
                &mut txn,
                PostingRequest::new(
                    reference.id,
                    vec![
                        PostingLine::debit(business, AccountType::Clearing, amount, reference),
                        PostingLine::credit(business, AccountType::Escrow, amount, reference),
                    ],
                ),
            )
            .unwrap();
        account.apply_escrow_delta(posted.escrow_delta(business)).unwrap();
        f.jobs.accounts().stage(&scope, &mut txn, &mut account).unwrap();
        txn.commit().unwrap();
        business
    }

    fn period() -> PayPeriod {
        PayPeriod::new(
            NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_success_posts_and_debits() {
        let f = fixture(5);
        let business = funded(&f, dec!(1000)).await;
        let job = f
            .jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(250), period()))
            .await
            .unwrap();

        let done = f.executor.execute(job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.attempts, 1);
        assert!(done.gateway_transaction_id.is_some());

        let account = f.jobs.accounts().require(business).unwrap();
        assert_eq!(account.balance, dec!(750));
        assert_eq!(account.hold_amount, Decimal::ZERO);

        let entries = f.ledger.entries_for_correlation(job.job_id).unwrap();
        assert_eq!(entries.len(), 2);
        f.ledger.verify_correlation(job.job_id).unwrap();

        let reservation = f
            .jobs
            .admission()
            .get_reservation(business, done.reservation_id.unwrap())
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Consumed);

        assert!(matches!(
            f.executor.execute(job.job_id).await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_decline_fails_and_releases() {
        let f = fixture(1);
        let business = funded(&f, dec!(1000)).await;
        f.gateway
            .script([MockBehavior::Decline("account closed".to_string())]);
        let job = f
            .jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(100), period()))
            .await
            .unwrap();

        let failed = f.executor.execute(job.job_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("account closed"));

        let account = f.jobs.accounts().require(business).unwrap();
        assert_eq!(account.balance, dec!(1000));
        assert_eq!(account.hold_amount, Decimal::ZERO);
        // A decline is an answer, not an outage
        assert!(!f.executor.breaker.is_open(f.executor.breaker_key(), Utc::now()));

        // Retry reserves again and pays
        let retried = f.executor.execute(job.job_id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Succeeded);
        assert_eq!(retried.attempts, 2);
        assert_eq!(
            f.jobs.accounts().require(business).unwrap().balance,
            dec!(900)
        );
    }

    #[tokio::test]
    async fn test_transient_failures_trip_breaker() {
        let f = fixture(2);
        let business = funded(&f, dec!(1000)).await;
        f.gateway.set_fallback(MockBehavior::Fail("503".to_string()));

        let first = f
            .jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(10), period()))
            .await
            .unwrap();
        let second = f
            .jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(10), period()))
            .await
            .unwrap();

        let failed = f.executor.execute(first.job_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(f.gateway.calls(), 2);

        assert!(matches!(
            f.executor.execute(second.job_id).await,
            Err(Error::CircuitOpen(_))
        ));
        assert_eq!(f.jobs.get_job(second.job_id).unwrap().status, JobStatus::Pending);
        assert_eq!(f.gateway.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_circuit_opening_while_waiting_leaves_job_pending() {
        let f = fixture(2);
        let business = funded(&f, dec!(1000)).await;
        let job = f
            .jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(10), period()))
            .await
            .unwrap();

        // Hold the business lock so the execution queues up in front of it
        let mut scope = f.jobs.locks().scope();
        scope.lock_business(business).await.unwrap();
        let executor = f.executor.clone();
        let running = tokio::spawn(async move { executor.execute(job.job_id).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let key = f.executor.breaker_key().to_string();
        f.executor.breaker.record_failure(&key, Utc::now());
        f.executor.breaker.record_failure(&key, Utc::now());
        drop(scope);

        assert!(matches!(running.await.unwrap(), Err(Error::CircuitOpen(_))));
        let untouched = f.jobs.get_job(job.job_id).unwrap();
        assert_eq!(untouched.status, JobStatus::Pending);
        assert_eq!(untouched.attempts, 0);
        assert!(untouched.error_message.is_none());
        assert_eq!(f.gateway.calls(), 0);
        assert_eq!(
            f.jobs.accounts().require(business).unwrap().hold_amount,
            dec!(10)
        );
    }

    #[tokio::test]
    async fn test_refused_execution_returns_breaker_permit() {
        let f = fixture(1);
        let business = funded(&f, dec!(1000)).await;
        let key = f.executor.breaker_key().to_string();
        let job = f
            .jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(10), period()))
            .await
            .unwrap();
        f.jobs
            .accounts()
            .set_frozen(f.jobs.locks(), business, true, "ops")
            .await
            .unwrap();

        // Half-open with the probe slot free
        f.executor.breaker.record_failure(&key, Utc::now() - chrono::Duration::seconds(600));
        assert!(!f.executor.breaker.is_open(&key, Utc::now()));

        let refused = f.executor.execute(job.job_id).await.unwrap();
        assert_eq!(refused.status, JobStatus::Failed);
        assert_eq!(f.gateway.calls(), 0);
        assert!(!f.executor.breaker.is_open(&key, Utc::now()));
    }

    #[tokio::test]
    async fn test_frozen_account_refused_at_execution() {
        let f = fixture(5);
        let business = funded(&f, dec!(1000)).await;
        let job = f
            .jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(100), period()))
            .await
            .unwrap();
        f.jobs
            .accounts()
            .set_frozen(f.jobs.locks(), business, true, "ops")
            .await
            .unwrap();

        let refused = f.executor.execute(job.job_id).await.unwrap();
        assert_eq!(refused.status, JobStatus::Failed);
        assert!(refused
            .error_message
            .unwrap_or_default()
            .starts_with("funds re-check failed"));
        assert_eq!(f.gateway.calls(), 0);
        assert_eq!(
            f.jobs.accounts().require(business).unwrap().hold_amount,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_gateway_timeout_fails_job() {
        let f = fixture(10);
        let business = funded(&f, dec!(1000)).await;
        let mut executor = f.executor.clone();
        executor.timeout = Duration::from_millis(20);
        f.gateway.set_fallback(MockBehavior::Hang(Duration::from_millis(500)));

        let job = f
            .jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(10), period()))
            .await
            .unwrap();
        let failed = executor.execute(job.job_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed
            .error_message
            .unwrap_or_default()
            .contains("Gateway timeout"));
    }
}
