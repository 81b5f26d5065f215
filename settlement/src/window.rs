//! Settlement window batching
//!
//! Pending jobs are grouped into windows by the time bucket of their creation.
//! Once a bucket has closed, exactly one worker claims its window and runs
//! the member jobs in creation order.
//!
//! ```text
//! pending ──claim──▶ processing ──all jobs terminal──▶ settled
//!                        │
//!                        └──circuit open──▶ failed (unfinished jobs detached)
//! ```

use crate::{
    executor::JobExecutor,
    metrics::EngineMetrics,
    store::JobStore,
    types::{DisbursementJob, JobStatus, SettlementWindow, WindowStatus, WindowType},
    Error, Result,
};
use chrono::{DateTime, Utc};
use ledger_core::{AuditAction, AuditEvent, AuditTrail};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Outcome of one batching cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Jobs placed into windows
    pub assigned: usize,
    /// Windows claimed by this worker
    pub claimed: usize,
    /// Windows settled
    pub settled: usize,
    /// Windows failed
    pub failed: usize,
}

/// Groups jobs into windows and drives them to settlement
#[derive(Debug, Clone)]
pub struct SettlementBatcher {
    executor: JobExecutor,
    store: JobStore,
    trail: AuditTrail,
    metrics: Arc<EngineMetrics>,
    window_type: WindowType,
    assign_lock: Arc<tokio::sync::Mutex<()>>,
    claim_lock: Arc<Mutex<()>>,
}

impl SettlementBatcher {
    /// Batcher running jobs through `executor`
    pub fn new(executor: JobExecutor, window_type: WindowType, metrics: Arc<EngineMetrics>) -> Self {
        let store = executor.jobs().store().clone();
        Self {
            trail: AuditTrail::new(store.storage().clone()),
            store,
            executor,
            metrics,
            window_type,
            assign_lock: Arc::new(tokio::sync::Mutex::new(())),
            claim_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Bucket size of new windows
    pub fn window_type(&self) -> WindowType {
        self.window_type
    }

    /// Place every unbatched pending job into the pending window of its
    /// creation bucket, opening windows as needed
    pub async fn assign_pending(&self) -> Result<usize> {
        let _assigning = self.assign_lock.lock().await;
        let locks = self.executor.jobs().locks();

        let mut assigned = 0;
        for candidate in self.store.by_status(JobStatus::Pending)? {
            if candidate.settlement_window_id.is_some() {
                continue;
            }
            let (start, end) = self.window_type.bucket(candidate.created_at)?;

            let mut scope = locks.scope();
            scope.lock_business(candidate.business_id).await?;
            scope.lock_job(candidate.job_id).await?;

            let mut job = self.store.get(candidate.job_id)?;
            if job.status != JobStatus::Pending || job.settlement_window_id.is_some() {
                continue;
            }

            let window_id = {
                let _claim = self.claim_lock.lock();
                let mut window = self.pending_window(start, end)?;
                let now = Utc::now();
                window.job_ids.push(job.job_id);
                window.transaction_count += 1;
                window.total_amount += job.amount;
                window.updated_at = now;
                job.settlement_window_id = Some(window.window_id);

                let mut txn = self.store.storage().begin();
                self.store.stage_update(&mut txn, &mut job)?;
                self.store.stage_window(&mut txn, &window)?;
                txn.commit()?;
                window.window_id
            };

            tracing::debug!(
                job_id = %job.job_id,
                window_id = %window_id,
                window_start = %start,
                "Job assigned to settlement window"
            );
            assigned += 1;
        }
        Ok(assigned)
    }

    /// Move a window from `pending` to `processing` for `worker`.
    ///
    /// Exactly one concurrent caller gets `true`.
    pub fn claim(&self, window_id: Uuid, worker: &str) -> Result<bool> {
        let _claim = self.claim_lock.lock();
        let mut window = self.store.get_window(window_id)?;
        if window.status != WindowStatus::Pending {
            return Ok(false);
        }
        window.status = WindowStatus::Processing;
        window.claimed_by = Some(worker.to_string());
        window.updated_at = Utc::now();

        let mut txn = self.store.storage().begin();
        self.store.stage_window(&mut txn, &window)?;
        txn.commit()?;

        tracing::info!(
            window_id = %window_id,
            worker,
            transaction_count = window.transaction_count,
            total_amount = %window.total_amount,
            "Settlement window claimed"
        );
        Ok(true)
    }

    /// Run the pending jobs of a claimed window in creation order, then try
    /// to settle it. An open circuit fails the window and detaches the jobs
    /// it did not reach.
    pub async fn process(&self, window_id: Uuid) -> Result<SettlementWindow> {
        let window = self.store.get_window(window_id)?;
        if window.status != WindowStatus::Processing {
            return Err(Error::InvalidWindowState {
                window_id,
                status: window.status.to_string(),
            });
        }

        let mut pending: Vec<DisbursementJob> = self
            .members(&window)?
            .into_iter()
            .filter(|job| job.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|job| (job.created_at, job.job_id));

        for job in pending {
            match self.executor.execute(job.job_id).await {
                Ok(done) => {
                    tracing::debug!(
                        window_id = %window_id,
                        job_id = %done.job_id,
                        status = %done.status,
                        "Window job executed"
                    );
                }
                Err(Error::CircuitOpen(key)) => {
                    return self
                        .fail_window(window_id, &format!("circuit open for {}", key))
                        .await;
                }
                Err(e) => {
                    tracing::warn!(
                        window_id = %window_id,
                        job_id = %job.job_id,
                        error = %e,
                        "Window job not executed"
                    );
                }
            }
        }

        self.try_settle(window_id)
    }

    /// Settle a processing window whose member jobs are all terminal
    pub fn try_settle(&self, window_id: Uuid) -> Result<SettlementWindow> {
        let _claim = self.claim_lock.lock();
        let mut window = self.store.get_window(window_id)?;
        if window.status != WindowStatus::Processing {
            return Ok(window);
        }
        let members = self.members(&window)?;
        if !members.iter().all(|job| job.status.is_terminal()) {
            return Ok(window);
        }

        let now = Utc::now();
        let succeeded = members
            .iter()
            .filter(|job| job.status == JobStatus::Succeeded)
            .count();
        window.status = WindowStatus::Settled;
        window.settled_at = Some(now);
        window.updated_at = now;

        let mut txn = self.store.storage().begin();
        self.store.stage_window(&mut txn, &window)?;
        let event = AuditEvent::new(
            AuditAction::WindowClosed,
            "settlement.window",
            format!("window:{}", window_id),
        )
        .detail("status", window.status)
        .detail("transaction_count", window.transaction_count)
        .detail("succeeded", succeeded)
        .detail("total_amount", window.total_amount);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        self.metrics.windows_settled.inc();
        tracing::info!(
            window_id = %window_id,
            transaction_count = window.transaction_count,
            succeeded,
            total_amount = %window.total_amount,
            "Settlement window settled"
        );
        Ok(window)
    }

    /// Assign pending jobs, claim every closed pending window and resume
    /// the windows this worker already holds
    pub async fn run_cycle(&self, worker: &str, now: DateTime<Utc>) -> Result<CycleReport> {
        let mut report = CycleReport {
            assigned: self.assign_pending().await?,
            ..CycleReport::default()
        };

        for window in self.store.windows()? {
            let ours = match window.status {
                WindowStatus::Pending if window.window_end <= now => {
                    let claimed = self.claim(window.window_id, worker)?;
                    if claimed {
                        report.claimed += 1;
                    }
                    claimed
                }
                WindowStatus::Processing => window.claimed_by.as_deref() == Some(worker),
                _ => false,
            };
            if !ours {
                continue;
            }

            match self.process(window.window_id).await?.status {
                WindowStatus::Settled => report.settled += 1,
                WindowStatus::Failed => report.failed += 1,
                _ => {}
            }
        }
        Ok(report)
    }

    async fn fail_window(&self, window_id: Uuid, reason: &str) -> Result<SettlementWindow> {
        let window = self.store.get_window(window_id)?;
        let locks = self.executor.jobs().locks();

        let mut detached = Vec::new();
        for job_id in &window.job_ids {
            let business_id = self.store.get(*job_id)?.business_id;
            let mut scope = locks.scope();
            scope.lock_business(business_id).await?;
            scope.lock_job(*job_id).await?;

            let mut job = self.store.get(*job_id)?;
            if job.status != JobStatus::Pending || job.settlement_window_id != Some(window_id) {
                continue;
            }
            job.settlement_window_id = None;
            let mut txn = self.store.storage().begin();
            self.store.stage_update(&mut txn, &mut job)?;
            txn.commit()?;
            detached.push(*job_id);
        }

        let _claim = self.claim_lock.lock();
        let mut window = self.store.get_window(window_id)?;
        window.job_ids.retain(|id| !detached.contains(id));
        let members = self.members(&window)?;
        window.transaction_count = members.len() as u64;
        window.total_amount = members.iter().map(|job| job.amount).sum::<Decimal>();
        window.status = WindowStatus::Failed;
        window.failure_reason = Some(reason.to_string());
        window.updated_at = Utc::now();

        let mut txn = self.store.storage().begin();
        self.store.stage_window(&mut txn, &window)?;
        let event = AuditEvent::new(
            AuditAction::WindowClosed,
            "settlement.window",
            format!("window:{}", window_id),
        )
        .detail("status", window.status)
        .detail("detached", detached.len())
        .detail("reason", reason);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        self.metrics.windows_failed.inc();
        tracing::warn!(
            window_id = %window_id,
            detached = detached.len(),
            reason,
            "Settlement window failed"
        );
        Ok(window)
    }

    /// Pending window for a bucket, or a fresh one
    fn pending_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<SettlementWindow> {
        let existing = self.store.windows()?.into_iter().find(|w| {
            w.status == WindowStatus::Pending
                && w.window_type == self.window_type
                && w.window_start == start
        });
        if let Some(window) = existing {
            return Ok(window);
        }

        let now = Utc::now();
        let window = SettlementWindow {
            window_id: Uuid::now_v7(),
            window_type: self.window_type,
            window_start: start,
            window_end: end,
            status: WindowStatus::Pending,
            job_ids: Vec::new(),
            transaction_count: 0,
            total_amount: Decimal::ZERO,
            claimed_by: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            settled_at: None,
        };
        tracing::info!(
            window_id = %window.window_id,
            window_type = %self.window_type,
            window_start = %start,
            window_end = %end,
            "Settlement window opened"
        );
        Ok(window)
    }

    /// Jobs still attached to the window
    fn members(&self, window: &SettlementWindow) -> Result<Vec<DisbursementJob>> {
        let mut members = Vec::with_capacity(window.job_ids.len());
        for job_id in &window.job_ids {
            let job = self.store.get(*job_id)?;
            if job.settlement_window_id == Some(window.window_id) {
                members.push(job);
            }
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::config::{CircuitBreakerConfig, JobConfig};
    use crate::gateway::{MockBehavior, MockGateway};
    use crate::jobs::JobManager;
    use crate::retry::RetryPolicy;
    use crate::types::{NewJob, PayPeriod};
    use chrono::{Duration, NaiveDate};
    use escrow::{AdmissionController, AdmissionPolicy, LockManager};
    use ledger_core::{
        AccountType, BusinessId, EntryReference, Ledger, PostingLine, PostingRequest,
        ReferenceKind, Storage,
    };
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ledger: Arc<Ledger>,
        gateway: Arc<MockGateway>,
        jobs: JobManager,
        batcher: SettlementBatcher,
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
        let executor = JobExecutor::new(
            jobs.clone(),
            ledger.clone(),
            gateway.clone(),
            breaker,
            RetryPolicy::none(),
            metrics.clone(),
        );
        let batcher = SettlementBatcher::new(executor, WindowType::Hourly, metrics);
        Fixture {
            _dir: dir,
            ledger,
            gateway,
            jobs,
            batcher,
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
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 7, 31).unwrap(),
        )
        .unwrap()
    }

    async fn job(f: &Fixture, business: BusinessId, amount: Decimal) -> DisbursementJob {
        f.jobs
            .create_job(NewJob::payment(business, Uuid::now_v7(), amount, period()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_assign_claim_and_settle() {
        let f = fixture(5);
        let business = funded(&f, dec!(1000)).await;
        let first = job(&f, business, dec!(100)).await;
        let second = job(&f, business, dec!(150)).await;

        assert_eq!(f.batcher.assign_pending().await.unwrap(), 2);
        assert_eq!(f.batcher.assign_pending().await.unwrap(), 0);

        let window_id = f.jobs.get_job(first.job_id).unwrap().settlement_window_id.unwrap();
        let window = f.batcher.store.get_window(window_id).unwrap();
        assert_eq!(window.status, WindowStatus::Pending);
        assert!(window.job_ids.contains(&second.job_id));
        assert_eq!(window.transaction_count, 2);
        assert_eq!(window.total_amount, dec!(250));

        // Unclaimed windows cannot be processed
        assert!(matches!(
            f.batcher.process(window_id).await,
            Err(Error::InvalidWindowState { .. })
        ));

        assert!(f.batcher.claim(window_id, "worker-a").unwrap());
        assert!(!f.batcher.claim(window_id, "worker-b").unwrap());

        let settled = f.batcher.process(window_id).await.unwrap();
        assert_eq!(settled.status, WindowStatus::Settled);
        assert!(settled.settled_at.is_some());
        assert_eq!(
            f.jobs.get_job(second.job_id).unwrap().status,
            JobStatus::Succeeded
        );
        assert_eq!(
            f.jobs.accounts().require(business).unwrap().balance,
            dec!(750)
        );
    }

    #[tokio::test]
    async fn test_concurrent_claim_has_one_winner() {
        let f = fixture(5);
        let business = funded(&f, dec!(1000)).await;
        let job = job(&f, business, dec!(10)).await;
        f.batcher.assign_pending().await.unwrap();
        let window_id = f.jobs.get_job(job.job_id).unwrap().settlement_window_id.unwrap();

        let batcher = &f.batcher;
        let wins: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| s.spawn(move || batcher.claim(window_id, &format!("worker-{}", i)).unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_window_and_detaches() {
        let f = fixture(1);
        let business = funded(&f, dec!(1000)).await;
        f.gateway.set_fallback(MockBehavior::Fail("503".to_string()));
        let first = job(&f, business, dec!(100)).await;
        let second = job(&f, business, dec!(200)).await;

        f.batcher.assign_pending().await.unwrap();
        let window_id = f.jobs.get_job(first.job_id).unwrap().settlement_window_id.unwrap();
        assert!(f.batcher.claim(window_id, "worker-a").unwrap());

        let failed = f.batcher.process(window_id).await.unwrap();
        assert_eq!(failed.status, WindowStatus::Failed);
        assert!(failed.failure_reason.unwrap().starts_with("circuit open"));
        assert_eq!(failed.job_ids, vec![first.job_id]);
        assert_eq!(failed.transaction_count, 1);
        assert_eq!(failed.total_amount, dec!(100));

        let detached = f.jobs.get_job(second.job_id).unwrap();
        assert_eq!(detached.status, JobStatus::Pending);
        assert_eq!(detached.settlement_window_id, None);
        assert_eq!(f.jobs.get_job(first.job_id).unwrap().status, JobStatus::Failed);

        // The detached job lands in a fresh window
        assert_eq!(f.batcher.assign_pending().await.unwrap(), 1);
        let reassigned = f.jobs.get_job(second.job_id).unwrap();
        assert_ne!(reassigned.settlement_window_id, Some(window_id));
    }

    #[tokio::test]
    async fn test_run_cycle_waits_for_bucket_end() {
        let f = fixture(5);
        let business = funded(&f, dec!(1000)).await;
        let job = job(&f, business, dec!(40)).await;

        let early = f
            .batcher
            .run_cycle("worker-a", job.created_at - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(
            early,
            CycleReport {
                assigned: 1,
                ..CycleReport::default()
            }
        );

        let later = f
            .batcher
            .run_cycle("worker-a", job.created_at + Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(later.claimed, 1);
        assert_eq!(later.settled, 1);
        assert_eq!(f.jobs.get_job(job.job_id).unwrap().status, JobStatus::Succeeded);
    }
}
