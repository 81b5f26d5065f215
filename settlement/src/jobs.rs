//! Disbursement job lifecycle
//!
//! Job creation is the admission point for a single disbursement: the
//! business lock is held while the idempotency key, the member's active
//! periods and the escrow funds are checked, and the job, its reservation
//! and its idempotency record commit together.
//!
//! Every status change goes through [`JobManager::transition_in`], which
//! validates it against [`JobStatus::can_transition_to`].

use crate::{
    config::JobConfig,
    idempotency::IdempotencyStore,
    metrics::EngineMetrics,
    store::JobStore,
    types::{DisbursementJob, DisbursementKind, JobStatus, NewJob},
    Error, Result,
};
use chrono::{DateTime, Duration, Utc};
use escrow::{AccountStore, AdmissionController, LockManager, LockScope, Reservation};
use ledger_core::{
    AuditAction, AuditEvent, AuditTrail, BusinessId, EntryReference, ReferenceKind, Storage,
    WriteTxn,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

const ACTOR: &str = "settlement.jobs";

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000))
}

/// Creates jobs and drives their status changes
#[derive(Debug, Clone)]
pub struct JobManager {
    store: JobStore,
    accounts: AccountStore,
    admission: AdmissionController,
    idempotency: IdempotencyStore,
    locks: Arc<LockManager>,
    trail: AuditTrail,
    metrics: Arc<EngineMetrics>,
    config: JobConfig,
}

impl JobManager {
    /// Manager over shared storage, admission and locks
    pub fn new(
        storage: Arc<Storage>,
        admission: AdmissionController,
        locks: Arc<LockManager>,
        metrics: Arc<EngineMetrics>,
        config: JobConfig,
    ) -> Self {
        Self {
            store: JobStore::new(storage.clone()),
            accounts: AccountStore::new(storage.clone()),
            idempotency: IdempotencyStore::new(storage.clone(), config.idempotency_ttl_secs),
            trail: AuditTrail::new(storage),
            admission,
            locks,
            metrics,
            config,
        }
    }

    /// Job records
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Escrow projections
    pub fn accounts(&self) -> &AccountStore {
        &self.accounts
    }

    /// Admission controller
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Idempotency records
    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    /// Lock table
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Job configuration
    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Load a job
    pub fn get_job(&self, job_id: Uuid) -> Result<DisbursementJob> {
        self.store.get(job_id)
    }

    /// Every job of a business, oldest first
    pub fn jobs_for_business(&self, business_id: BusinessId) -> Result<Vec<DisbursementJob>> {
        let mut jobs = self.store.for_business(business_id)?;
        jobs.sort_by_key(|j| (j.created_at, j.job_id));
        Ok(jobs)
    }

    // Creation

    fn validate(&self, request: &NewJob) -> Result<()> {
        if request.amount <= Decimal::ZERO {
            return Err(Error::InvalidJob(format!(
                "amount {} is not positive",
                request.amount
            )));
        }
        if let Some(key) = &request.idempotency_key {
            if key.trim().is_empty() {
                return Err(Error::InvalidJob("empty idempotency key".to_string()));
            }
        }
        if request.kind == DisbursementKind::Payroll {
            let calculation = request.calculation.as_ref().ok_or_else(|| {
                Error::InvalidJob("payroll job without calculation snapshot".to_string())
            })?;
            calculation.validate(self.config.strict_net_salary)?;
            if calculation.net != request.amount {
                return Err(Error::InvalidJob(format!(
                    "amount {} differs from net salary {}",
                    request.amount, calculation.net
                )));
            }
        }
        Ok(())
    }

    /// Reject a request whose member already has an active job for the same
    /// or an overlapping period. Failed and cancelled jobs do not count.
    fn check_member_periods(&self, request: &NewJob) -> Result<()> {
        for existing in self.store.for_member(request.business_id, request.member_id)? {
            if !existing.status.is_active() {
                continue;
            }
            if existing.period == request.period {
                return Err(Error::DuplicateActiveJob {
                    member_id: request.member_id,
                    existing_job: existing.job_id,
                });
            }
            if existing.period.overlaps(&request.period) {
                return Err(Error::PeriodOverlap {
                    member_id: request.member_id,
                    existing_job: existing.job_id,
                });
            }
        }
        Ok(())
    }

    /// Create a job in `pending` with its funds reserved.
    ///
    /// Replaying a live idempotency key with the same payload returns the
    /// original job; a different payload fails with
    /// [`Error::IdempotencyConflict`].
    pub async fn create_job(&self, request: NewJob) -> Result<DisbursementJob> {
        self.validate(&request)?;
        let payload_hash = request.payload_hash()?;
        let calculation_hash = request
            .calculation
            .as_ref()
            .map(|c| c.hash())
            .transpose()?;
        let business_id = request.business_id;
        let job_id = Uuid::now_v7();

        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;
        if let Some(schedule_id) = request.schedule_id {
            scope.lock_schedule(schedule_id).await?;
        }
        scope.lock_job(job_id).await?;

        let now = Utc::now();
        if let Some(key) = &request.idempotency_key {
            if let Some(existing) = self.idempotency.lookup(business_id, key, &payload_hash, now)? {
                tracing::info!(
                    business_id = %business_id,
                    job_id = %existing,
                    key = %key,
                    "Idempotent replay of job creation"
                );
                return self.store.get(existing);
            }
        }

        self.check_member_periods(&request)?;

        let mut account = self.accounts.require(business_id)?;
        let mut txn = self.store.storage().begin();
        let reference = EntryReference::new(request.kind.reference_kind(), job_id);
        let reservation = self
            .admission
            .reserve_in(&scope, &mut txn, &mut account, request.amount, reference)
            .map_err(Error::from)
            .map_err(|e| {
                if e.is_insufficient_funds() {
                    self.metrics.admissions_refused.inc();
                }
                e
            })?;

        let mut job = DisbursementJob::from_request(job_id, &request, calculation_hash);
        job.reservation_id = Some(reservation.reservation_id);
        self.store.stage_new(&mut txn, &mut job)?;

        if let Some(key) = &request.idempotency_key {
            self.idempotency
                .stage(&mut txn, business_id, key, &payload_hash, job_id, now)?;
        }

        let event = AuditEvent::new(AuditAction::JobCreated, ACTOR, format!("job:{}", job_id))
            .business(business_id)
            .detail("kind", job.kind)
            .detail("member_id", job.member_id)
            .detail("amount", job.amount)
            .detail("period", job.period);
        self.trail.record_in(&mut txn, &event)?;
        txn.commit()?;

        self.metrics.jobs_created.inc();
        tracing::info!(
            business_id = %business_id,
            job_id = %job_id,
            kind = %job.kind,
            member_id = %job.member_id,
            amount = %job.amount,
            period = %job.period,
            "Job created"
        );
        Ok(job)
    }

    // Transitions

    /// Apply a validated status change to `job` in memory, stamping its
    /// timestamps. Returns the previous status.
    pub fn apply_transition(
        &self,
        job: &mut DisbursementJob,
        next: JobStatus,
        reason: Option<&str>,
    ) -> Result<JobStatus> {
        let from = job.status;
        if !from.can_transition_to(next) {
            tracing::error!(
                job_id = %job.job_id,
                from = %from,
                to = %next,
                "Invalid job transition"
            );
            return Err(Error::InvalidTransition {
                job_id: job.job_id,
                from: from.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            JobStatus::Processing => {
                job.attempts += 1;
                job.processing_started_at = Some(now);
            }
            JobStatus::Succeeded => {
                job.completed_at = Some(now);
                job.error_message = None;
            }
            JobStatus::Failed => {
                job.failed_at = Some(now);
                job.error_message = reason.map(str::to_string);
            }
            JobStatus::Cancelled => {
                job.completed_at = Some(now);
                if let Some(reason) = reason {
                    job.error_message = Some(reason.to_string());
                }
            }
            JobStatus::Pending => {}
        }
        job.status = next;
        Ok(from)
    }

    /// Change a job's status and stage the write.
    ///
    /// `scope` must hold the job's lock; `job` must have been read under it.
    pub fn transition_in(
        &self,
        scope: &LockScope<'_>,
        txn: &mut WriteTxn<'_>,
        job: &mut DisbursementJob,
        next: JobStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        scope.require_job(job.job_id)?;
        let from = self.apply_transition(job, next, reason)?;
        self.store.stage_update(txn, job)?;

        let mut event = AuditEvent::new(
            AuditAction::JobTransitioned,
            ACTOR,
            format!("job:{}", job.job_id),
        )
        .business(job.business_id)
        .detail("from", from)
        .detail("to", next)
        .detail("attempts", job.attempts);
        if let Some(reason) = reason {
            event = event.detail("reason", reason);
        }
        self.trail.record_in(txn, &event)?;

        self.metrics.job_transitions.inc();
        tracing::info!(
            job_id = %job.job_id,
            business_id = %job.business_id,
            from = %from,
            to = %next,
            reason = reason.unwrap_or(""),
            "Job transitioned"
        );
        Ok(())
    }

    /// Reserve funds again for a job leaving `failed`
    pub fn reserve_for(
        &self,
        scope: &LockScope<'_>,
        txn: &mut WriteTxn<'_>,
        job: &mut DisbursementJob,
    ) -> Result<Reservation> {
        let mut account = self.accounts.require(job.business_id)?;
        let reference = EntryReference::new(job.kind.reference_kind(), job.job_id);
        let reservation =
            self.admission
                .reserve_in(scope, txn, &mut account, job.amount, reference)?;
        job.reservation_id = Some(reservation.reservation_id);
        Ok(reservation)
    }

    /// Release the job's reservation, if any. Already released is a no-op.
    pub fn release_for(
        &self,
        scope: &LockScope<'_>,
        txn: &mut WriteTxn<'_>,
        job: &DisbursementJob,
        reason: &str,
    ) -> Result<()> {
        if let Some(reservation_id) = job.reservation_id {
            let mut account = self.accounts.require(job.business_id)?;
            self.admission
                .release_in(scope, txn, &mut account, reservation_id, reason)?;
        }
        Ok(())
    }

    /// Cancel a pending or failed job and release its funds
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<DisbursementJob> {
        let business_id = self.store.get(job_id)?.business_id;
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;
        scope.lock_job(job_id).await?;

        let mut job = self.store.get(job_id)?;
        let mut txn = self.store.storage().begin();
        self.transition_in(&scope, &mut txn, &mut job, JobStatus::Cancelled, Some(reason))?;
        self.release_for(&scope, &mut txn, &job, reason)?;
        txn.commit()?;
        Ok(job)
    }

    // Sweeps

    /// Force-fail jobs left in `processing` longer than the stuck timeout
    pub async fn sweep_stuck(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let timeout = secs(self.config.stuck_timeout_secs);
        let candidates: Vec<DisbursementJob> = self
            .store
            .by_status(JobStatus::Processing)?
            .into_iter()
            .filter(|j| now - j.updated_at > timeout)
            .collect();

        let mut swept = Vec::new();
        for candidate in candidates {
            let mut scope = self.locks.scope();
            scope.lock_business(candidate.business_id).await?;
            scope.lock_job(candidate.job_id).await?;

            let mut job = self.store.get(candidate.job_id)?;
            if job.status != JobStatus::Processing || now - job.updated_at <= timeout {
                continue;
            }

            let reason = format!(
                "stuck in processing since {} (timeout {}s)",
                job.processing_started_at.unwrap_or(job.updated_at),
                self.config.stuck_timeout_secs
            );
            let mut txn = self.store.storage().begin();
            self.transition_in(&scope, &mut txn, &mut job, JobStatus::Failed, Some(&reason))?;
            self.release_for(&scope, &mut txn, &job, &reason)?;
            txn.commit()?;

            self.metrics.stuck_swept.inc();
            tracing::warn!(
                job_id = %job.job_id,
                business_id = %job.business_id,
                "Stuck job force-failed"
            );
            swept.push(job.job_id);
        }
        Ok(swept)
    }

    /// Dead-letter failed jobs whose failure is older than the grace window
    pub async fn sweep_dead_letters(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let grace = secs(self.config.dead_letter_grace_secs);
        let expired = |job: &DisbursementJob| {
            !job.is_dead_lettered()
                && job
                    .failed_at
                    .map(|failed| now - failed >= grace)
                    .unwrap_or(false)
        };

        let candidates: Vec<DisbursementJob> = self
            .store
            .by_status(JobStatus::Failed)?
            .into_iter()
            .filter(|j| expired(j))
            .collect();

        let mut marked = Vec::new();
        for candidate in candidates {
            let mut scope = self.locks.scope();
            scope.lock_business(candidate.business_id).await?;
            scope.lock_job(candidate.job_id).await?;

            let mut job = self.store.get(candidate.job_id)?;
            if job.status != JobStatus::Failed || !expired(&job) {
                continue;
            }
            job.permanently_failed_at = Some(now);

            let mut txn = self.store.storage().begin();
            self.store.stage_update(&mut txn, &mut job)?;
            let event = AuditEvent::new(
                AuditAction::JobDeadLettered,
                ACTOR,
                format!("job:{}", job.job_id),
            )
            .business(job.business_id)
            .detail("attempts", job.attempts)
            .detail("error", job.error_message.clone().unwrap_or_default());
            self.trail.record_in(&mut txn, &event)?;
            txn.commit()?;

            self.metrics.dead_lettered.inc();
            tracing::error!(
                job_id = %job.job_id,
                business_id = %job.business_id,
                attempts = job.attempts,
                error = job.error_message.as_deref().unwrap_or(""),
                "Job dead-lettered, manual review required"
            );
            marked.push(job.job_id);
        }
        Ok(marked)
    }

    /// Failed jobs eligible for automatic retry
    pub fn retry_candidates(&self) -> Result<Vec<DisbursementJob>> {
        Ok(self
            .store
            .by_status(JobStatus::Failed)?
            .into_iter()
            .filter(|j| !j.is_dead_lettered() && j.attempts < self.config.max_attempts)
            .collect())
    }

    /// Dead-lettered jobs awaiting operator review
    pub fn dead_letters(&self) -> Result<Vec<DisbursementJob>> {
        Ok(self
            .store
            .by_status(JobStatus::Failed)?
            .into_iter()
            .filter(DisbursementJob::is_dead_lettered)
            .collect())
    }

    /// Release active job reservations the job no longer needs: the job is
    /// failed or cancelled, or it has moved on to another reservation.
    pub async fn sweep_reservations(&self) -> Result<usize> {
        let mut released = 0;
        for reservation in self.admission.all_active()? {
            if !matches!(
                reservation.reference.kind,
                ReferenceKind::PaymentJob | ReferenceKind::PayrollJob
            ) {
                continue;
            }
            let job_id = reservation.reference.id;

            let mut scope = self.locks.scope();
            scope.lock_business(reservation.business_id).await?;
            scope.lock_job(job_id).await?;

            let job = match self.store.get(job_id) {
                Ok(job) => job,
                Err(Error::JobNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let orphaned = matches!(job.status, JobStatus::Failed | JobStatus::Cancelled)
                || job.reservation_id != Some(reservation.reservation_id);
            if !orphaned {
                continue;
            }

            let mut account = self.accounts.require(reservation.business_id)?;
            let mut txn = self.store.storage().begin();
            self.admission.release_in(
                &scope,
                &mut txn,
                &mut account,
                reservation.reservation_id,
                "reservation sweep",
            )?;
            txn.commit()?;
            released += 1;
        }
        if released > 0 {
            tracing::info!(released, "Orphaned reservations released");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CalculationSnapshot, PayPeriod};
    use chrono::NaiveDate;
    use escrow::AdmissionPolicy;
    use ledger_core::{AccountType, Ledger, PostingLine, PostingRequest};
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        ledger: Arc<Ledger>,
        manager: JobManager,
    }

    fn fixture(config: JobConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger_config = ledger_core::Config::default();
        ledger_config.data_dir = dir.path().to_path_buf();
        let storage =
            Arc::new(Storage::open_with_families(&ledger_config, &crate::column_families()).unwrap());
        let ledger = Arc::new(Ledger::with_storage(storage.clone(), ledger_config).unwrap());
        let locks = Arc::new(LockManager::new());
        let admission =
            AdmissionController::new(storage.clone(), locks.clone(), AdmissionPolicy::SoftHold);
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let manager = JobManager::new(storage, admission, locks, metrics, config);
        Fixture {
            _dir: dir,
            ledger,
            manager,
        }
    }

    async fn funded(f: &Fixture, amount: Decimal) -> BusinessId {
        let business = BusinessId::new();
        f.manager
            .accounts()
            .open_account(f.manager.locks(), business)
            .await
            .unwrap();

        let reference = EntryReference::new(ReferenceKind::Deposit, Uuid::now_v7());
        let mut scope = f.manager.locks().scope();
        scope.lock_business(business).await.unwrap();
        let mut account = f.manager.accounts().require(business).unwrap();
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
        f.manager
            .accounts()
            .stage(&scope, &mut txn, &mut account)
            .unwrap();
        txn.commit().unwrap();
        business
    }

    fn period(month: u32) -> PayPeriod {
        let start = NaiveDate::from_ymd_opt(2024, month, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, month, 28).unwrap();
        PayPeriod::new(start, end).unwrap()
    }

    #[tokio::test]
    async fn test_create_reserves_funds() {
        let f = fixture(JobConfig::default());
        let business = funded(&f, dec!(1000)).await;

        let job = f
            .manager
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(400), period(1)))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.version, 1);

        let account = f.manager.accounts().require(business).unwrap();
        assert_eq!(account.hold_amount, dec!(400));
        assert_eq!(account.available(), dec!(600));

        let err = f
            .manager
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(700), period(1)))
            .await
            .unwrap_err();
        assert!(err.is_insufficient_funds());
    }

    #[tokio::test]
    async fn test_payroll_net_must_match_calculation() {
        let f = fixture(JobConfig {
            strict_net_salary: true,
            ..JobConfig::default()
        });
        let business = funded(&f, dec!(10000)).await;

        let mut calc = CalculationSnapshot::gross_only(dec!(3000));
        calc.deductions.insert("tax".to_string(), dec!(500));
        calc.net = dec!(2500);

        let mut request = NewJob::payroll(business, Uuid::now_v7(), period(2), calc.clone());
        request.amount = dec!(2600);
        assert!(matches!(
            f.manager.create_job(request).await,
            Err(Error::InvalidJob(_))
        ));

        let mut loose = calc.clone();
        loose.net = dec!(2400);
        assert!(f
            .manager
            .create_job(NewJob::payroll(business, Uuid::now_v7(), period(2), loose))
            .await
            .is_err());

        let job = f
            .manager
            .create_job(NewJob::payroll(business, Uuid::now_v7(), period(2), calc))
            .await
            .unwrap();
        assert_eq!(job.amount, dec!(2500));
        assert!(job.calculation_hash.is_some());
    }

    #[tokio::test]
    async fn test_transition_table_enforced() {
        let f = fixture(JobConfig::default());
        let business = funded(&f, dec!(100)).await;
        let job = f
            .manager
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(10), period(3)))
            .await
            .unwrap();

        let mut scope = f.manager.locks().scope();
        scope.lock_business(business).await.unwrap();
        scope.lock_job(job.job_id).await.unwrap();
        let mut loaded = f.manager.get_job(job.job_id).unwrap();
        let mut txn = f.ledger.storage().begin();
        assert!(matches!(
            f.manager
                .transition_in(&scope, &mut txn, &mut loaded, JobStatus::Succeeded, None),
            Err(Error::InvalidTransition { .. })
        ));
        drop(txn);
        drop(scope);

        let cancelled = f.manager.cancel_job(job.job_id, "operator").await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert_eq!(
            f.manager.accounts().require(business).unwrap().hold_amount,
            Decimal::ZERO
        );
        assert!(matches!(
            f.manager.cancel_job(job.job_id, "again").await,
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_dead_letter_after_grace() {
        let f = fixture(JobConfig {
            dead_letter_grace_secs: 60,
            ..JobConfig::default()
        });
        let business = funded(&f, dec!(100)).await;
        let job = f
            .manager
            .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(10), period(4)))
            .await
            .unwrap();

        {
            let mut scope = f.manager.locks().scope();
            scope.lock_business(business).await.unwrap();
            scope.lock_job(job.job_id).await.unwrap();
            let mut loaded = f.manager.get_job(job.job_id).unwrap();
            f.manager
                .apply_transition(&mut loaded, JobStatus::Processing, None)
                .unwrap();
            let mut txn = f.ledger.storage().begin();
            f.manager
                .transition_in(&scope, &mut txn, &mut loaded, JobStatus::Failed, Some("declined"))
                .unwrap();
            f.manager
                .release_for(&scope, &mut txn, &loaded, "declined")
                .unwrap();
            txn.commit().unwrap();
        }

        assert_eq!(f.manager.retry_candidates().unwrap().len(), 1);
        let now = Utc::now();
        assert!(f.manager.sweep_dead_letters(now).await.unwrap().is_empty());

        let later = now + Duration::seconds(120);
        let marked = f.manager.sweep_dead_letters(later).await.unwrap();
        assert_eq!(marked, vec![job.job_id]);
        assert!(f.manager.retry_candidates().unwrap().is_empty());
        assert_eq!(f.manager.dead_letters().unwrap().len(), 1);
        assert!(f.manager.sweep_dead_letters(later).await.unwrap().is_empty());
    }
}
