//! Escrow engine
//!
//! Wires the ledger, the escrow layer and the job machinery over one shared
//! storage and lock table, and exposes the operations callers use.

use crate::{
    circuit_breaker::CircuitBreaker,
    compensation::{CompensationManager, CompensationRecord},
    config::Config,
    executor::JobExecutor,
    gateway::GatewayClient,
    jobs::JobManager,
    metrics::EngineMetrics,
    retry::RetryPolicy,
    scheduler::{self, WorkerHandle},
    trigger::{ScheduleTrigger, TriggerOutcome},
    types::{CalculationSnapshot, DisbursementJob, NewJob, PayPeriod},
    window::{CycleReport, SettlementBatcher},
    Error, Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use escrow::{
    AccountStore, AdmissionController, AdmissionDecision, BalanceView, Deposit, DepositService,
    EscrowAccount, LockManager, Reconciliation, ReconciliationDiscrepancy, ReconciliationEngine,
    Reservation, Schedule, ScheduleKind, ScheduleMember, ScheduleService,
};
use ledger_core::{
    AccountType, AuditPack, AuditPackExporter, BalanceSnapshot, BusinessId, EntryReference,
    Ledger, LedgerEntry, Storage,
};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Escrow-backed disbursement engine
#[derive(Debug)]
pub struct EscrowEngine {
    config: Config,
    ledger: Arc<Ledger>,
    locks: Arc<LockManager>,
    accounts: AccountStore,
    admission: AdmissionController,
    deposits: DepositService,
    schedules: ScheduleService,
    reconciliation: ReconciliationEngine,
    jobs: JobManager,
    executor: JobExecutor,
    batcher: SettlementBatcher,
    trigger: ScheduleTrigger,
    compensation: CompensationManager,
    exporter: AuditPackExporter,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<EngineMetrics>,
}

impl EscrowEngine {
    /// Open storage under `config.ledger.data_dir` and build every service
    pub fn open(config: Config, gateway: Arc<dyn GatewayClient>) -> Result<Self> {
        let storage = Arc::new(Storage::open_with_families(
            &config.ledger,
            &crate::column_families(),
        )?);
        let ledger = Arc::new(Ledger::with_storage(storage.clone(), config.ledger.clone())?);
        let locks = Arc::new(LockManager::new());
        let metrics = Arc::new(EngineMetrics::new()?);

        let admission = AdmissionController::new(
            storage.clone(),
            locks.clone(),
            config.escrow.admission.policy,
        );
        let jobs = JobManager::new(
            storage.clone(),
            admission.clone(),
            locks.clone(),
            metrics.clone(),
            config.jobs.clone(),
        );
        let breaker = Arc::new(CircuitBreaker::new(&config.circuit_breaker));
        let executor = JobExecutor::new(
            jobs.clone(),
            ledger.clone(),
            gateway,
            breaker.clone(),
            RetryPolicy::new(&config.retry),
            metrics.clone(),
        );
        let schedules = ScheduleService::new(storage.clone(), admission.clone(), locks.clone());

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            data_dir = %config.ledger.data_dir.display(),
            policy = ?admission.policy(),
            window = %config.window.window_type,
            "Escrow engine opened"
        );

        Ok(Self {
            accounts: AccountStore::new(storage),
            deposits: DepositService::new(ledger.clone(), locks.clone()),
            reconciliation: ReconciliationEngine::new(
                ledger.clone(),
                locks.clone(),
                config.escrow.reconciliation.tolerance,
            ),
            batcher: SettlementBatcher::new(
                executor.clone(),
                config.window.window_type,
                metrics.clone(),
            ),
            trigger: ScheduleTrigger::new(schedules.clone(), jobs.clone()),
            compensation: CompensationManager::new(ledger.clone(), locks.clone(), metrics.clone()),
            exporter: AuditPackExporter::new(ledger.clone()),
            config,
            ledger,
            locks,
            admission,
            schedules,
            jobs,
            executor,
            breaker,
            metrics,
        })
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ledger
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Lock table
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Job manager
    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    /// Settlement batcher
    pub fn batcher(&self) -> &SettlementBatcher {
        &self.batcher
    }

    /// Gateway circuit breaker
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Engine metrics
    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    // Accounts and funds

    /// Open the escrow account of a business
    pub async fn open_account(&self, business_id: BusinessId) -> Result<EscrowAccount> {
        Ok(self.accounts.open_account(&self.locks, business_id).await?)
    }

    /// Freeze an account; admissions and executions are refused until unfrozen
    pub async fn freeze(&self, business_id: BusinessId, actor: &str) -> Result<EscrowAccount> {
        Ok(self
            .accounts
            .set_frozen(&self.locks, business_id, true, actor)
            .await?)
    }

    /// Lift a freeze
    pub async fn unfreeze(&self, business_id: BusinessId, actor: &str) -> Result<EscrowAccount> {
        Ok(self
            .accounts
            .set_frozen(&self.locks, business_id, false, actor)
            .await?)
    }

    /// Credit a confirmed deposit, idempotent on the external reference
    pub async fn confirm_deposit(
        &self,
        business_id: BusinessId,
        amount: Decimal,
        external_reference: &str,
    ) -> Result<Deposit> {
        Ok(self
            .deposits
            .confirm_deposit(business_id, amount, external_reference)
            .await?)
    }

    /// Reserve funds. A refusal is a decision, not an error.
    pub async fn reserve(
        &self,
        business_id: BusinessId,
        amount: Decimal,
        reference: EntryReference,
    ) -> Result<AdmissionDecision> {
        let result = self.admission.reserve(business_id, amount, reference).await;
        if matches!(result, Err(escrow::Error::InsufficientFunds { .. })) {
            self.metrics.admissions_refused.inc();
        }
        Ok(AdmissionDecision::from_result(result)?)
    }

    /// Release an active reservation
    pub async fn release_reservation(
        &self,
        business_id: BusinessId,
        reservation_id: Uuid,
        reason: &str,
    ) -> Result<Reservation> {
        let mut scope = self.locks.scope();
        scope.lock_business(business_id).await?;

        let mut account = self.accounts.require(business_id)?;
        let mut txn = self.ledger.storage().begin();
        let reservation =
            self.admission
                .release_in(&scope, &mut txn, &mut account, reservation_id, reason)?;
        txn.commit()?;
        Ok(reservation)
    }

    /// Balance, hold and availability of a business
    pub fn balance(&self, business_id: BusinessId) -> Result<BalanceView> {
        Ok(self.reconciliation.balance_view(business_id)?)
    }

    // Jobs

    /// Admit and create a job
    pub async fn create_job(&self, request: NewJob) -> Result<DisbursementJob> {
        self.jobs.create_job(request).await
    }

    /// Load a job
    pub fn get_job(&self, job_id: Uuid) -> Result<DisbursementJob> {
        self.jobs.get_job(job_id)
    }

    /// Jobs of a business
    pub fn jobs_for_business(&self, business_id: BusinessId) -> Result<Vec<DisbursementJob>> {
        self.jobs.jobs_for_business(business_id)
    }

    /// Cancel a pending or failed job and release its funds
    pub async fn cancel_job(&self, job_id: Uuid, reason: &str) -> Result<DisbursementJob> {
        self.jobs.cancel_job(job_id, reason).await
    }

    /// Execute a job now, outside any window
    pub async fn execute_job(&self, job_id: Uuid) -> Result<DisbursementJob> {
        self.executor.execute(job_id).await
    }

    // Schedules

    /// Create a schedule the business can fund one run of
    pub async fn create_schedule(
        &self,
        business_id: BusinessId,
        name: &str,
        kind: ScheduleKind,
        members: Vec<ScheduleMember>,
    ) -> Result<Schedule> {
        Ok(self
            .schedules
            .create(business_id, name, kind, members)
            .await?)
    }

    /// Load a schedule
    pub fn get_schedule(&self, schedule_id: Uuid) -> Result<Schedule> {
        Ok(self.schedules.get(schedule_id)?)
    }

    /// Change a schedule's name and kind
    pub async fn update_schedule(
        &self,
        schedule_id: Uuid,
        name: &str,
        kind: ScheduleKind,
    ) -> Result<Schedule> {
        Ok(self.schedules.update(schedule_id, name, kind).await?)
    }

    /// Add a member to a schedule
    pub async fn attach_member(&self, schedule_id: Uuid, member: ScheduleMember) -> Result<Schedule> {
        Ok(self.schedules.attach_member(schedule_id, member).await?)
    }

    /// Remove a member from a schedule
    pub async fn detach_member(&self, schedule_id: Uuid, member_id: Uuid) -> Result<Schedule> {
        Ok(self.schedules.detach_member(schedule_id, member_id).await?)
    }

    /// Create one job per schedule member for `period`
    pub async fn trigger_schedule(
        &self,
        schedule_id: Uuid,
        period: PayPeriod,
        calculations: &BTreeMap<Uuid, CalculationSnapshot>,
    ) -> Result<TriggerOutcome> {
        self.trigger.trigger(schedule_id, period, calculations).await
    }

    // Settlement and corrections

    /// One batching cycle as this engine's worker
    pub async fn run_settlement_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        self.batcher
            .run_cycle(&self.config.workers.worker_id, now)
            .await
    }

    /// Reverse the disbursement of a succeeded job
    pub async fn compensate_disbursement(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<CompensationRecord> {
        self.compensation
            .compensate_disbursement(job_id, reason)
            .await
    }

    /// Reverse a single ledger entry
    pub async fn reverse_entry(&self, entry_id: Uuid, reason: &str) -> Result<LedgerEntry> {
        self.compensation.reverse_entry(entry_id, reason).await
    }

    /// Corrections issued for a business
    pub fn compensations(&self, business_id: BusinessId) -> Result<Vec<CompensationRecord>> {
        self.compensation.compensations(business_id)
    }

    // Reconciliation

    /// Compare the projection with the ledger
    pub async fn reconcile(&self, business_id: BusinessId) -> Result<Reconciliation> {
        Ok(self.reconciliation.reconcile(business_id).await?)
    }

    /// Reconcile, failing on divergence
    pub async fn verify(&self, business_id: BusinessId) -> Result<Reconciliation> {
        Ok(self.reconciliation.verify(business_id).await?)
    }

    /// Compare the ledger with an externally observed balance
    pub async fn reconcile_external(
        &self,
        business_id: BusinessId,
        observed: Decimal,
    ) -> Result<Reconciliation> {
        Ok(self
            .reconciliation
            .reconcile_external(business_id, observed)
            .await?)
    }

    /// Discrepancies recorded for a business
    pub fn discrepancies(&self, business_id: BusinessId) -> Result<Vec<ReconciliationDiscrepancy>> {
        Ok(self.reconciliation.discrepancies(business_id)?)
    }

    /// Approve a discrepancy for compensation
    pub async fn approve_discrepancy(
        &self,
        business_id: BusinessId,
        discrepancy_id: Uuid,
        actor: &str,
    ) -> Result<ReconciliationDiscrepancy> {
        Ok(self
            .reconciliation
            .approve(business_id, discrepancy_id, actor)
            .await?)
    }

    /// Close a discrepancy without compensation
    pub async fn resolve_discrepancy(
        &self,
        business_id: BusinessId,
        discrepancy_id: Uuid,
        actor: &str,
        note: &str,
    ) -> Result<ReconciliationDiscrepancy> {
        Ok(self
            .reconciliation
            .resolve(business_id, discrepancy_id, actor, note)
            .await?)
    }

    /// Apply an approved discrepancy
    pub async fn compensate_discrepancy(
        &self,
        business_id: BusinessId,
        discrepancy_id: Uuid,
        actor: &str,
    ) -> Result<ReconciliationDiscrepancy> {
        Ok(self
            .reconciliation
            .compensate(business_id, discrepancy_id, actor)
            .await?)
    }

    /// Snapshot of one account of a business for `date`
    pub async fn snapshot(
        &self,
        business_id: BusinessId,
        account: AccountType,
        date: NaiveDate,
    ) -> Result<BalanceSnapshot> {
        Ok(self
            .reconciliation
            .snapshot(business_id, account, date)
            .await?)
    }

    /// Entries and audit events of a business in `[from, to)`
    pub fn audit_pack(
        &self,
        business_id: BusinessId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditPack> {
        if to <= from {
            return Err(Error::Config(format!(
                "audit range end {} not after start {}",
                to, from
            )));
        }
        Ok(self.exporter.export(business_id, from, to)?)
    }

    // Maintenance

    /// Force-fail jobs stuck in processing
    pub async fn sweep_stuck(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.jobs.sweep_stuck(now).await
    }

    /// Dead-letter jobs failed past the grace window
    pub async fn sweep_dead_letters(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.jobs.sweep_dead_letters(now).await
    }

    /// Retry failed jobs still eligible. Stops at an open circuit.
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut retried = 0;
        for job in self.jobs.retry_candidates()? {
            match self.executor.execute(job.job_id).await {
                Ok(done) => {
                    retried += 1;
                    tracing::info!(
                        job_id = %done.job_id,
                        attempts = done.attempts,
                        status = %done.status,
                        "Failed job retried"
                    );
                }
                Err(Error::CircuitOpen(_)) => break,
                Err(e) => {
                    tracing::warn!(job_id = %job.job_id, error = %e, "Retry not started");
                }
            }
        }
        Ok(retried)
    }

    /// Release reservations left behind by failed or cancelled jobs
    pub async fn sweep_reservations(&self) -> Result<usize> {
        self.jobs.sweep_reservations().await
    }

    /// Reconcile every account and take today's ESCROW snapshot.
    ///
    /// Returns the number of accounts that diverged.
    pub async fn reconcile_all(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut diverged = 0;
        for account in self.accounts.list()? {
            let business_id = account.business_id;
            let result = self.reconciliation.reconcile(business_id).await?;
            if !result.matched {
                diverged += 1;
                continue;
            }
            if let Err(e) = self
                .reconciliation
                .snapshot(business_id, AccountType::Escrow, now.date_naive())
                .await
            {
                tracing::warn!(business_id = %business_id, error = %e, "Daily snapshot failed");
            }
        }
        Ok(diverged)
    }

    /// Drop expired idempotency keys and idle lock entries
    pub fn purge(&self, now: DateTime<Utc>) -> Result<usize> {
        let purged = self.jobs.idempotency().purge_expired(now)?;
        let pruned = self.locks.prune();
        tracing::debug!(purged, pruned, "Purge complete");
        Ok(purged)
    }

    /// Start the background loops
    pub fn spawn_workers(self: &Arc<Self>) -> WorkerHandle {
        scheduler::spawn(self.clone())
    }
}
