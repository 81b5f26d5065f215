//! End-to-end scenarios through the engine facade

use chrono::{Duration, NaiveDate, Utc};
use escrow::{AdmissionDecision, ScheduleKind, ScheduleMember};
use ledger_core::{
    to_minor_units, AccountType, BusinessId, EntryReference, ReferenceKind, TransactionType,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use settlement::{
    CalculationSnapshot, CircuitState, Config, Error, EscrowEngine, JobStatus, MockBehavior,
    MockGateway, NewJob, PayPeriod,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

struct Harness {
    _dir: TempDir,
    gateway: Arc<MockGateway>,
    engine: Arc<EscrowEngine>,
}

impl Harness {
    fn new() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.ledger.data_dir = temp_dir.path().to_path_buf();
        config.retry.max_attempts = 1;
        config.retry.jitter = false;
        config.circuit_breaker.failure_threshold = 2;
        let gateway = Arc::new(MockGateway::new());
        let engine = Arc::new(EscrowEngine::open(config, gateway.clone()).unwrap());
        Self {
            _dir: temp_dir,
            gateway,
            engine,
        }
    }

    async fn funded(&self, amount: Decimal) -> BusinessId {
        let business = BusinessId::new();
        self.engine.open_account(business).await.unwrap();
        self.engine
            .confirm_deposit(business, amount, &format!("seed-{}", business))
            .await
            .unwrap();
        business
    }
}

fn june() -> PayPeriod {
    PayPeriod::new(
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
        NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_payroll_run_exceeding_balance() {
    let h = Harness::new();
    let business = h.funded(dec!(100000)).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_job(NewJob::payroll(
                    business,
                    Uuid::now_v7(),
                    june(),
                    CalculationSnapshot::gross_only(dec!(30000)),
                ))
                .await
        }));
    }

    let mut created = Vec::new();
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(job) => created.push(job),
            Err(e) => {
                assert!(e.is_insufficient_funds(), "unexpected error: {}", e);
                refused += 1;
            }
        }
    }
    assert_eq!(created.len(), 3);
    assert_eq!(refused, 1);
    assert_eq!(h.engine.metrics().admissions_refused.get(), 1);
    assert!(created.iter().all(|job| job.status == JobStatus::Pending));

    let view = h.engine.balance(business).unwrap();
    assert_eq!(view.hold_amount, dec!(90000));
    assert_eq!(view.available, dec!(10000));

    for job in &created {
        let done = h.engine.execute_job(job.job_id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
    }

    let view = h.engine.balance(business).unwrap();
    assert_eq!(view.balance, dec!(10000));
    assert_eq!(view.hold_amount, Decimal::ZERO);
    assert_eq!(view.ledger_balance, dec!(10000));
    assert!(view.reconciled);
    assert!(h.engine.reconcile(business).await.unwrap().matched);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_job_creation_never_overcommits() {
    let h = Harness::new();
    let business = h.funded(dec!(100000)).await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(20000), june()))
                .await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(e) => assert!(e.is_insufficient_funds(), "unexpected error: {}", e),
        }
    }
    assert_eq!(admitted, 5);

    let view = h.engine.balance(business).unwrap();
    assert_eq!(view.hold_amount, dec!(100000));
    assert_eq!(view.available, Decimal::ZERO);
}

#[tokio::test]
async fn test_reserve_returns_decision() {
    let h = Harness::new();
    let business = h.funded(dec!(500)).await;

    let reference = EntryReference::new(ReferenceKind::Manual, Uuid::now_v7());
    let admitted = h.engine.reserve(business, dec!(400), reference).await.unwrap();
    let reservation = match admitted {
        AdmissionDecision::Admitted(reservation) => reservation,
        other => panic!("expected admission, got {:?}", other),
    };

    let refused = h.engine.reserve(business, dec!(200), reference).await.unwrap();
    assert!(!refused.is_admitted());

    h.engine
        .release_reservation(business, reservation.reservation_id, "no longer needed")
        .await
        .unwrap();
    assert_eq!(h.engine.balance(business).unwrap().available, dec!(500));

    h.engine.freeze(business, "ops").await.unwrap();
    let frozen = h.engine.reserve(business, dec!(1), reference).await.unwrap();
    assert!(matches!(frozen, AdmissionDecision::AccountFrozen));
}

#[tokio::test]
async fn test_reversing_a_deposit_credit() {
    let h = Harness::new();
    let business = BusinessId::new();
    h.engine.open_account(business).await.unwrap();
    let deposit = h
        .engine
        .confirm_deposit(business, dec!(500), "wire-42")
        .await
        .unwrap();

    let credit = h
        .engine
        .ledger()
        .entries_for_correlation(deposit.deposit_id)
        .unwrap()
        .into_iter()
        .find(|e| e.account_type == AccountType::Escrow)
        .unwrap();
    assert_eq!(credit.transaction_type, TransactionType::Credit);

    let reversal = h
        .engine
        .reverse_entry(credit.entry_id, "deposit bounced")
        .await
        .unwrap();
    assert_eq!(reversal.transaction_type, TransactionType::Debit);
    assert_eq!(reversal.amount, dec!(500));
    assert_eq!(reversal.reversal_of_id, Some(credit.entry_id));

    let view = h.engine.balance(business).unwrap();
    assert_eq!(view.balance, Decimal::ZERO);
    assert!(view.reconciled);

    let again = h.engine.reverse_entry(credit.entry_id, "twice").await;
    assert!(matches!(
        again,
        Err(Error::Ledger(ledger_core::Error::AlreadyReversed(_)))
    ));
    assert_eq!(h.engine.compensations(business).unwrap().len(), 1);
}

#[tokio::test]
async fn test_stuck_job_is_force_failed() {
    let h = Harness::new();
    let business = h.funded(dec!(1000)).await;
    let job = h
        .engine
        .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(100), june()))
        .await
        .unwrap();

    {
        let jobs = h.engine.jobs();
        let mut scope = jobs.locks().scope();
        scope.lock_business(business).await.unwrap();
        scope.lock_job(job.job_id).await.unwrap();
        let mut current = jobs.get_job(job.job_id).unwrap();
        let mut txn = jobs.store().storage().begin();
        jobs.transition_in(&scope, &mut txn, &mut current, JobStatus::Processing, None)
            .unwrap();
        txn.commit().unwrap();
    }

    assert!(h.engine.sweep_stuck(Utc::now()).await.unwrap().is_empty());

    let swept = h
        .engine
        .sweep_stuck(Utc::now() + Duration::hours(3))
        .await
        .unwrap();
    assert_eq!(swept, vec![job.job_id]);

    let failed = h.engine.get_job(job.job_id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed
        .error_message
        .unwrap_or_default()
        .contains("stuck in processing"));
    assert_eq!(h.engine.balance(business).unwrap().hold_amount, Decimal::ZERO);
}

#[tokio::test]
async fn test_period_overlap_and_recreation_after_cancel() {
    let h = Harness::new();
    let business = h.funded(dec!(10000)).await;
    let employee = Uuid::now_v7();
    let payroll = |period| {
        NewJob::payroll(
            business,
            employee,
            period,
            CalculationSnapshot::gross_only(dec!(1000)),
        )
    };

    let first = h.engine.create_job(payroll(june())).await.unwrap();

    let duplicate = h.engine.create_job(payroll(june())).await;
    assert!(matches!(duplicate, Err(Error::DuplicateActiveJob { .. })));

    let straddling = PayPeriod::new(
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap(),
        NaiveDate::from_ymd_opt(2024, 7, 15).unwrap(),
    )
    .unwrap();
    let overlap = h.engine.create_job(payroll(straddling)).await;
    assert!(matches!(overlap, Err(Error::PeriodOverlap { .. })));

    h.engine.cancel_job(first.job_id, "wrong rate").await.unwrap();
    let recreated = h.engine.create_job(payroll(june())).await.unwrap();
    assert_ne!(recreated.job_id, first.job_id);
    assert_eq!(h.engine.balance(business).unwrap().hold_amount, dec!(1000));
}

#[tokio::test]
async fn test_idempotent_job_creation() {
    let h = Harness::new();
    let business = h.funded(dec!(1000)).await;
    let recipient = Uuid::now_v7();
    let request =
        NewJob::payment(business, recipient, dec!(250), june()).idempotency_key("invoice-7");

    let first = h.engine.create_job(request.clone()).await.unwrap();
    let replay = h.engine.create_job(request).await.unwrap();
    assert_eq!(first.job_id, replay.job_id);
    assert_eq!(h.engine.balance(business).unwrap().hold_amount, dec!(250));

    let conflicting =
        NewJob::payment(business, recipient, dec!(300), june()).idempotency_key("invoice-7");
    assert!(matches!(
        h.engine.create_job(conflicting).await,
        Err(Error::IdempotencyConflict(_))
    ));
}

#[tokio::test]
async fn test_circuit_opens_and_dead_letters_block_retry() {
    let h = Harness::new();
    let business = h.funded(dec!(1000)).await;
    h.gateway.set_fallback(MockBehavior::Fail("rail down".to_string()));

    let mut jobs = Vec::new();
    for _ in 0..3 {
        jobs.push(
            h.engine
                .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(10), june()))
                .await
                .unwrap(),
        );
    }

    for job in &jobs[..2] {
        let failed = h.engine.execute_job(job.job_id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
    }
    assert!(matches!(
        h.engine.execute_job(jobs[2].job_id).await,
        Err(Error::CircuitOpen(_))
    ));
    assert_eq!(h.engine.get_job(jobs[2].job_id).unwrap().status, JobStatus::Pending);
    assert_eq!(h.engine.breaker().state("mock-gateway").state, CircuitState::Open);

    let dead = h
        .engine
        .sweep_dead_letters(Utc::now() + Duration::hours(25))
        .await
        .unwrap();
    assert_eq!(dead.len(), 2);
    assert_eq!(h.engine.jobs().dead_letters().unwrap().len(), 2);
    assert!(h.engine.jobs().retry_candidates().unwrap().is_empty());

    h.engine.breaker().reset("mock-gateway");
    assert!(matches!(
        h.engine.execute_job(jobs[0].job_id).await,
        Err(Error::DeadLettered(_))
    ));
}

#[tokio::test]
async fn test_compensating_a_disbursement() {
    let h = Harness::new();
    let business = h.funded(dec!(1000)).await;
    let job = h
        .engine
        .create_job(NewJob::payment(business, Uuid::now_v7(), dec!(400), june()))
        .await
        .unwrap();

    // Not yet paid
    assert!(matches!(
        h.engine.compensate_disbursement(job.job_id, "early").await,
        Err(Error::InvalidTransition { .. })
    ));

    h.engine.execute_job(job.job_id).await.unwrap();
    assert_eq!(h.engine.balance(business).unwrap().balance, dec!(600));

    let record = h
        .engine
        .compensate_disbursement(job.job_id, "recipient returned funds")
        .await
        .unwrap();
    assert_eq!(record.escrow_delta, dec!(400));
    assert_eq!(record.job_id, Some(job.job_id));
    assert!(h.engine.get_job(job.job_id).unwrap().compensated_at.is_some());

    let view = h.engine.balance(business).unwrap();
    assert_eq!(view.balance, dec!(1000));
    assert!(view.reconciled);

    assert!(matches!(
        h.engine
            .compensate_disbursement(job.job_id, "again")
            .await,
        Err(Error::AlreadyCompensated(_))
    ));
}

#[tokio::test]
async fn test_schedule_trigger_is_idempotent() {
    let h = Harness::new();
    let business = h.funded(dec!(1000)).await;
    let members: Vec<ScheduleMember> = (0..3)
        .map(|_| ScheduleMember::new(Uuid::now_v7(), dec!(100)))
        .collect();
    let schedule = h
        .engine
        .create_schedule(
            business,
            "contractors",
            ScheduleKind::Payment {
                amount_per_recipient: dec!(100),
            },
            members,
        )
        .await
        .unwrap();

    let first = h
        .engine
        .trigger_schedule(schedule.schedule_id, june(), &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(first.jobs.len(), 3);
    assert!(first.refused.is_empty());
    assert!(first
        .jobs
        .iter()
        .all(|j| j.schedule_id == Some(schedule.schedule_id)));

    let second = h
        .engine
        .trigger_schedule(schedule.schedule_id, june(), &BTreeMap::new())
        .await
        .unwrap();
    let mut first_ids: Vec<Uuid> = first.jobs.iter().map(|j| j.job_id).collect();
    let mut second_ids: Vec<Uuid> = second.jobs.iter().map(|j| j.job_id).collect();
    first_ids.sort();
    second_ids.sort();
    assert_eq!(first_ids, second_ids);
    assert_eq!(h.engine.balance(business).unwrap().hold_amount, dec!(300));
}

#[tokio::test]
async fn test_settlement_cycle_and_audit_pack() {
    let h = Harness::new();
    let started = Utc::now() - Duration::minutes(1);
    let business = h.funded(dec!(1000)).await;
    for amount in [dec!(100), dec!(200)] {
        h.engine
            .create_job(NewJob::payment(business, Uuid::now_v7(), amount, june()))
            .await
            .unwrap();
    }

    let report = h
        .engine
        .run_settlement_cycle(Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.assigned, 2);
    // Both jobs share a bucket unless creation straddled the hour
    assert!(report.claimed >= 1);
    assert_eq!(report.settled, report.claimed);
    assert_eq!(h.engine.metrics().windows_settled.get(), report.settled as u64);
    assert_eq!(h.engine.balance(business).unwrap().balance, dec!(700));

    let pack = h
        .engine
        .audit_pack(business, started, Utc::now() + Duration::minutes(1))
        .unwrap();
    // Deposit plus two disbursements, two lines each
    assert_eq!(pack.entry_count, 6);
    assert_eq!(pack.total_debits, pack.total_credits);
    assert!(!pack.events.is_empty());
    assert!(!pack.content_hash.is_empty());

    assert!(matches!(
        h.engine.audit_pack(business, started, started),
        Err(Error::Config(_))
    ));
}

#[tokio::test]
async fn test_workers_start_and_stop() {
    let h = Harness::new();
    h.funded(dec!(100)).await;
    let workers = h.engine.spawn_workers();
    assert_eq!(workers.len(), 4);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    workers.shutdown().await;

    assert_eq!(h.gateway.calls(), 0);
}

#[test]
fn test_minor_unit_conversion() {
    assert_eq!(to_minor_units(dec!(1234.56)).unwrap(), 123456);
    assert_eq!(to_minor_units(dec!(0.01)).unwrap(), 1);
}
