//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify:
//! - Double entry: Σ(debits) == Σ(credits) per correlation
//! - Minor units: `amount_minor_units == round(amount * 100)`
//! - Replay law: replaying entries reproduces the running balance
//! - Sequencing: sequence numbers strictly increase
//! - Snapshots: replay from a snapshot equals replay from zero

use chrono::NaiveDate;
use ledger_core::{
    to_minor_units, AccountType, BusinessId, Config, EntryReference, Error, Ledger, PostingLine,
    PostingRequest, ReferenceKind, TransactionType,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use tempfile::TempDir;
use uuid::Uuid;

/// Strategy for generating valid amounts (positive, two decimals)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

/// Deposit (true) or disbursement (false) of an amount
fn movement_strategy() -> impl Strategy<Value = (bool, Decimal)> {
    (any::<bool>(), amount_strategy())
}

/// Create test ledger with temp directory
fn create_test_ledger() -> (TempDir, Ledger) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    let ledger = Ledger::open(config).unwrap();
    (temp_dir, ledger)
}

fn movement(business: BusinessId, deposit: bool, amount: Decimal) -> PostingRequest {
    let (kind, from, to) = if deposit {
        (ReferenceKind::Deposit, AccountType::Clearing, AccountType::Escrow)
    } else {
        (ReferenceKind::PayrollJob, AccountType::Escrow, AccountType::Payroll)
    };
    let reference = EntryReference::new(kind, Uuid::now_v7());
    PostingRequest::new(
        Uuid::now_v7(),
        vec![
            PostingLine::debit(business, from, amount, reference),
            PostingLine::credit(business, to, amount, reference),
        ],
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: two-decimal amounts convert exactly to cents
    #[test]
    fn prop_minor_units_exact(cents in 1i64..1_000_000_000i64) {
        prop_assert_eq!(to_minor_units(Decimal::new(cents, 2)).unwrap(), cents);
    }

    /// Property: three-decimal amounts round half away from zero
    #[test]
    fn prop_minor_units_rounding(mills in 1i64..1_000_000_000i64) {
        let expected = (mills + 5) / 10;
        prop_assert_eq!(to_minor_units(Decimal::new(mills, 3)).unwrap(), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: balanced multi-line postings are accepted and stay balanced;
    /// perturbing one side rejects the whole posting
    #[test]
    fn prop_double_entry(amounts in prop::collection::vec(amount_strategy(), 1..6)) {
        let (_dir, ledger) = create_test_ledger();
        let business = BusinessId::new();
        let reference = EntryReference::new(ReferenceKind::Manual, Uuid::now_v7());
        let total: Decimal = amounts.iter().sum();

        let mut lines: Vec<PostingLine> = amounts
            .iter()
            .map(|a| PostingLine::debit(business, AccountType::Clearing, *a, reference))
            .collect();
        lines.push(PostingLine::credit(business, AccountType::Escrow, total, reference));

        let result = ledger.post(PostingRequest::new(Uuid::now_v7(), lines.clone())).unwrap();
        prop_assert_eq!(result.total_debits, result.total_credits);
        prop_assert!(ledger.verify_correlation(result.correlation_id).is_ok());

        let before = ledger.last_sequence();
        let mut skewed = lines;
        if let Some(last) = skewed.last_mut() {
            last.amount += Decimal::new(1, 2);
        }
        let correlation = Uuid::now_v7();
        let rejected = ledger.post(PostingRequest::new(correlation, skewed));
        let is_unbalanced = matches!(rejected, Err(Error::UnbalancedPosting { .. }));
        prop_assert!(is_unbalanced);
        prop_assert!(ledger.entries_for_correlation(correlation).unwrap().is_empty());
        prop_assert_eq!(ledger.last_sequence(), before);
    }

    /// Property: replay reproduces the running escrow balance and sequence
    /// numbers strictly increase
    #[test]
    fn prop_replay_and_sequence(movements in prop::collection::vec(movement_strategy(), 1..12)) {
        let (_dir, ledger) = create_test_ledger();
        let business = BusinessId::new();

        let mut running = Decimal::ZERO;
        let mut last_sequence = 0u64;
        for (deposit, amount) in movements {
            let result = ledger.post(movement(business, deposit, amount)).unwrap();
            running += result.escrow_delta(business);
            for entry in &result.entries {
                prop_assert!(entry.sequence_number > last_sequence);
                last_sequence = entry.sequence_number;
                prop_assert_eq!(entry.amount_minor_units, to_minor_units(entry.amount).unwrap());
            }
        }

        let replay = ledger.replay_balance(business, AccountType::Escrow, None).unwrap();
        prop_assert_eq!(replay.balance, running);
        prop_assert_eq!(replay.balance_minor_units, to_minor_units(running).unwrap());

        // Every account of the business nets to zero across the ledger
        let mut net = Decimal::ZERO;
        for account in AccountType::ALL {
            net += ledger.replay_balance(business, account, None).unwrap().balance;
        }
        prop_assert_eq!(net, Decimal::ZERO);
    }

    /// Property: replay from a snapshot equals replay from zero
    #[test]
    fn prop_snapshot_bounds_replay(
        movements in prop::collection::vec(movement_strategy(), 2..10),
        split in 0usize..10,
    ) {
        let (_dir, ledger) = create_test_ledger();
        let business = BusinessId::new();
        let split = split.min(movements.len());

        for (deposit, amount) in &movements[..split] {
            ledger.post(movement(business, *deposit, *amount)).unwrap();
        }
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let snapshot = ledger.create_snapshot(business, AccountType::Escrow, date).unwrap();
        for (deposit, amount) in &movements[split..] {
            ledger.post(movement(business, *deposit, *amount)).unwrap();
        }

        let from_zero = ledger.replay_balance(business, AccountType::Escrow, None).unwrap();
        let bounded = ledger
            .replay_balance(business, AccountType::Escrow, Some(&snapshot))
            .unwrap();
        prop_assert_eq!(from_zero.balance, bounded.balance);
        prop_assert_eq!(from_zero.last_sequence, bounded.last_sequence);
        prop_assert!(ledger.verify_snapshot(&snapshot).is_ok());
    }

    /// Property: reversing any posted line nets its account back and never twice
    #[test]
    fn prop_reversal_once(amount in amount_strategy(), credit_side in any::<bool>()) {
        let (_dir, ledger) = create_test_ledger();
        let business = BusinessId::new();
        let result = ledger.post(movement(business, true, amount)).unwrap();
        let wanted = if credit_side { TransactionType::Credit } else { TransactionType::Debit };
        let target = result
            .entries
            .iter()
            .find(|e| e.transaction_type == wanted)
            .unwrap()
            .clone();

        let reversal = ledger.reverse(target.entry_id, "property").unwrap();
        prop_assert_eq!(reversal.transaction_type, wanted.opposite());
        prop_assert!(ledger.verify_correlation(reversal.correlation_id).is_ok());

        let account = ledger
            .replay_balance(business, target.account_type, None)
            .unwrap();
        prop_assert_eq!(account.balance, Decimal::ZERO);

        let again = ledger.reverse(target.entry_id, "property");
        let is_already = matches!(again, Err(Error::AlreadyReversed(_)));
        prop_assert!(is_already);
    }
}
