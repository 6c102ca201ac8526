//! Concurrency, fault injection and property tests for the `LedgerEngine`.
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Barrier, Mutex};
use std::thread;

use chrono::{TimeDelta, Utc};
use fx_ledger::{
    Account, AccountStore, AccountType, CancelToken, ConversionRate, Currency, Deposit,
    FeePolicy, HistoryQuery, InMemoryAccountStore, Intent, LedgerConfig, LedgerEngine,
    LedgerError, Money, RateError, RateProvider, Request, RequestId, StaticRateProvider,
    StoreError, TransactionKind, TransactionStatus,
};
use proptest::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

fn usd(amount: Decimal) -> Money {
    Money::new(amount, Currency::USD)
}

fn eur(amount: Decimal) -> Money {
    Money::new(amount, Currency::EUR)
}

fn open(store: &impl AccountStore, number: &str, balance: Money) {
    store
        .open_account(Account::open(number, "US", AccountType::Checking, balance))
        .unwrap();
}

fn rates() -> StaticRateProvider {
    let rates = StaticRateProvider::new();
    rates.set_rate(Currency::USD, Currency::EUR, dec!(0.90));
    rates
}

/// Store double that fails commits on selected accounts.
#[derive(Default)]
struct FaultyStore {
    inner: InMemoryAccountStore,
    /// Account -> number of commits that still succeed before every later one fails
    failing: Mutex<HashMap<String, usize>>,
    /// Cancelled from inside the first commit
    cancel_on_commit: Mutex<Option<CancelToken>>,
    /// The next commit panics instead of returning
    panic_on_commit: AtomicBool,
}

impl FaultyStore {
    fn fail_after(&self, account: &str, successful_commits: usize) {
        self.failing
            .lock()
            .unwrap()
            .insert(account.to_string(), successful_commits);
    }
}

impl AccountStore for FaultyStore {
    fn open_account(&self, account: Account) -> Result<(), StoreError> {
        self.inner.open_account(account)
    }

    fn account(&self, account_number: &str) -> Option<Account> {
        self.inner.account(account_number)
    }

    fn accounts(&self) -> Vec<Account> {
        self.inner.accounts()
    }

    fn with_account_lock<T, F>(&self, account_number: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Account) -> T,
    {
        self.inner.with_account_lock(account_number, f)
    }

    fn with_account_locks<T, F>(&self, first: &str, second: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Account, &mut Account) -> T,
    {
        self.inner.with_account_locks(first, second, f)
    }

    fn commit(&self, account: &mut Account, new_balance: Decimal) -> Result<(), StoreError> {
        if self.panic_on_commit.swap(false, Ordering::SeqCst) {
            panic!("store crashed while committing {}", account.account_number());
        }
        if let Some(token) = self.cancel_on_commit.lock().unwrap().take() {
            token.cancel();
        }
        if let Some(remaining) = self.failing.lock().unwrap().get_mut(account.account_number()) {
            if *remaining == 0 {
                return Err(StoreError::Persistence {
                    account: account.account_number().to_string(),
                    reason: "injected write failure".to_string(),
                });
            }
            *remaining -= 1;
        }
        self.inner.commit(account, new_balance)
    }
}

fn faulty_engine(fee_policy: FeePolicy) -> LedgerEngine<FaultyStore> {
    let store = FaultyStore::default();
    open(&store, "S", usd(dec!(100.00)));
    open(&store, "D", eur(dec!(0.00)));
    LedgerEngine::new(
        store,
        rates(),
        LedgerConfig::default().with_fee_policy(fee_policy),
    )
}

#[test]
fn test_deposit_commit_failure_records_failed() {
    let engine = faulty_engine(FeePolicy::Free);
    engine.store().fail_after("S", 0);

    let err = engine.deposit("d1", "S", usd(dec!(10.00))).unwrap_err();

    assert!(matches!(err, LedgerError::Persistence { ref account, .. } if account == "S"));
    assert_eq!(engine.balance("S"), Some(usd(dec!(100.00))));
    let records = engine.history().by_request(&RequestId::new("d1"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, TransactionKind::Deposit);
    assert_eq!(records[0].status, TransactionStatus::Failed);

    let retry = engine.deposit("d1", "S", usd(dec!(10.00))).unwrap_err();
    assert_eq!(retry, err);
    assert_eq!(engine.history().len(), 1);
}

#[test]
fn test_withdrawal_commit_failure_records_failed() {
    let engine = faulty_engine(FeePolicy::Free);
    engine.store().fail_after("S", 0);

    let err = engine.withdraw("w1", "S", usd(dec!(10.00))).unwrap_err();

    assert!(matches!(err, LedgerError::Persistence { ref account, .. } if account == "S"));
    assert_eq!(engine.balance("S"), Some(usd(dec!(100.00))));
    let records = engine.history().by_request(&RequestId::new("w1"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, TransactionKind::Withdrawal);
    assert_eq!(records[0].status, TransactionStatus::Failed);
    assert_eq!(
        engine.status_of(&RequestId::new("w1")),
        Some(TransactionStatus::Failed)
    );

    let retry = engine.withdraw("w1", "S", usd(dec!(10.00))).unwrap_err();
    assert_eq!(retry, err);
    assert_eq!(engine.history().len(), 1);
}

#[test]
fn test_panic_during_commit_releases_request_id() {
    let engine = faulty_engine(FeePolicy::Free);
    engine.store().panic_on_commit.store(true, Ordering::SeqCst);

    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        engine.deposit("d1", "S", usd(dec!(10.00)))
    }));

    assert!(crashed.is_err());
    assert_eq!(engine.status_of(&RequestId::new("d1")), None);
    assert_eq!(engine.balance("S"), Some(usd(dec!(100.00))));

    engine.deposit("d1", "S", usd(dec!(10.00))).unwrap();
    assert_eq!(engine.balance("S"), Some(usd(dec!(110.00))));
    assert_eq!(
        engine.status_of(&RequestId::new("d1")),
        Some(TransactionStatus::Completed)
    );
}

#[test]
fn test_destination_failure_is_compensated() {
    let engine = faulty_engine(FeePolicy::Fixed(dec!(1.00)));
    engine.store().fail_after("D", 0);

    let err = engine.transfer("t1", "S", "D", usd(dec!(50.00))).unwrap_err();

    assert!(matches!(err, LedgerError::Persistence { ref account, .. } if account == "D"));
    assert!(!err.is_fatal());
    assert_eq!(engine.balance("S"), Some(usd(dec!(100.00))));
    assert_eq!(engine.balance("D"), Some(eur(dec!(0.00))));

    let records = engine.history().by_request(&RequestId::new("t1"));
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].kind, TransactionKind::TransferOut);
    assert_eq!(records[0].status, TransactionStatus::Failed);
    assert_eq!(records[1].kind, TransactionKind::Reversal);
    assert_eq!(records[1].status, TransactionStatus::Completed);
    assert_eq!(records[1].settled_amount, usd(dec!(51.00)));
    assert_eq!(records[0].correlation_id, records[1].correlation_id);
    assert!(engine.reconciliation_alerts().is_empty());
    assert_eq!(
        engine.status_of(&RequestId::new("t1")),
        Some(TransactionStatus::Failed)
    );
}

#[test]
fn test_failed_compensation_raises_alert() {
    let engine = faulty_engine(FeePolicy::Free);
    engine.store().fail_after("D", 0);
    // the debit goes through, the re-credit does not
    engine.store().fail_after("S", 1);

    let err = engine.transfer("t1", "S", "D", usd(dec!(40.00))).unwrap_err();

    assert!(err.is_fatal());
    assert!(matches!(
        err,
        LedgerError::CompensationFailure { ref account, amount, .. }
            if account == "S" && amount == usd(dec!(40.00))
    ));
    assert_eq!(engine.balance("S"), Some(usd(dec!(60.00))));

    let alerts = engine.reconciliation_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].account_number, "S");
    assert_eq!(alerts[0].amount, usd(dec!(40.00)));
    assert_eq!(alerts[0].request_id, RequestId::new("t1"));

    let failed = engine
        .history()
        .query(&HistoryQuery::new().status(TransactionStatus::Failed));
    assert_eq!(failed.len(), 1);
    assert!(engine
        .history()
        .query(&HistoryQuery::new().kind(TransactionKind::Reversal))
        .is_empty());
}

#[test]
fn test_source_failure_rejects_before_any_movement() {
    let engine = faulty_engine(FeePolicy::Free);
    engine.store().fail_after("S", 0);

    let err = engine.transfer("t1", "S", "D", usd(dec!(10.00))).unwrap_err();

    assert!(matches!(err, LedgerError::Persistence { ref account, .. } if account == "S"));
    assert_eq!(engine.balance("S"), Some(usd(dec!(100.00))));
    assert_eq!(engine.balance("D"), Some(eur(dec!(0.00))));
    assert_eq!(engine.history().len(), 1);
}

#[test]
fn test_cancellation_after_validation_is_ignored() {
    let engine = faulty_engine(FeePolicy::Free);
    let token = CancelToken::new();
    *engine.store().cancel_on_commit.lock().unwrap() = Some(token.clone());

    let request = Request::new("d1", Intent::Deposit(Deposit::new("S", usd(dec!(5.00)))))
        .with_cancel(token.clone());
    let receipt = engine.submit(request).unwrap();

    assert!(token.is_cancelled());
    assert_eq!(receipt.new_balance, usd(dec!(105.00)));
}

/// Provider that cancels a token while the rate is being fetched.
struct CancellingProvider {
    inner: StaticRateProvider,
    token: CancelToken,
}

impl RateProvider for CancellingProvider {
    fn fetch_rate(&self, from: Currency, to: Currency) -> Result<ConversionRate, RateError> {
        self.token.cancel();
        self.inner.fetch_rate(from, to)
    }
}

#[test]
fn test_cancellation_while_converting_is_honoured() {
    let token = CancelToken::new();
    let engine = LedgerEngine::in_memory(
        CancellingProvider {
            inner: rates(),
            token: token.clone(),
        },
        LedgerConfig::default(),
    );
    open(engine.store(), "D", eur(dec!(0.00)));

    let request = Request::new("d1", Intent::Deposit(Deposit::new("D", usd(dec!(5.00)))))
        .with_cancel(token);
    let err = engine.submit(request).unwrap_err();

    assert!(matches!(err, LedgerError::Cancelled { .. }));
    assert_eq!(engine.balance("D"), Some(eur(dec!(0.00))));
    assert!(engine.history().is_empty());
}

#[test]
fn test_stale_provider_rate_is_refused() {
    let provider = StaticRateProvider::new();
    provider.insert(ConversionRate::new(
        Currency::USD,
        Currency::EUR,
        dec!(0.90),
        Utc::now() - TimeDelta::hours(1),
    ));
    let engine = LedgerEngine::in_memory(provider, LedgerConfig::default());
    open(engine.store(), "D", eur(dec!(0.00)));

    let err = engine.deposit("d1", "D", usd(dec!(5.00))).unwrap_err();

    assert!(matches!(
        err,
        LedgerError::RateUnavailable(RateError::Stale { .. })
    ));
    assert_eq!(engine.balance("D"), Some(eur(dec!(0.00))));
}

#[test]
fn test_inverse_rate_is_never_used() {
    let provider = StaticRateProvider::new();
    provider.set_rate(Currency::EUR, Currency::USD, dec!(1.10));
    let engine = LedgerEngine::in_memory(provider, LedgerConfig::default());
    open(engine.store(), "D", eur(dec!(0.00)));

    let err = engine.deposit("d1", "D", usd(dec!(5.00))).unwrap_err();
    assert!(matches!(
        err,
        LedgerError::RateUnavailable(RateError::Missing { .. })
    ));
}

#[test]
fn test_opposite_transfers_do_not_deadlock() {
    let engine = LedgerEngine::in_memory(StaticRateProvider::new(), LedgerConfig::default());
    open(engine.store(), "A", usd(dec!(1000.00)));
    open(engine.store(), "B", usd(dec!(1000.00)));
    let barrier = Barrier::new(2);

    thread::scope(|scope| {
        for (source, destination) in [("A", "B"), ("B", "A")] {
            let engine = &engine;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for i in 0..500 {
                    engine
                        .transfer(
                            format!("{source}-{i}"),
                            source,
                            destination,
                            usd(dec!(1.00)),
                        )
                        .unwrap();
                }
            });
        }
    });

    assert_eq!(engine.balance("A"), Some(usd(dec!(1000.00))));
    assert_eq!(engine.balance("B"), Some(usd(dec!(1000.00))));
    assert_eq!(engine.history().len(), 2000);
}

#[test]
fn test_concurrent_withdrawals_never_overdraw() {
    let engine = LedgerEngine::in_memory(StaticRateProvider::new(), LedgerConfig::default());
    open(engine.store(), "A", usd(dec!(100.00)));

    let settled = thread::scope(|scope| {
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let engine = &engine;
                scope.spawn(move || engine.withdraw(format!("w{i}"), "A", usd(dec!(20.00))))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(Result::is_ok)
            .count()
    });

    assert_eq!(settled, 5);
    assert_eq!(engine.balance("A"), Some(usd(dec!(0.00))));
    assert_eq!(
        engine
            .history()
            .query(&HistoryQuery::new().status(TransactionStatus::Failed))
            .len(),
        5
    );
}

#[test]
fn test_concurrent_duplicates_settle_once() {
    let engine = LedgerEngine::in_memory(StaticRateProvider::new(), LedgerConfig::default());
    open(engine.store(), "A", usd(dec!(0.00)));
    let barrier = Barrier::new(8);

    thread::scope(|scope| {
        for _ in 0..8 {
            let engine = &engine;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                match engine.deposit("same", "A", usd(dec!(10.00))) {
                    Ok(receipt) => assert_eq!(receipt.settled, usd(dec!(10.00))),
                    Err(err) => assert!(matches!(err, LedgerError::DuplicateRequest { .. })),
                }
            });
        }
    });

    assert_eq!(engine.balance("A"), Some(usd(dec!(10.00))));
    assert_eq!(engine.history().len(), 1);
}

#[derive(Debug, Clone)]
enum Op {
    Deposit(Decimal),
    Withdraw(Decimal),
}

fn op() -> impl Strategy<Value = Op> {
    let cents = (1i64..50_000).prop_map(|cents| Decimal::new(cents, 2));
    prop_oneof![
        cents.clone().prop_map(Op::Deposit),
        cents.prop_map(Op::Withdraw),
    ]
}

proptest! {
    #[test]
    fn balance_matches_sequential_model(ops in prop::collection::vec(op(), 1..40)) {
        let engine = LedgerEngine::in_memory(StaticRateProvider::new(), LedgerConfig::default());
        open(engine.store(), "A", usd(dec!(0.00)));
        let mut expected = Decimal::ZERO;

        for (i, op) in ops.iter().enumerate() {
            let request = format!("r{i}");
            match *op {
                Op::Deposit(amount) => {
                    engine.deposit(request, "A", usd(amount)).unwrap();
                    expected += amount;
                }
                Op::Withdraw(amount) => {
                    let result = engine.withdraw(request, "A", usd(amount));
                    if amount <= expected {
                        prop_assert!(result.is_ok());
                        expected -= amount;
                    } else {
                        let is_insufficient = matches!(result, Err(LedgerError::InsufficientFunds { .. }));
                        prop_assert!(is_insufficient);
                    }
                }
            }
            let balance = engine.balance("A").unwrap().amount();
            prop_assert!(balance >= Decimal::ZERO);
            prop_assert_eq!(balance, expected);
        }
        prop_assert_eq!(engine.history().len(), ops.len());
    }

    #[test]
    fn conversion_rounds_once_half_to_even(cents in 1i64..10_000_000, rate_bp in 1i64..100_000) {
        let amount = Decimal::new(cents, 2);
        let rate = Decimal::new(rate_bp, 4);
        let provider = StaticRateProvider::new();
        provider.set_rate(Currency::USD, Currency::EUR, rate);
        let engine = LedgerEngine::in_memory(provider, LedgerConfig::default());
        open(engine.store(), "D", eur(dec!(0)));

        let result = engine.deposit("d1", "D", usd(amount));
        let expected = (amount * rate).round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
        if expected.is_zero() {
            let is_settles_to_zero = matches!(result, Err(LedgerError::SettlesToZero { .. }));
            prop_assert!(is_settles_to_zero);
            prop_assert_eq!(engine.balance("D"), Some(eur(dec!(0))));
            return Ok(());
        }
        let receipt = result.unwrap();

        prop_assert_eq!(receipt.settled.amount(), expected);
        prop_assert!(receipt.settled.amount().scale() <= 2);
        prop_assert_eq!(receipt.conversion_rate, Some(rate));
    }

    #[test]
    fn transfers_conserve_funds_minus_fees(amounts in prop::collection::vec(1i64..5_000, 1..20)) {
        let engine = LedgerEngine::in_memory(
            StaticRateProvider::new(),
            LedgerConfig::default().with_fee_policy(FeePolicy::Fixed(dec!(0.50))),
        );
        open(engine.store(), "A", usd(dec!(500.00)));
        open(engine.store(), "B", usd(dec!(0.00)));
        let mut fees = Decimal::ZERO;

        for (i, cents) in amounts.iter().enumerate() {
            if let Ok(receipt) = engine.transfer(format!("t{i}"), "A", "B", usd(Decimal::new(*cents, 2))) {
                fees += receipt.fee.map_or(Decimal::ZERO, |fee| fee.amount());
            }
        }

        let a = engine.balance("A").unwrap().amount();
        let b = engine.balance("B").unwrap().amount();
        prop_assert!(a >= Decimal::ZERO);
        prop_assert_eq!(a + b + fees, dec!(500.00));
    }
}
