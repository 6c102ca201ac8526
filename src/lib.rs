//! Multi-currency ledger core.
//!
//! Accounts hold a single balance in their home currency. Deposits,
//! withdrawals and transfers may be expressed in any currency and are
//! converted at a cached exchange rate before they touch a balance.
//! Every request carries an idempotency key, and every terminal outcome is
//! kept in an append-only history.
//!
//! ```
//! use fx_ledger::{Account, AccountStore, AccountType, Currency, FeePolicy, LedgerConfig,
//!     LedgerEngine, Money, StaticRateProvider};
//! use rust_decimal::Decimal;
//!
//! let rates = StaticRateProvider::new();
//! rates.set_rate(Currency::USD, Currency::EUR, Decimal::new(90, 2));
//!
//! let config = LedgerConfig::default().with_fee_policy(FeePolicy::Fixed(Decimal::ONE));
//! let ledger = LedgerEngine::in_memory(rates, config);
//! ledger.store().open_account(Account::open(
//!     "S", "US", AccountType::Checking, Money::new(Decimal::new(10000, 2), Currency::USD),
//! )).unwrap();
//! ledger.store().open_account(Account::open(
//!     "D", "DE", AccountType::Savings, Money::zero(Currency::EUR),
//! )).unwrap();
//!
//! ledger.transfer("t-1", "S", "D", Money::new(Decimal::new(50, 0), Currency::USD)).unwrap();
//! assert_eq!(ledger.balance("S").unwrap().amount(), Decimal::new(4900, 2));
//! assert_eq!(ledger.balance("D").unwrap().amount(), Decimal::new(4500, 2));
//! ```

mod engine;

pub use engine::*;
