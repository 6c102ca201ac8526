//! Ledger engine module.
//!
//! This module contains the core ledger logic including:
//! - `LedgerEngine` - Idempotent settlement of deposits, withdrawals and transfers
//! - `Money` / `Currency` - Exact decimal amounts tagged with a currency
//! - `ConversionService` - TTL-cached exchange rates from a `RateProvider`
//! - `AccountStore` - Account records with per-account locking
//! - `TransactionHistory` - Append-only record of every terminal outcome
//! - `batch` - CSV import and export around the engine

mod account;
pub mod batch;
mod config;
mod conversion;
mod error;
mod history;
mod ledger_engine;
mod money;
mod store;
mod transaction;

pub(crate) use rust_decimal::Decimal;

pub use account::{Account, AccountNumber, AccountType};
pub use batch::BatchSummary;
pub use config::{FeePolicy, LedgerConfig};
pub use conversion::{
    Conversion, ConversionRate, ConversionService, RateError, RateProvider, StaticRateProvider,
};
pub use error::{Error, IntentError, LedgerError};
pub use history::{HistoryQuery, SortOrder, TransactionHistory};
pub use ledger_engine::{LedgerEngine, ReconciliationAlert};
pub use money::{Currency, Money, MoneyError, ParseCurrencyError};
pub use store::{AccountStore, InMemoryAccountStore, StoreError};
pub use transaction::{
    CancelToken, CounterpartyLeg, Deposit, Intent, IntentRecord, IntentType, Phase, Receipt,
    Request, RequestId, TransactionId, TransactionKind, TransactionRecord, TransactionStatus,
    Transfer, Withdrawal,
};
