use crate::engine::account::AccountNumber;
use crate::engine::conversion::RateError;
use crate::engine::money::{Currency, Money, MoneyError};
use crate::engine::store::StoreError;
use crate::engine::transaction::{IntentRecord, RequestId};

/// Top-level error type for batch processing.
#[derive(Debug, thiserror::Error)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Intent error: {0}")]
    Intent(#[from] IntentError),
    #[error("Account store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors during `IntentRecord` -> `Intent` conversion (hard errors).
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    #[error("Invalid intent: {0}")]
    InvalidIntent(IntentRecord),
}

/// Outcome of a rejected ledger operation.
///
/// Everything except [`LedgerError::CompensationFailure`] is an ordinary
/// result for the caller; balances are left as they were.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("Invalid amount {amount}: must be greater than zero and in whole minor units")]
    InvalidAmount { amount: Money },

    #[error("Amount {requested} settles to zero in {currency}")]
    SettlesToZero { requested: Money, currency: Currency },

    #[error("Arithmetic overflow while settling {amount}")]
    AmountOverflow { amount: Money },

    #[error("Transfer source and destination are both {account}")]
    SameAccount { account: AccountNumber },

    #[error("Currency mismatch: expected {expected}, found {found}")]
    CurrencyMismatch { expected: Currency, found: Currency },

    #[error("Rate unavailable: {0}")]
    RateUnavailable(RateError),

    #[error("Insufficient funds: account {account} has {available}, requested {requested}")]
    InsufficientFunds {
        account: AccountNumber,
        available: Money,
        requested: Money,
    },

    #[error("Account {account} not found")]
    AccountNotFound { account: AccountNumber },

    #[error("Persistence error on account {account}: {reason}")]
    Persistence {
        account: AccountNumber,
        reason: String,
    },

    #[error("Request {request_id} was already submitted for a different intent or is still in flight")]
    DuplicateRequest { request_id: RequestId },

    #[error("Request {request_id} was cancelled before validation")]
    Cancelled { request_id: RequestId },

    #[error(
        "Compensation failed: {amount} could not be re-credited to {account} ({reason}); manual reconciliation required"
    )]
    CompensationFailure {
        account: AccountNumber,
        amount: Money,
        reason: String,
    },
}

impl LedgerError {
    /// Needs an operator; the ledger cannot restore consistency on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::CompensationFailure { .. })
    }

    /// Whether the failure left a FAILED record in history. Those outcomes are
    /// final for their request id; the others may be retried under the same id.
    pub fn is_recorded(&self) -> bool {
        matches!(
            self,
            LedgerError::CurrencyMismatch { .. }
                | LedgerError::SettlesToZero { .. }
                | LedgerError::AmountOverflow { .. }
                | LedgerError::RateUnavailable(_)
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::Persistence { .. }
                | LedgerError::CompensationFailure { .. }
        )
    }
}

impl From<MoneyError> for LedgerError {
    fn from(err: MoneyError) -> Self {
        match err {
            MoneyError::CurrencyMismatch { expected, found } => {
                LedgerError::CurrencyMismatch { expected, found }
            }
            MoneyError::Overflow { amount } => LedgerError::AmountOverflow { amount },
        }
    }
}

impl From<RateError> for LedgerError {
    fn from(err: RateError) -> Self {
        LedgerError::RateUnavailable(err)
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(account) => LedgerError::AccountNotFound { account },
            StoreError::DoubleLock(account) => LedgerError::SameAccount { account },
            StoreError::AlreadyExists(account) => LedgerError::Persistence {
                reason: format!("account {account} already exists"),
                account,
            },
            StoreError::InvalidBalance { account, balance } => LedgerError::Persistence {
                reason: format!("balance {balance} cannot be stored"),
                account,
            },
            StoreError::Persistence { account, reason } => {
                LedgerError::Persistence { account, reason }
            }
        }
    }
}
