mod deposit;
mod transfer;
mod withdrawal;

pub use deposit::Deposit;
pub use transfer::Transfer;
pub use withdrawal::Withdrawal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::AccountNumber;
use super::money::{Currency, Money};
use super::Decimal;

pub type TransactionId = Uuid;

/// Caller supplied idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh id for callers that do not bring their own.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw intent as parsed from CSV input.
/// This is the unvalidated form that needs conversion to a specific intent type.
#[derive(Debug, Deserialize, Clone)]
pub struct IntentRecord {
    pub request: String,
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    pub account: String,
    /// Destination account, required for transfers only
    pub counterparty: Option<String>,
    pub amount: Option<Decimal>,
    pub currency: Option<Currency>,
}

impl std::fmt::Display for IntentRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (request: {}, account: {}",
            self.intent_type, self.request, self.account
        )?;
        if let Some(counterparty) = &self.counterparty {
            write!(f, ", counterparty: {counterparty}")?;
        }
        match (self.amount, self.currency) {
            (Some(amount), Some(currency)) => write!(f, ", amount: {amount} {currency})"),
            (Some(amount), None) => write!(f, ", amount: {amount})"),
            _ => write!(f, ")"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntentType {
    Deposit,
    Withdrawal,
    Transfer,
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntentType::Deposit => write!(f, "deposit"),
            IntentType::Withdrawal => write!(f, "withdrawal"),
            IntentType::Transfer => write!(f, "transfer"),
        }
    }
}

/// A validated intent ready for the ledger engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Deposit(Deposit),
    Withdrawal(Withdrawal),
    Transfer(Transfer),
}

impl Intent {
    /// The account whose lock is taken first in the caller's view.
    pub fn account_number(&self) -> &str {
        match self {
            Intent::Deposit(d) => d.account_number(),
            Intent::Withdrawal(w) => w.account_number(),
            Intent::Transfer(t) => t.source(),
        }
    }

    pub fn amount(&self) -> Money {
        match self {
            Intent::Deposit(d) => d.amount(),
            Intent::Withdrawal(w) => w.amount(),
            Intent::Transfer(t) => t.amount(),
        }
    }

    /// Kind of the record written to [`Intent::account_number`].
    pub fn kind(&self) -> TransactionKind {
        match self {
            Intent::Deposit(_) => TransactionKind::Deposit,
            Intent::Withdrawal(_) => TransactionKind::Withdrawal,
            Intent::Transfer(_) => TransactionKind::TransferOut,
        }
    }
}

impl TryFrom<IntentRecord> for Intent {
    type Error = crate::engine::error::IntentError;

    fn try_from(record: IntentRecord) -> Result<Self, Self::Error> {
        match record.intent_type {
            IntentType::Deposit => Ok(Intent::Deposit(Deposit::try_from(record)?)),
            IntentType::Withdrawal => Ok(Intent::Withdrawal(Withdrawal::try_from(record)?)),
            IntentType::Transfer => Ok(Intent::Transfer(Transfer::try_from(record)?)),
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Deposit(d) => {
                write!(f, "[deposit] account={} amount={}", d.account_number(), d.amount())
            }
            Intent::Withdrawal(w) => write!(
                f,
                "[withdrawal] account={} amount={}",
                w.account_number(),
                w.amount()
            ),
            Intent::Transfer(t) => write!(
                f,
                "[transfer] source={} destination={} amount={}",
                t.source(),
                t.destination(),
                t.amount()
            ),
        }
    }
}

/// Cooperative cancellation flag shared between a caller and the engine.
///
/// Honoured only until the operation is validated; after that the
/// operation always runs to a terminal state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// An intent submitted under an idempotency key.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_id: RequestId,
    pub intent: Intent,
    pub cancel: Option<CancelToken>,
}

impl Request {
    pub fn new(request_id: impl Into<RequestId>, intent: Intent) -> Self {
        Self {
            request_id: request_id.into(),
            intent,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// Lifecycle of a single ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initiated,
    Converting,
    Validated,
    Settled,
    Rejected,
}

impl Phase {
    pub fn accepts_cancellation(self) -> bool {
        matches!(self, Phase::Initiated | Phase::Converting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Settled | Phase::Rejected)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Initiated => write!(f, "INITIATED"),
            Phase::Converting => write!(f, "CONVERTING"),
            Phase::Validated => write!(f, "VALIDATED"),
            Phase::Settled => write!(f, "SETTLED"),
            Phase::Rejected => write!(f, "REJECTED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    TransferOut,
    TransferIn,
    /// Re-credit of a transfer source whose destination could not be credited.
    Reversal,
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::Deposit => write!(f, "DEPOSIT"),
            TransactionKind::Withdrawal => write!(f, "WITHDRAWAL"),
            TransactionKind::TransferOut => write!(f, "TRANSFER_OUT"),
            TransactionKind::TransferIn => write!(f, "TRANSFER_IN"),
            TransactionKind::Reversal => write!(f, "REVERSAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Request accepted and still executing. Never stored in history.
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "PENDING"),
            TransactionStatus::Completed => write!(f, "COMPLETED"),
            TransactionStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Immutable history entry for one settlement attempt on one account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub request_id: RequestId,
    /// Shared by both legs of a transfer and by its reversal
    pub correlation_id: Option<Uuid>,
    pub account_number: AccountNumber,
    pub kind: TransactionKind,
    pub requested_amount: Money,
    pub settled_amount: Money,
    pub is_converted: bool,
    pub conversion_rate: Option<Decimal>,
    pub fee: Option<Money>,
    pub status: TransactionStatus,
    pub timestamp: DateTime<Utc>,
    pub counterparty_account: Option<AccountNumber>,
    pub failure_reason: Option<String>,
}

/// Destination side of a settled transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterpartyLeg {
    pub account_number: AccountNumber,
    pub transaction_id: TransactionId,
    pub credited: Money,
    pub new_balance: Money,
    pub conversion_rate: Option<Decimal>,
}

/// Result envelope shared by every settled operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub request_id: RequestId,
    pub transaction_id: TransactionId,
    pub correlation_id: Option<Uuid>,
    pub kind: TransactionKind,
    pub account_number: AccountNumber,
    /// Amount applied to the account, in its currency, fee excluded
    pub settled: Money,
    pub new_balance: Money,
    pub is_converted: bool,
    pub conversion_rate: Option<Decimal>,
    pub fee: Option<Money>,
    pub counterparty: Option<CounterpartyLeg>,
}
