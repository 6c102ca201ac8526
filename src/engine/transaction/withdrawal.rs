use crate::engine::{
    account::AccountNumber,
    error::IntentError,
    money::Money,
    transaction::{IntentRecord, IntentType},
};

/// A withdrawal intent.
///
/// The requested amount is converted into the account's currency to find the
/// debit; the withdrawal fails if the debit exceeds the balance.
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    account_number: AccountNumber,
    amount: Money,
}

impl Withdrawal {
    pub fn new(account_number: impl Into<AccountNumber>, amount: Money) -> Self {
        Self {
            account_number: account_number.into(),
            amount,
        }
    }

    pub fn account_number(&self) -> &str {
        &self.account_number
    }

    /// Amount in the requested currency
    pub fn amount(&self) -> Money {
        self.amount
    }
}

impl TryFrom<IntentRecord> for Withdrawal {
    type Error = IntentError;

    fn try_from(record: IntentRecord) -> Result<Self, Self::Error> {
        match record {
            IntentRecord {
                intent_type: IntentType::Withdrawal,
                account,
                counterparty: None,
                amount: Some(amount),
                currency: Some(currency),
                ..
            } if !account.is_empty() => Ok(Withdrawal::new(account, Money::new(amount, currency))),
            _ => Err(IntentError::InvalidIntent(record)),
        }
    }
}
