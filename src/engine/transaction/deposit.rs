use crate::engine::{
    account::AccountNumber,
    error::IntentError,
    money::Money,
    transaction::{IntentRecord, IntentType},
};

/// A deposit intent.
///
/// Credits the account; the amount may be in any currency and is converted
/// into the account's home currency when they differ.
#[derive(Debug, Clone, PartialEq)]
pub struct Deposit {
    account_number: AccountNumber,
    amount: Money,
}

impl Deposit {
    pub fn new(account_number: impl Into<AccountNumber>, amount: Money) -> Self {
        Self {
            account_number: account_number.into(),
            amount,
        }
    }

    pub fn account_number(&self) -> &str {
        &self.account_number
    }

    /// Amount in the source currency
    pub fn amount(&self) -> Money {
        self.amount
    }
}

impl TryFrom<IntentRecord> for Deposit {
    type Error = IntentError;

    fn try_from(record: IntentRecord) -> Result<Self, Self::Error> {
        match record {
            IntentRecord {
                intent_type: IntentType::Deposit,
                account,
                counterparty: None,
                amount: Some(amount),
                currency: Some(currency),
                ..
            } if !account.is_empty() => Ok(Deposit::new(account, Money::new(amount, currency))),
            _ => Err(IntentError::InvalidIntent(record)),
        }
    }
}
