use crate::engine::{
    account::AccountNumber,
    error::IntentError,
    money::Money,
    transaction::{IntentRecord, IntentType},
};

/// A transfer intent between two ledger accounts.
///
/// `amount` may be in any currency: the source is debited its value in the
/// source currency plus the transfer fee, the destination is credited its
/// value in the destination currency.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    source: AccountNumber,
    destination: AccountNumber,
    amount: Money,
}

impl Transfer {
    pub fn new(
        source: impl Into<AccountNumber>,
        destination: impl Into<AccountNumber>,
        amount: Money,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            amount,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn amount(&self) -> Money {
        self.amount
    }
}

impl TryFrom<IntentRecord> for Transfer {
    type Error = IntentError;

    fn try_from(record: IntentRecord) -> Result<Self, Self::Error> {
        match record {
            IntentRecord {
                intent_type: IntentType::Transfer,
                account,
                counterparty: Some(counterparty),
                amount: Some(amount),
                currency: Some(currency),
                ..
            } if !account.is_empty() && !counterparty.is_empty() => Ok(Transfer::new(
                account,
                counterparty,
                Money::new(amount, currency),
            )),
            _ => Err(IntentError::InvalidIntent(record)),
        }
    }
}
