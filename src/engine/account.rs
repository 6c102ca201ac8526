use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::money::{Currency, Money};
use super::Decimal;

pub type AccountNumber = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Checking,
    Savings,
    Business,
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountType::Checking => write!(f, "checking"),
            AccountType::Savings => write!(f, "savings"),
            AccountType::Business => write!(f, "business"),
        }
    }
}

/// A ledger account holding a single balance in its home currency.
///
/// Accounts are opened outside the ledger; the ledger only ever changes the
/// balance, and only through [`AccountStore::commit`](super::store::AccountStore::commit).
#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    account_number: AccountNumber,
    country_code: String,
    currency: Currency,
    balance: Decimal,
    account_type: AccountType,
    created_at: DateTime<Utc>,
}

impl Account {
    /// Opens an account funded with `initial_deposit`.
    pub fn open(
        account_number: impl Into<AccountNumber>,
        country_code: impl Into<String>,
        account_type: AccountType,
        initial_deposit: Money,
    ) -> Self {
        Self {
            account_number: account_number.into(),
            country_code: country_code.into(),
            currency: initial_deposit.currency(),
            balance: initial_deposit.amount(),
            account_type,
            created_at: Utc::now(),
        }
    }

    /// Returns the account number
    pub fn account_number(&self) -> &str {
        &self.account_number
    }

    pub fn country_code(&self) -> &str {
        &self.country_code
    }

    /// Returns the home currency of the account
    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Returns the raw balance in the home currency
    pub fn balance(&self) -> Decimal {
        self.balance
    }

    /// Returns the balance tagged with the home currency
    pub fn balance_money(&self) -> Money {
        Money::new(self.balance, self.currency)
    }

    pub fn account_type(&self) -> AccountType {
        self.account_type
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Overwrites the balance. Stores call this once the new value is durable.
    ///
    /// # Panics (debug only)
    /// Panics if the balance would become negative.
    pub(crate) fn set_balance(&mut self, balance: Decimal) {
        debug_assert!(
            balance >= Decimal::ZERO,
            "Invariant violated: balance of {} would become {}",
            self.account_number,
            balance
        );
        self.balance = balance;
    }
}
