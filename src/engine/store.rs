use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

use super::account::{Account, AccountNumber};
use super::Decimal;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Account {0} not found")]
    NotFound(AccountNumber),

    #[error("Account {0} already exists")]
    AlreadyExists(AccountNumber),

    #[error("Account {account} cannot be opened with balance {balance}")]
    InvalidBalance {
        account: AccountNumber,
        balance: Decimal,
    },

    #[error("Account {0} cannot be locked twice by the same operation")]
    DoubleLock(AccountNumber),

    #[error("Failed to persist account {account}: {reason}")]
    Persistence {
        account: AccountNumber,
        reason: String,
    },
}

/// Owner of all account records.
///
/// Every balance change happens inside one of the `with_account_lock*`
/// scopes: the closure receives the latest committed account state and holds
/// that account's exclusive lock until it returns, whatever path it returns by.
/// [`AccountStore::commit`] takes the locked account, so it can only be called
/// from inside such a scope.
pub trait AccountStore: Send + Sync {
    /// Registers a freshly opened account.
    fn open_account(&self, account: Account) -> Result<(), StoreError>;

    /// Read-only snapshot, used for existence and currency lookups.
    fn account(&self, account_number: &str) -> Option<Account>;

    /// Snapshot of every account, ordered by account number.
    fn accounts(&self) -> Vec<Account>;

    fn with_account_lock<T, F>(&self, account_number: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Account) -> T;

    /// Locks two distinct accounts, always in ascending account number order,
    /// and passes them to `f` in argument order.
    fn with_account_locks<T, F>(&self, first: &str, second: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Account, &mut Account) -> T;

    /// Durably stores `new_balance` for a locked account.
    fn commit(&self, account: &mut Account, new_balance: Decimal) -> Result<(), StoreError>;
}

type Slot = Arc<Mutex<Account>>;

/// Account store backed by process memory, one mutex per account.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<AccountNumber, Slot>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    fn slot(&self, account_number: &str) -> Result<Slot, StoreError> {
        self.accounts
            .get(account_number)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or_else(|| StoreError::NotFound(account_number.to_string()))
    }
}

// A panic inside a locked scope cannot leave a half written balance behind,
// so a poisoned lock still guards a consistent account.
fn lock(slot: &Slot) -> MutexGuard<'_, Account> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opening balances are non-negative and in whole minor units of the account
/// currency.
pub fn ensure_opening_balance(account: &Account) -> Result<(), StoreError> {
    let balance = account.balance_money();
    if balance.amount() < Decimal::ZERO || !balance.fits_minor_units() {
        return Err(StoreError::InvalidBalance {
            account: account.account_number().to_string(),
            balance: balance.amount(),
        });
    }
    Ok(())
}

impl AccountStore for InMemoryAccountStore {
    fn open_account(&self, account: Account) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;

        ensure_opening_balance(&account)?;
        match self.accounts.entry(account.account_number().to_string()) {
            Entry::Occupied(entry) => Err(StoreError::AlreadyExists(entry.key().clone())),
            Entry::Vacant(entry) => {
                log::debug!(
                    "[store] opened account {} ({}, {})",
                    account.account_number(),
                    account.currency(),
                    account.account_type()
                );
                entry.insert(Arc::new(Mutex::new(account)));
                Ok(())
            }
        }
    }

    fn account(&self, account_number: &str) -> Option<Account> {
        let slot = self.slot(account_number).ok()?;
        let account = lock(&slot).clone();
        Some(account)
    }

    fn accounts(&self) -> Vec<Account> {
        let slots: Vec<Slot> = self
            .accounts
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut accounts: Vec<Account> = slots.iter().map(|slot| lock(slot).clone()).collect();
        accounts.sort_by(|a, b| a.account_number().cmp(b.account_number()));
        accounts
    }

    fn with_account_lock<T, F>(&self, account_number: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Account) -> T,
    {
        let slot = self.slot(account_number)?;
        let mut guard = lock(&slot);
        Ok(f(&mut *guard))
    }

    fn with_account_locks<T, F>(&self, first: &str, second: &str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Account, &mut Account) -> T,
    {
        if first == second {
            return Err(StoreError::DoubleLock(first.to_string()));
        }
        let first_slot = self.slot(first)?;
        let second_slot = self.slot(second)?;

        let (mut first_guard, mut second_guard) = if first < second {
            let a = lock(&first_slot);
            let b = lock(&second_slot);
            (a, b)
        } else {
            let b = lock(&second_slot);
            let a = lock(&first_slot);
            (a, b)
        };
        Ok(f(&mut *first_guard, &mut *second_guard))
    }

    fn commit(&self, account: &mut Account, new_balance: Decimal) -> Result<(), StoreError> {
        if new_balance < Decimal::ZERO {
            return Err(StoreError::Persistence {
                account: account.account_number().to_string(),
                reason: format!("refusing to store negative balance {new_balance}"),
            });
        }
        account.set_balance(new_balance);
        Ok(())
    }
}
