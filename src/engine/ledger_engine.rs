use std::cmp::Ordering;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use super::account::{Account, AccountNumber};
use super::config::LedgerConfig;
use super::conversion::{Conversion, ConversionRate, ConversionService, RateProvider};
use super::error::LedgerError;
use super::history::TransactionHistory;
use super::money::{Currency, Money};
use super::store::{AccountStore, InMemoryAccountStore};
use super::transaction::{
    CounterpartyLeg, Deposit, Intent, Phase, Receipt, Request, RequestId, Transfer,
    TransactionKind, TransactionRecord, TransactionStatus, Withdrawal,
};
use super::Decimal;

/// Raised when a transfer's compensating re-credit failed. The source account
/// stays debited until an operator reconciles it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationAlert {
    pub request_id: RequestId,
    pub correlation_id: Uuid,
    pub account_number: AccountNumber,
    pub amount: Money,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

/// An in-flight entry in the idempotency table.
///
/// Dropped without [`InFlightClaim::settle`] (unrecorded outcome or unwinding)
/// it frees the request id again.
struct InFlightClaim<'a> {
    requests: &'a DashMap<RequestId, RequestState>,
    request_id: &'a RequestId,
    settled: bool,
}

impl InFlightClaim<'_> {
    fn settle(mut self, intent: Intent, outcome: Result<Receipt, LedgerError>) {
        self.requests
            .insert(self.request_id.clone(), RequestState::Done { intent, outcome });
        self.settled = true;
    }
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.requests.remove_if(self.request_id, |_, state| {
                matches!(state, RequestState::InFlight { .. })
            });
        }
    }
}

#[derive(Debug)]
enum RequestState {
    InFlight { intent: Intent },
    Done {
        intent: Intent,
        outcome: Result<Receipt, LedgerError>,
    },
}

/// The ledger core.
///
/// Settles deposits, withdrawals and transfers against an [`AccountStore`],
/// converting through the [`ConversionService`] and recording every terminal
/// outcome in the [`TransactionHistory`]. All methods take `&self`; share the
/// engine between threads by reference or behind an `Arc`.
#[derive(Debug)]
pub struct LedgerEngine<S: AccountStore = InMemoryAccountStore> {
    /// Account balances, one lock per account
    store: S,
    /// Rate lookups and conversion math
    rates: ConversionService,
    /// Append-only record of terminal outcomes
    history: TransactionHistory,
    config: LedgerConfig,
    /// Idempotency table keyed by caller supplied request id
    requests: DashMap<RequestId, RequestState>,
    alerts: Mutex<Vec<ReconciliationAlert>>,
}

impl LedgerEngine<InMemoryAccountStore> {
    /// Engine over a fresh in-memory account store.
    pub fn in_memory(provider: impl RateProvider + 'static, config: LedgerConfig) -> Self {
        Self::new(InMemoryAccountStore::new(), provider, config)
    }
}

impl<S: AccountStore> LedgerEngine<S> {
    pub fn new(store: S, provider: impl RateProvider + 'static, config: LedgerConfig) -> Self {
        log::trace!(
            "LedgerEngine initialized (rate TTL {}s, fees {:?})",
            config.rate_ttl.num_seconds(),
            config.fee_policy
        );
        Self {
            store,
            rates: ConversionService::new(provider, config.rate_ttl),
            history: TransactionHistory::new(),
            config,
            requests: DashMap::new(),
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn history(&self) -> &TransactionHistory {
        &self.history
    }

    pub fn rates(&self) -> &ConversionService {
        &self.rates
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Current balance of an account, `None` if it does not exist.
    pub fn balance(&self, account_number: &str) -> Option<Money> {
        self.store
            .account(account_number)
            .map(|account| account.balance_money())
    }

    /// `Pending` while a request executes, its terminal status afterwards.
    /// Requests that never reached a recorded outcome are unknown.
    pub fn status_of(&self, request_id: &RequestId) -> Option<TransactionStatus> {
        self.requests.get(request_id).map(|state| match &*state {
            RequestState::InFlight { .. } => TransactionStatus::Pending,
            RequestState::Done { outcome: Ok(_), .. } => TransactionStatus::Completed,
            RequestState::Done { outcome: Err(_), .. } => TransactionStatus::Failed,
        })
    }

    pub fn reconciliation_alerts(&self) -> Vec<ReconciliationAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn deposit(
        &self,
        request_id: impl Into<RequestId>,
        account_number: &str,
        amount: Money,
    ) -> Result<Receipt, LedgerError> {
        self.submit(Request::new(
            request_id,
            Intent::Deposit(Deposit::new(account_number, amount)),
        ))
    }

    pub fn withdraw(
        &self,
        request_id: impl Into<RequestId>,
        account_number: &str,
        amount: Money,
    ) -> Result<Receipt, LedgerError> {
        self.submit(Request::new(
            request_id,
            Intent::Withdrawal(Withdrawal::new(account_number, amount)),
        ))
    }

    pub fn transfer(
        &self,
        request_id: impl Into<RequestId>,
        source: &str,
        destination: &str,
        amount: Money,
    ) -> Result<Receipt, LedgerError> {
        self.submit(Request::new(
            request_id,
            Intent::Transfer(Transfer::new(source, destination, amount)),
        ))
    }

    /// Primary API: executes a request at most once per request id.
    ///
    /// Resubmitting an id whose earlier outcome was recorded returns that
    /// outcome again without touching any balance.
    pub fn submit(&self, request: Request) -> Result<Receipt, LedgerError> {
        match self.requests.entry(request.request_id.clone()) {
            Entry::Occupied(entry) => return Self::replay(entry.get(), &request),
            Entry::Vacant(entry) => {
                entry.insert(RequestState::InFlight {
                    intent: request.intent.clone(),
                });
            }
        }

        let claim = InFlightClaim {
            requests: &self.requests,
            request_id: &request.request_id,
            settled: false,
        };
        let outcome = self.execute(&request);

        let recorded = match &outcome {
            Ok(_) => true,
            Err(err) => err.is_recorded(),
        };
        if recorded {
            claim.settle(request.intent, outcome.clone());
        }
        // Otherwise nothing happened and dropping the claim lets the caller
        // fix the intent and retry.
        outcome
    }

    fn replay(state: &RequestState, request: &Request) -> Result<Receipt, LedgerError> {
        match state {
            RequestState::Done { intent, outcome } if *intent == request.intent => {
                log::debug!("[{}] Replaying recorded outcome", request.request_id);
                outcome.clone()
            }
            _ => {
                log::warn!(
                    "[{}] Duplicate request rejected: {}",
                    request.request_id,
                    request.intent
                );
                Err(LedgerError::DuplicateRequest {
                    request_id: request.request_id.clone(),
                })
            }
        }
    }

    fn execute(&self, request: &Request) -> Result<Receipt, LedgerError> {
        log::trace!("[{}] Processing: {}", request.request_id, request.intent);
        match &request.intent {
            Intent::Deposit(deposit) => self.handle_deposit(request, deposit),
            Intent::Withdrawal(withdrawal) => self.handle_withdrawal(request, withdrawal),
            Intent::Transfer(transfer) => self.handle_transfer(request, transfer),
        }
    }
}

// =============================================================================
// Operation Handlers
// =============================================================================

impl<S: AccountStore> LedgerEngine<S> {
    fn handle_deposit(&self, request: &Request, deposit: &Deposit) -> Result<Receipt, LedgerError> {
        let mut progress = Progress::new(request);
        let amount = deposit.amount();
        let account_number = deposit.account_number();
        ensure_valid_amount(amount)?;
        progress.ensure_not_cancelled()?;
        let home = self.home_currency(account_number)?;

        progress.advance(Phase::Converting);
        let draft = Draft::new(
            &request.request_id,
            account_number,
            TransactionKind::Deposit,
            amount,
            home,
        );
        let rate = match self.prefetch_rate(amount.currency(), home) {
            Ok(rate) => rate,
            Err(err) => return Err(self.reject(&mut progress, draft, err)),
        };
        progress.ensure_not_cancelled()?;

        self.store.with_account_lock(account_number, |account| {
            progress.advance(Phase::Validated);
            let conversion = match self.credit(account, amount, rate) {
                Ok(conversion) => conversion,
                Err(err) => return Err(self.reject(&mut progress, draft, err)),
            };
            let transaction_id = self.history.append(draft.settled(&conversion).completed());
            progress.advance(Phase::Settled);

            log::trace!(
                "[deposit] account={} amount={} settled={} -> new_balance={}",
                account_number,
                amount,
                conversion.converted,
                account.balance_money()
            );
            Ok(Receipt {
                request_id: request.request_id.clone(),
                transaction_id,
                correlation_id: None,
                kind: TransactionKind::Deposit,
                account_number: account_number.to_string(),
                settled: conversion.converted,
                new_balance: account.balance_money(),
                is_converted: conversion.is_converted(),
                conversion_rate: conversion.rate,
                fee: None,
                counterparty: None,
            })
        })?
    }

    fn handle_withdrawal(
        &self,
        request: &Request,
        withdrawal: &Withdrawal,
    ) -> Result<Receipt, LedgerError> {
        let mut progress = Progress::new(request);
        let amount = withdrawal.amount();
        let account_number = withdrawal.account_number();
        ensure_valid_amount(amount)?;
        progress.ensure_not_cancelled()?;
        let home = self.home_currency(account_number)?;

        progress.advance(Phase::Converting);
        let draft = Draft::new(
            &request.request_id,
            account_number,
            TransactionKind::Withdrawal,
            amount,
            home,
        );
        let rate = match self.prefetch_rate(amount.currency(), home) {
            Ok(rate) => rate,
            Err(err) => return Err(self.reject(&mut progress, draft, err)),
        };
        progress.ensure_not_cancelled()?;

        self.store.with_account_lock(account_number, |account| {
            progress.advance(Phase::Validated);
            let conversion = match self.debit(account, amount, rate) {
                Ok(conversion) => conversion,
                Err(err) => return Err(self.reject(&mut progress, draft, err)),
            };
            let transaction_id = self.history.append(draft.settled(&conversion).completed());
            progress.advance(Phase::Settled);

            log::trace!(
                "[withdrawal] account={} amount={} debited={} -> new_balance={}",
                account_number,
                amount,
                conversion.converted,
                account.balance_money()
            );
            Ok(Receipt {
                request_id: request.request_id.clone(),
                transaction_id,
                correlation_id: None,
                kind: TransactionKind::Withdrawal,
                account_number: account_number.to_string(),
                settled: conversion.converted,
                new_balance: account.balance_money(),
                is_converted: conversion.is_converted(),
                conversion_rate: conversion.rate,
                fee: None,
                counterparty: None,
            })
        })?
    }

    fn handle_transfer(&self, request: &Request, transfer: &Transfer) -> Result<Receipt, LedgerError> {
        let mut progress = Progress::new(request);
        let amount = transfer.amount();
        let source = transfer.source();
        let destination = transfer.destination();
        ensure_valid_amount(amount)?;
        if source == destination {
            return Err(LedgerError::SameAccount {
                account: source.to_string(),
            });
        }
        progress.ensure_not_cancelled()?;
        let source_currency = self.home_currency(source)?;
        let destination_currency = self.home_currency(destination)?;

        progress.advance(Phase::Converting);
        let out_draft = Draft::new(
            &request.request_id,
            source,
            TransactionKind::TransferOut,
            amount,
            source_currency,
        )
        .counterparty(destination);
        let rates = self
            .prefetch_rate(amount.currency(), source_currency)
            .and_then(|debit| Ok((debit, self.prefetch_rate(amount.currency(), destination_currency)?)));
        let (debit_rate, credit_rate) = match rates {
            Ok(rates) => rates,
            Err(err) => return Err(self.reject(&mut progress, out_draft, err)),
        };
        progress.ensure_not_cancelled()?;

        self.store.with_account_locks(source, destination, |src, dst| {
            progress.advance(Phase::Validated);
            let plan = match self.plan_transfer(src, dst, amount, debit_rate, credit_rate) {
                Ok(plan) => plan,
                Err(err) => return Err(self.reject(&mut progress, out_draft, err)),
            };
            let correlation_id = Uuid::now_v7();
            let out_draft = out_draft
                .settled(&plan.debit)
                .fee(plan.fee)
                .correlated(correlation_id);

            if let Err(err) = self.store.commit(src, plan.source_after.amount()) {
                return Err(self.reject(&mut progress, out_draft, err.into()));
            }
            if let Err(err) = self.store.commit(dst, plan.destination_after.amount()) {
                return Err(self.compensate(&mut progress, src, &plan, out_draft, err.into()));
            }

            let in_draft = Draft::new(
                &request.request_id,
                destination,
                TransactionKind::TransferIn,
                amount,
                dst.currency(),
            )
            .settled(&plan.credit)
            .counterparty(source)
            .correlated(correlation_id);
            let out_record = out_draft.completed();
            let in_record = in_draft.completed();
            let (out_id, in_id) = (out_record.id, in_record.id);
            self.history.append_all([out_record, in_record]);
            progress.advance(Phase::Settled);

            log::trace!(
                "[transfer] {} -> {} amount={} debit={} fee={:?} credit={}",
                source,
                destination,
                amount,
                plan.total_debit,
                plan.fee,
                plan.credit.converted
            );
            Ok(Receipt {
                request_id: request.request_id.clone(),
                transaction_id: out_id,
                correlation_id: Some(correlation_id),
                kind: TransactionKind::TransferOut,
                account_number: source.to_string(),
                settled: plan.debit.converted,
                new_balance: src.balance_money(),
                is_converted: plan.debit.is_converted() || plan.credit.is_converted(),
                conversion_rate: plan.debit.rate,
                fee: plan.fee,
                counterparty: Some(CounterpartyLeg {
                    account_number: destination.to_string(),
                    transaction_id: in_id,
                    credited: plan.credit.converted,
                    new_balance: dst.balance_money(),
                    conversion_rate: plan.credit.rate,
                }),
            })
        })?
    }

    /// Undoes the source debit of a transfer whose destination commit failed.
    fn compensate(
        &self,
        progress: &mut Progress<'_>,
        src: &mut Account,
        plan: &TransferPlan,
        out_draft: Draft,
        cause: LedgerError,
    ) -> LedgerError {
        let correlation_id = out_draft.correlation_id.unwrap_or_else(Uuid::now_v7);
        log::warn!(
            "[{}] Destination commit failed after source debit, reversing {} on {}: {cause}",
            out_draft.request_id,
            plan.total_debit,
            src.account_number()
        );

        match self.store.commit(src, plan.source_before.amount()) {
            Ok(()) => {
                let reversal = Draft::new(
                    &out_draft.request_id,
                    src.account_number(),
                    TransactionKind::Reversal,
                    plan.total_debit,
                    src.currency(),
                )
                .settled(&Conversion::identity(plan.total_debit))
                .counterparty(out_draft.counterparty.as_deref().unwrap_or_default())
                .correlated(correlation_id)
                .completed();
                self.history.append_all([out_draft.failed(&cause), reversal]);
                progress.advance(Phase::Rejected);
                cause
            }
            Err(err) => {
                let fatal = LedgerError::CompensationFailure {
                    account: src.account_number().to_string(),
                    amount: plan.total_debit,
                    reason: format!("{cause}; re-credit failed: {err}"),
                };
                log::error!("[{}] RECONCILIATION REQUIRED: {fatal}", out_draft.request_id);
                self.alerts
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(ReconciliationAlert {
                        request_id: out_draft.request_id.clone(),
                        correlation_id,
                        account_number: src.account_number().to_string(),
                        amount: plan.total_debit,
                        reason: fatal.to_string(),
                        raised_at: Utc::now(),
                    });
                self.history.append(out_draft.failed(&fatal));
                progress.advance(Phase::Rejected);
                fatal
            }
        }
    }

    fn reject(&self, progress: &mut Progress<'_>, draft: Draft, err: LedgerError) -> LedgerError {
        log::debug!(
            "[{}] {} on {} rejected: {err}",
            draft.request_id,
            draft.kind,
            draft.account_number
        );
        self.history.append(draft.failed(&err));
        progress.advance(Phase::Rejected);
        err
    }
}

// =============================================================================
// Balance Math (runs under the account lock)
// =============================================================================

struct TransferPlan {
    debit: Conversion,
    fee: Option<Money>,
    total_debit: Money,
    credit: Conversion,
    source_before: Money,
    source_after: Money,
    destination_after: Money,
}

impl<S: AccountStore> LedgerEngine<S> {
    fn credit(
        &self,
        account: &mut Account,
        amount: Money,
        rate: Option<ConversionRate>,
    ) -> Result<Conversion, LedgerError> {
        let conversion = self.settle_conversion(amount, rate, account.currency())?;
        let new_balance = account.balance_money().checked_add(&conversion.converted)?;
        self.store.commit(account, new_balance.amount())?;
        Ok(conversion)
    }

    fn debit(
        &self,
        account: &mut Account,
        amount: Money,
        rate: Option<ConversionRate>,
    ) -> Result<Conversion, LedgerError> {
        let conversion = self.settle_conversion(amount, rate, account.currency())?;
        let balance = account.balance_money();
        if conversion.converted.try_cmp(&balance)? == Ordering::Greater {
            return Err(LedgerError::InsufficientFunds {
                account: account.account_number().to_string(),
                available: balance,
                requested: conversion.converted,
            });
        }
        let new_balance = balance.checked_sub(&conversion.converted)?;
        self.store.commit(account, new_balance.amount())?;
        Ok(conversion)
    }

    fn plan_transfer(
        &self,
        src: &Account,
        dst: &Account,
        amount: Money,
        debit_rate: Option<ConversionRate>,
        credit_rate: Option<ConversionRate>,
    ) -> Result<TransferPlan, LedgerError> {
        let debit = self.settle_conversion(amount, debit_rate, src.currency())?;
        let fee = self.config.fee_policy.fee_for(debit.converted)?;
        let total_debit = match fee {
            Some(fee) => debit.converted.checked_add(&fee)?,
            None => debit.converted,
        };

        let source_before = src.balance_money();
        if total_debit.try_cmp(&source_before)? == Ordering::Greater {
            return Err(LedgerError::InsufficientFunds {
                account: src.account_number().to_string(),
                available: source_before,
                requested: total_debit,
            });
        }

        let credit = self.settle_conversion(amount, credit_rate, dst.currency())?;
        Ok(TransferPlan {
            source_after: source_before.checked_sub(&total_debit)?,
            destination_after: dst.balance_money().checked_add(&credit.converted)?,
            debit,
            fee,
            total_debit,
            credit,
            source_before,
        })
    }

    /// Final conversion for balance math.
    ///
    /// Uses the rate fetched before the lock while it is within the TTL and
    /// refetches it otherwise, so the amount committed never rests on an
    /// expired rate. A converted amount that rounds to nothing is refused.
    fn settle_conversion(
        &self,
        amount: Money,
        rate: Option<ConversionRate>,
        target: Currency,
    ) -> Result<Conversion, LedgerError> {
        match rate {
            None if amount.currency() == target => Ok(Conversion::identity(amount)),
            None => Err(LedgerError::CurrencyMismatch {
                expected: target,
                found: amount.currency(),
            }),
            Some(rate) => {
                let rate = self.rates.ensure_fresh(rate)?;
                let conversion = Conversion::at_rate(amount, &rate)?;
                if !conversion.converted.is_positive() {
                    return Err(LedgerError::SettlesToZero {
                        requested: amount,
                        currency: target,
                    });
                }
                Ok(conversion)
            }
        }
    }

    /// Looks the rate up ahead of the critical section. `None` means no
    /// conversion is needed.
    fn prefetch_rate(
        &self,
        from: Currency,
        to: Currency,
    ) -> Result<Option<ConversionRate>, LedgerError> {
        if from == to {
            return Ok(None);
        }
        Ok(Some(self.rates.get_rate(from, to)?))
    }

    fn home_currency(&self, account_number: &str) -> Result<Currency, LedgerError> {
        self.store
            .account(account_number)
            .map(|account| account.currency())
            .ok_or_else(|| LedgerError::AccountNotFound {
                account: account_number.to_string(),
            })
    }
}

/// Intent amounts are positive and no finer than their currency's minor unit.
fn ensure_valid_amount(amount: Money) -> Result<(), LedgerError> {
    if amount.is_positive() && amount.fits_minor_units() {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount { amount })
    }
}

// =============================================================================
// Bookkeeping helpers
// =============================================================================

/// Tracks the lifecycle phase of one request.
struct Progress<'r> {
    request: &'r Request,
    phase: Phase,
}

impl<'r> Progress<'r> {
    fn new(request: &'r Request) -> Self {
        Self {
            request,
            phase: Phase::Initiated,
        }
    }

    fn advance(&mut self, next: Phase) {
        debug_assert!(
            !self.phase.is_terminal(),
            "{} is terminal, cannot move to {next}",
            self.phase
        );
        log::trace!("[{}] {} -> {next}", self.request.request_id, self.phase);
        self.phase = next;
    }

    fn ensure_not_cancelled(&self) -> Result<(), LedgerError> {
        if self.phase.accepts_cancellation() && self.request.is_cancelled() {
            log::debug!(
                "[{}] Cancelled in {} phase",
                self.request.request_id,
                self.phase
            );
            return Err(LedgerError::Cancelled {
                request_id: self.request.request_id.clone(),
            });
        }
        Ok(())
    }
}

/// A history record under construction.
#[derive(Debug, Clone)]
struct Draft {
    request_id: RequestId,
    account_number: AccountNumber,
    kind: TransactionKind,
    requested: Money,
    settled: Money,
    conversion_rate: Option<Decimal>,
    fee: Option<Money>,
    counterparty: Option<AccountNumber>,
    correlation_id: Option<Uuid>,
}

impl Draft {
    /// Nothing settled yet: the settled amount is zero in the account currency.
    fn new(
        request_id: &RequestId,
        account_number: &str,
        kind: TransactionKind,
        requested: Money,
        home: Currency,
    ) -> Self {
        Self {
            request_id: request_id.clone(),
            account_number: account_number.to_string(),
            kind,
            requested,
            settled: Money::zero(home),
            conversion_rate: None,
            fee: None,
            counterparty: None,
            correlation_id: None,
        }
    }

    fn settled(mut self, conversion: &Conversion) -> Self {
        self.settled = conversion.converted;
        self.conversion_rate = conversion.rate;
        self
    }

    fn fee(mut self, fee: Option<Money>) -> Self {
        self.fee = fee;
        self
    }

    fn counterparty(mut self, account_number: &str) -> Self {
        self.counterparty = Some(account_number.to_string());
        self
    }

    fn correlated(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    fn completed(self) -> TransactionRecord {
        self.finish(TransactionStatus::Completed, None)
    }

    fn failed(self, reason: &LedgerError) -> TransactionRecord {
        self.finish(TransactionStatus::Failed, Some(reason.to_string()))
    }

    fn finish(self, status: TransactionStatus, failure_reason: Option<String>) -> TransactionRecord {
        TransactionRecord {
            id: Uuid::now_v7(),
            request_id: self.request_id,
            correlation_id: self.correlation_id,
            account_number: self.account_number,
            kind: self.kind,
            requested_amount: self.requested,
            settled_amount: self.settled,
            is_converted: self.conversion_rate.is_some(),
            conversion_rate: self.conversion_rate,
            fee: self.fee,
            status,
            timestamp: Utc::now(),
            counterparty_account: self.counterparty,
            failure_reason,
        }
    }
}
