use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::account::AccountNumber;
use super::transaction::{
    RequestId, TransactionId, TransactionKind, TransactionRecord, TransactionStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Filter for [`TransactionHistory::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    account: Option<AccountNumber>,
    from: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    kinds: Vec<TransactionKind>,
    status: Option<TransactionStatus>,
    order: SortOrder,
    limit: Option<usize>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(mut self, account_number: impl Into<AccountNumber>) -> Self {
        self.account = Some(account_number.into());
        self
    }

    /// Records with `from <= timestamp`.
    pub fn from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    /// Records with `timestamp < until`.
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Adds a kind to match; several calls match any of them.
    pub fn kind(mut self, kind: TransactionKind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &TransactionRecord) -> bool {
        self.account
            .as_ref()
            .is_none_or(|account| &record.account_number == account)
            && self.from.is_none_or(|from| record.timestamp >= from)
            && self.until.is_none_or(|until| record.timestamp < until)
            && (self.kinds.is_empty() || self.kinds.contains(&record.kind))
            && self.status.is_none_or(|status| record.status == status)
    }
}

#[derive(Debug, Default)]
struct Log {
    records: Vec<TransactionRecord>,
    by_account: HashMap<AccountNumber, Vec<usize>>,
}

impl Log {
    fn push(&mut self, record: TransactionRecord) {
        debug_assert!(
            record.status.is_terminal(),
            "only terminal records belong in history, got {}",
            record.status
        );
        let position = self.records.len();
        self.by_account
            .entry(record.account_number.clone())
            .or_default()
            .push(position);
        self.records.push(record);
    }
}

/// Append-only log of terminal transaction records.
///
/// Records are never updated or removed; readers get clones.
#[derive(Debug, Default)]
pub struct TransactionHistory {
    log: RwLock<Log>,
}

impl TransactionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: TransactionRecord) -> TransactionId {
        let id = record.id;
        log::trace!(
            "[history] {} {} {} on {}",
            record.kind,
            record.status,
            record.settled_amount,
            record.account_number
        );
        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        id
    }

    /// Appends several records so that readers see all of them or none.
    pub fn append_all(&self, records: impl IntoIterator<Item = TransactionRecord>) {
        let mut log = self.log.write().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            log.push(record);
        }
    }

    pub fn query(&self, query: &HistoryQuery) -> Vec<TransactionRecord> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);

        let mut records: Vec<TransactionRecord> = match &query.account {
            Some(account) => log
                .by_account
                .get(account)
                .into_iter()
                .flatten()
                .map(|&position| &log.records[position])
                .filter(|record| query.matches(record))
                .cloned()
                .collect(),
            None => log
                .records
                .iter()
                .filter(|record| query.matches(record))
                .cloned()
                .collect(),
        };
        drop(log);

        // Stable: records with equal timestamps keep append order.
        records.sort_by_key(|record| record.timestamp);
        if query.order == SortOrder::Descending {
            records.reverse();
        }
        if let Some(limit) = query.limit {
            records.truncate(limit);
        }
        records
    }

    pub fn get(&self, id: TransactionId) -> Option<TransactionRecord> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        log.records.iter().find(|record| record.id == id).cloned()
    }

    /// All legs of one transfer, including a reversal if there was one.
    pub fn by_correlation(&self, correlation_id: Uuid) -> Vec<TransactionRecord> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        log.records
            .iter()
            .filter(|record| record.correlation_id == Some(correlation_id))
            .cloned()
            .collect()
    }

    pub fn by_request(&self, request_id: &RequestId) -> Vec<TransactionRecord> {
        let log = self.log.read().unwrap_or_else(PoisonError::into_inner);
        log.records
            .iter()
            .filter(|record| &record.request_id == request_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
