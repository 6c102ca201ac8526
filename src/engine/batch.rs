//! CSV adapters around the ledger engine: seeding accounts and rates,
//! replaying a file of intents and exporting the resulting state.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::{Account, AccountType};
use super::conversion::{ConversionRate, StaticRateProvider};
use super::error::Error;
use super::history::HistoryQuery;
use super::ledger_engine::LedgerEngine;
use super::money::{Currency, Money};
use super::store::AccountStore;
use super::transaction::{
    Intent, IntentRecord, Request, TransactionKind, TransactionRecord, TransactionStatus,
};
use super::Decimal;

/// Counters reported after a batch of intents.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub settled: u64,
    pub rejected: u64,
    /// Rejections that need manual reconciliation
    pub fatal: u64,
}

#[derive(Debug, Deserialize)]
struct AccountRecord {
    account: String,
    country: String,
    #[serde(rename = "type")]
    account_type: AccountType,
    currency: Currency,
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct RateRecord {
    from: Currency,
    to: Currency,
    rate: Decimal,
    /// Defaults to load time when empty
    observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct AccountRow<'a> {
    account: &'a str,
    country: &'a str,
    #[serde(rename = "type")]
    account_type: AccountType,
    currency: Currency,
    balance: String,
}

#[derive(Debug, Serialize)]
struct HistoryRow<'a> {
    id: String,
    request: &'a str,
    correlation: Option<String>,
    account: &'a str,
    kind: TransactionKind,
    status: TransactionStatus,
    requested: String,
    settled: String,
    converted: bool,
    rate: Option<Decimal>,
    fee: Option<String>,
    counterparty: Option<&'a str>,
    timestamp: String,
    reason: Option<&'a str>,
}

impl<'a> From<&'a TransactionRecord> for HistoryRow<'a> {
    fn from(record: &'a TransactionRecord) -> Self {
        Self {
            id: record.id.to_string(),
            request: record.request_id.as_str(),
            correlation: record.correlation_id.map(|id| id.to_string()),
            account: &record.account_number,
            kind: record.kind,
            status: record.status,
            requested: format_money(record.requested_amount),
            settled: format_money(record.settled_amount),
            converted: record.is_converted,
            rate: record.conversion_rate,
            fee: record.fee.map(format_money),
            counterparty: record.counterparty_account.as_deref(),
            timestamp: record.timestamp.to_rfc3339(),
            reason: record.failure_reason.as_deref(),
        }
    }
}

/// Amount padded to the currency's minor units, e.g. `45.00 EUR`.
fn format_money(money: Money) -> String {
    format!(
        "{} {}",
        format_amount(money.amount(), money.currency()),
        money.currency()
    )
}

fn format_amount(amount: Decimal, currency: Currency) -> String {
    let precision = currency.minor_units() as usize;
    format!("{amount:.precision$}")
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All) // trim whitespace from fields
        .from_reader(reader)
}

/// Opens every account listed in `reader` (columns: account, country, type,
/// currency, balance). Returns the number of accounts opened.
pub fn load_accounts<S: AccountStore, R: Read>(store: &S, reader: R) -> Result<usize, Error> {
    let mut opened = 0;
    for result in csv_reader(reader).deserialize() {
        let record: AccountRecord = result?;
        log::trace!(
            "[accounts] {} {} {} {} {}",
            record.account,
            record.country,
            record.account_type,
            record.currency,
            record.balance
        );
        store.open_account(Account::open(
            record.account,
            record.country,
            record.account_type,
            Money::new(record.balance, record.currency),
        ))?;
        opened += 1;
    }
    log::info!("Loaded {opened} accounts");
    Ok(opened)
}

/// Publishes every rate listed in `reader` (columns: from, to, rate and an
/// optional RFC 3339 observed_at). Returns the number of rates loaded.
pub fn load_rates<R: Read>(provider: &StaticRateProvider, reader: R) -> Result<usize, Error> {
    let loaded_at = Utc::now();
    let mut loaded = 0;
    for result in csv_reader(reader).deserialize() {
        let record: RateRecord = result?;
        provider.insert(ConversionRate::new(
            record.from,
            record.to,
            record.rate,
            record.observed_at.unwrap_or(loaded_at),
        ));
        loaded += 1;
    }
    log::info!("Loaded {loaded} conversion rates");
    Ok(loaded)
}

impl<S: AccountStore> LedgerEngine<S> {
    /// Replays intents from any source (File, `TcpStream`, etc.), one request
    /// per row (columns: request, type, account, counterparty, amount,
    /// currency).
    ///
    /// Malformed rows abort the batch. Rejected intents are logged and
    /// counted; they are part of a normal run.
    pub fn process_intents<R: Read>(&self, reader: R) -> Result<BatchSummary, Error> {
        log::info!("Starting intent processing");
        let mut summary = BatchSummary::default();

        for (index, result) in csv_reader(reader).deserialize().enumerate() {
            // Step 1: Parse CSV row into a raw IntentRecord
            let record: IntentRecord = result?;
            let row_num = index + 1;
            log::trace!("[row {row_num}] Parsing: {record}");

            // Step 2: Validate the record into an Intent
            let request_id = record.request.clone();
            let intent = Intent::try_from(record)?;

            // Step 3: Settle it
            match self.submit(Request::new(request_id, intent)) {
                Ok(_) => summary.settled += 1,
                Err(err) if err.is_fatal() => {
                    log::error!("[row {row_num}] - Needs reconciliation: {err}");
                    summary.rejected += 1;
                    summary.fatal += 1;
                }
                Err(err) => {
                    log::warn!("[row {row_num}] - Skipped: {err}");
                    summary.rejected += 1;
                }
            }
        }

        log::info!(
            "Processing complete: {} settled, {} rejected, {} history records",
            summary.settled,
            summary.rejected,
            self.history().len()
        );
        Ok(summary)
    }

    /// Writes every account, ordered by account number, to any sink.
    pub fn export_accounts<W: Write>(&self, writer: W) -> Result<(), Error> {
        let accounts = self.store().accounts();
        log::info!("Exporting {} accounts", accounts.len());

        let mut csv_writer = csv::Writer::from_writer(writer);
        for account in &accounts {
            csv_writer.serialize(AccountRow {
                account: account.account_number(),
                country: account.country_code(),
                account_type: account.account_type(),
                currency: account.currency(),
                balance: format_amount(account.balance(), account.currency()),
            })?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    /// Writes the full transaction history, oldest first.
    pub fn export_history<W: Write>(&self, writer: W) -> Result<(), Error> {
        let records = self.history().query(&HistoryQuery::new());
        log::info!("Exporting {} history records", records.len());

        let mut csv_writer = csv::Writer::from_writer(writer);
        for record in &records {
            csv_writer.serialize(HistoryRow::from(record))?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::LedgerConfig;
    use crate::engine::store::InMemoryAccountStore;
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    #[test]
    fn test_format_amount_pads_to_minor_units() {
        assert_eq!(format_amount(dec!(45), Currency::EUR), "45.00");
        assert_eq!(format_amount(dec!(1500), Currency::JPY), "1500");
        assert_eq!(
            format_money(Money::new(dec!(1.5), Currency::GBP)),
            "1.50 GBP"
        );
    }

    #[test]
    fn test_load_accounts() {
        let store = InMemoryAccountStore::new();
        let input = "account,country,type,currency,balance
A1, US, checking, USD, 100.00
B1, DE, savings, EUR, 0";

        assert_eq!(load_accounts(&store, Cursor::new(input)).unwrap(), 2);
        let b1 = store.account("B1").unwrap();
        assert_eq!(b1.currency(), Currency::EUR);
        assert_eq!(b1.account_type(), AccountType::Savings);
    }

    #[test]
    fn test_load_accounts_rejects_duplicates() {
        let store = InMemoryAccountStore::new();
        let input = "account,country,type,currency,balance
A1,US,checking,USD,1
A1,US,checking,USD,2";

        assert!(matches!(
            load_accounts(&store, Cursor::new(input)),
            Err(Error::Store(_))
        ));
    }

    #[test]
    fn test_load_rates_with_and_without_timestamp() {
        let provider = StaticRateProvider::new();
        let input = "from,to,rate,observed_at
USD,EUR,0.9,
EUR,USD,1.1,2026-01-01T00:00:00Z";

        assert_eq!(load_rates(&provider, Cursor::new(input)).unwrap(), 2);
        assert_eq!(provider.len(), 2);
    }

    #[test]
    fn test_process_intents_counts_rejections() {
        let provider = StaticRateProvider::new();
        provider.set_rate(Currency::USD, Currency::EUR, dec!(0.9));
        let engine = LedgerEngine::in_memory(provider, LedgerConfig::default());
        load_accounts(
            engine.store(),
            Cursor::new("account,country,type,currency,balance\nA,US,checking,USD,10\nB,DE,checking,EUR,0"),
        )
        .unwrap();

        let intents = "request,type,account,counterparty,amount,currency
r1,transfer,A,B,5,USD
r2,withdrawal,A,,50,USD
r1,transfer,A,B,5,USD";
        let summary = engine.process_intents(Cursor::new(intents)).unwrap();

        // the repeated r1 replays its receipt and moves no money
        assert_eq!(summary.settled, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.fatal, 0);
        assert_eq!(
            engine.balance("B"),
            Some(Money::new(dec!(4.50), Currency::EUR))
        );
    }

    #[test]
    fn test_export_history_has_one_row_per_record() {
        let engine = LedgerEngine::in_memory(StaticRateProvider::new(), LedgerConfig::default());
        engine
            .store()
            .open_account(Account::open(
                "A",
                "US",
                AccountType::Checking,
                Money::new(dec!(10), Currency::USD),
            ))
            .unwrap();
        engine
            .deposit("r1", "A", Money::new(dec!(5), Currency::USD))
            .unwrap();
        engine
            .withdraw("r2", "A", Money::new(dec!(50), Currency::USD))
            .unwrap_err();

        let mut output = Vec::new();
        engine.export_history(&mut output).unwrap();
        let output = String::from_utf8(output).unwrap();

        let mut lines = output.lines();
        assert!(lines.next().unwrap().starts_with("id,request,correlation,account"));
        assert_eq!(lines.clone().count(), 2);
        assert!(output.contains("DEPOSIT,COMPLETED"));
        assert!(output.contains("WITHDRAWAL,FAILED"));
    }
}
