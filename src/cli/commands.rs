pub(crate) use clap::Parser;
use std::path::PathBuf;

use fx_ledger::FeePolicy;
use rust_decimal::Decimal;

#[derive(Parser, Debug)]
#[command(
    name = "fx-ledger",
    author,
    version,
    about = "A multi-currency ledger: settles deposits, withdrawals and transfers with currency conversion",
    long_about = None,
    after_help = "OUTPUT:\n    Final balances are printed to stdout in CSV format.\n    Use shell redirection to save to a file:\n\n    fx-ledger intents.csv --accounts accounts.csv --rates rates.csv > balances.csv"
)]
pub struct Args {
    /// Path to the input intents CSV file
    #[arg(
        index = 1,
        value_name = "FILE",
        help = "Input CSV file with columns: request, type, account, counterparty, amount, currency"
    )]
    pub input_file: PathBuf,

    /// Accounts to open before processing
    #[arg(
        long,
        value_name = "FILE",
        help = "CSV file with columns: account, country, type, currency, balance"
    )]
    pub accounts: PathBuf,

    /// Conversion rates to publish before processing
    #[arg(
        long,
        value_name = "FILE",
        help = "CSV file with columns: from, to, rate, observed_at (optional, RFC 3339)"
    )]
    pub rates: Option<PathBuf>,

    /// Where to write the transaction history
    #[arg(long, value_name = "FILE")]
    pub history: Option<PathBuf>,

    /// Flat fee per transfer, in the source account's currency
    #[arg(long, value_name = "AMOUNT", conflicts_with = "fee_percent")]
    pub fee_fixed: Option<Decimal>,

    /// Transfer fee as a percentage of the debited amount
    #[arg(long, value_name = "PERCENT")]
    pub fee_percent: Option<Decimal>,

    /// How long a conversion rate stays usable, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 300)]
    pub rate_ttl_secs: i64,
}

impl Args {
    pub fn fee_policy(&self) -> FeePolicy {
        match (self.fee_fixed, self.fee_percent) {
            (Some(amount), _) => FeePolicy::Fixed(amount),
            (None, Some(percent)) => FeePolicy::Percentage(percent),
            (None, None) => FeePolicy::Free,
        }
    }
}
