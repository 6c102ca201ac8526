//! Basic example of using the `LedgerEngine`.
//!
//! Run with: `cargo run --example basic`

use fx_ledger::batch::{load_accounts, load_rates};
use fx_ledger::{FeePolicy, LedgerConfig, LedgerEngine, StaticRateProvider};
use rust_decimal::Decimal;
use std::io::Cursor;

fn main() {
    // Initialize logger (optional, but shows what's happening)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let accounts = r"account,country,type,currency,balance
ACC-1,US,checking,USD,100.00
ACC-2,DE,savings,EUR,0.00
ACC-3,GB,business,GBP,250.00
";

    let rates = r"from,to,rate
USD,EUR,0.90
EUR,USD,1.10
GBP,USD,1.25
GBP,EUR,1.15
";

    // Sample intents as CSV
    let intents = r"request,type,account,counterparty,amount,currency
r-1,transfer,ACC-1,ACC-2,50.00,USD
r-2,deposit,ACC-2,,10.00,USD
r-3,withdrawal,ACC-1,,500.00,USD
r-4,transfer,ACC-3,ACC-1,20.00,GBP
r-1,transfer,ACC-1,ACC-2,50.00,USD
";

    let provider = StaticRateProvider::new();
    load_rates(&provider, Cursor::new(rates)).expect("Failed to load rates");

    // Create engine with a flat 1.00 transfer fee and process intents
    let config = LedgerConfig::default().with_fee_policy(FeePolicy::Fixed(Decimal::ONE));
    let engine = LedgerEngine::in_memory(provider, config);
    load_accounts(engine.store(), Cursor::new(accounts)).expect("Failed to load accounts");
    engine
        .process_intents(Cursor::new(intents))
        .expect("Failed to process intents");

    // Export results to stdout
    println!("\n=== Final Account State ===");
    engine
        .export_accounts(std::io::stdout())
        .expect("Failed to export accounts");

    println!("\n=== Transaction History ===");
    engine
        .export_history(std::io::stdout())
        .expect("Failed to export history");
}
