mod commands;

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::Parser;
use commands::Args;
use fx_ledger::batch::{load_accounts, load_rates};
use fx_ledger::{LedgerConfig, LedgerEngine, StaticRateProvider};

fn open(path: &Path, what: &str) -> Result<File> {
    File::open(path).with_context(|| format!("Failed to open {what} file: {}", path.display()))
}

fn main() -> Result<()> {
    // Parse the CLI arguments
    let args = Args::parse();

    // Initialize logger with default level of info (can be overridden with RUST_LOG)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 1. Build the configuration and seed the rate provider
    let rate_ttl = TimeDelta::try_seconds(args.rate_ttl_secs)
        .filter(|ttl| *ttl > TimeDelta::zero())
        .with_context(|| format!("Invalid rate TTL: {}s", args.rate_ttl_secs))?;
    let config = LedgerConfig::default()
        .with_rate_ttl(rate_ttl)
        .with_fee_policy(args.fee_policy());

    let provider = StaticRateProvider::new();
    if let Some(rates) = &args.rates {
        load_rates(&provider, open(rates, "rates")?).context("Failed to load rates")?;
    }

    // 2. Initialize the LedgerEngine and open the accounts
    let engine = LedgerEngine::in_memory(provider, config);
    load_accounts(engine.store(), open(&args.accounts, "accounts")?)
        .context("Failed to load accounts")?;

    // 3. Process the intents
    log::info!("Processing intents from {}", args.input_file.display());
    let summary = engine
        .process_intents(open(&args.input_file, "input")?)
        .context("Failed to process intents")?;

    for alert in engine.reconciliation_alerts() {
        log::error!(
            "Reconciliation required for {} ({}): {}",
            alert.account_number,
            alert.request_id,
            alert.reason
        );
    }

    // 4. Export the history, then the balances to stdout
    if let Some(path) = &args.history {
        let file = File::create(path)
            .with_context(|| format!("Failed to create history file: {}", path.display()))?;
        engine
            .export_history(file)
            .context("Failed to export history")?;
    }

    engine
        .export_accounts(std::io::stdout())
        .context("Failed to export accounts to stdout")?;

    log::info!(
        "Export complete ({} settled, {} rejected)",
        summary.settled,
        summary.rejected
    );

    Ok(())
}
