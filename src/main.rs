//! SMP Economy Daemon
//!
//! Hosts the balance ledger and territory registry over a local SQLite
//! database, flushing balances and collecting claim taxes on schedule.
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! smp-economy
//!
//! # Start with custom config
//! smp-economy --config /path/to/config.toml
//!
//! # Use a specific database file
//! smp-economy --database /data/economy.db
//!
//! # Run one tax sweep and exit
//! smp-economy --collect-taxes
//! ```

use anyhow::Context;
use clap::Parser;
use smp_economy::services::events::spawn_logging_listener;
use smp_economy::{DurableStore, EconomyConfig, EconomyServices, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "smp-economy")]
#[command(about = "Balance ledger and territory registry for an SMP server")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "SMP_ECONOMY_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "SMP_ECONOMY_DATABASE")]
    database: Option<PathBuf>,

    /// Run one tax collection sweep, then exit
    #[arg(long)]
    collect_taxes: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("smp_economy=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => EconomyConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EconomyConfig::default(),
    };

    // Apply CLI overrides
    if let Some(database) = args.database {
        config.database_path = database;
    }
    config.validate()?;

    info!(
        database = %config.database_path.display(),
        pool_size = config.pool_size,
        "Starting smp-economy"
    );

    let sqlite = Arc::new(SqliteStore::open(&config).context("opening database")?);
    let store: Arc<dyn DurableStore> = sqlite.clone();
    let services = EconomyServices::start(store, &config);
    let _listener = spawn_logging_listener(Arc::clone(&services.events));

    if args.collect_taxes {
        let summary = services.territory.collect_daily_taxes().await;
        info!(
            collected = summary.collected,
            delinquent = summary.delinquent,
            errors = summary.errors,
            "Tax sweep complete"
        );
    } else {
        info!("Press Ctrl+C to stop.");
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    }

    services.shutdown().await;

    // Print stats before exit
    if let Ok(stats) = sqlite.stats() {
        info!(
            accounts = stats.accounts,
            transactions = stats.transactions,
            claims = stats.claims,
            members = stats.members,
            "Final storage stats"
        );
    }

    Ok(())
}
