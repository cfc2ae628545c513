//! Funding Hedge Keeper - Main Entry Point
//!
//! Runs the reconciliation loop against the configured paper venues.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use funding_hedge_keeper::config::Config;
use funding_hedge_keeper::exchange::{ExchangeAdapter, MockExchange, VenueSet};
use funding_hedge_keeper::keeper::Keeper;
use funding_hedge_keeper::notify::{LogNotifier, Notifier, WebhookNotifier};
use funding_hedge_keeper::persistence::PersistenceManager;
use funding_hedge_keeper::store::MemoryStore;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Funding Hedge Keeper CLI
#[derive(Parser)]
#[command(name = "funding-hedge-keeper")]
#[command(version, about = "Keeps a cross-venue funding arbitrage book hedged and within leverage")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the reconciliation and report loops until interrupted (default)
    Run,

    /// Run a single reconciliation cycle followed by a report, then exit
    Once,

    /// Show stored tunables, recent orders and equity snapshots
    Status {
        /// Path to the SQLite database
        #[arg(short, long, default_value = "data/keeper.db")]
        db: String,

        /// Number of journal entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Status { db, limit } => show_status(&db, limit),
        Commands::Config => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Once => {
            init_logging()?;
            let keeper = build_keeper(&load_config()?).await?;
            let outcome = keeper.run_cycle().await;
            info!(?outcome, "🏁 Single cycle finished");
            keeper.report().await?;
            Ok(())
        }
        Commands::Run => {
            init_logging()?;
            run(load_config()?).await
        }
    }
}

fn load_config() -> Result<Config> {
    let config = Config::load()?;
    config.validate().context("Invalid configuration")?;
    log_config(&config);
    Ok(config)
}

/// Wire venues, cache, database and notifier into a keeper.
async fn build_keeper(config: &Config) -> Result<Keeper> {
    let mut adapters: Vec<Arc<dyn ExchangeAdapter>> = Vec::with_capacity(config.venues.len());
    for venue in &config.venues {
        let exchange = MockExchange::new(&venue.name)
            .with_symbol_suffix(&venue.symbol_suffix)
            .with_funding_interval(venue.funding_interval_hours);
        exchange.set_equity(venue.equity).await;
        info!(
            venue = %venue.name,
            equity = %venue.equity,
            suffix = %venue.symbol_suffix,
            "📝 [INIT] Paper venue ready"
        );
        adapters.push(Arc::new(exchange));
    }

    let db = Arc::new(
        PersistenceManager::new(&config.persistence.db_path)
            .context("Failed to initialize persistence database")?,
    );

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(
            url,
            Duration::from_secs(config.notify.timeout_secs),
        )?),
        None => {
            warn!("⚠️  No webhook configured, alerts go to the log only");
            Arc::new(LogNotifier)
        }
    };

    Ok(Keeper::new(
        config,
        VenueSet::new(adapters),
        Arc::new(MemoryStore::new()),
        db,
        notifier,
    ))
}

async fn run(config: Config) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║       Funding Hedge Keeper v{} - Paper Venues           ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let keeper = Arc::new(build_keeper(&config).await?);

    let mut cycle_timer =
        tokio::time::interval(Duration::from_secs(config.keeper.cycle_interval_secs));
    cycle_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut report_timer =
        tokio::time::interval(Duration::from_secs(config.keeper.report_interval_secs));
    report_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("🚀 Starting reconciliation loop...");

    loop {
        tokio::select! {
            _ = cycle_timer.tick() => {
                let keeper = keeper.clone();
                // Overlapping cycles are rejected by the keeper itself
                tokio::spawn(async move {
                    keeper.run_cycle().await;
                });
            }
            _ = report_timer.tick() => {
                let keeper = keeper.clone();
                tokio::spawn(async move {
                    if let Err(e) = keeper.report().await {
                        error!(error = %format!("{:#}", e), "❌ [REPORT] Report failed");
                    }
                });
            }
            result = &mut shutdown => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("🛑 Shutdown signal received");
                break;
            }
        }
    }

    info!("👋 Funding Hedge Keeper shutdown complete");
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "hedge-keeper.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("funding_hedge_keeper=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Project: {} (namespace {})", config.keeper.project, config.keeper.namespace);
    info!(
        "   Cycle / Report: {}s / {}s",
        config.keeper.cycle_interval_secs, config.keeper.report_interval_secs
    );
    info!("   Target Leverage: {}x", config.keeper.target_leverage);
    info!("   Order Size: ${}", config.keeper.order_usd);
    info!("   Max Holding: {}h", config.keeper.max_holding_hours);
    info!(
        "   Settle Spread: {}-{} bps",
        config.tunables.min_settle_delta_bps, config.tunables.max_settle_delta_bps
    );
    info!(
        "   Decrease Percent: {:.0}%",
        config.tunables.decrease_percent * dec!(100)
    );
    let names: Vec<&str> = config.venues.iter().map(|v| v.name.as_str()).collect();
    info!("   Venues: {}", names.join(", "));
}

/// Print persisted keeper state.
fn show_status(db_path: &str, limit: usize) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              HEDGE KEEPER STATUS                           ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The keeper has not been started yet, or the database path is incorrect.");
        return Ok(());
    }

    let persistence = PersistenceManager::new(db_path)?;
    let config = Config::load().unwrap_or_default();

    println!("\n⚙️  Tunables ({})", config.keeper.project);
    match persistence.load_tunables(&config.keeper.project)? {
        Some(t) => {
            println!("   ├─ Paused:           {}", t.paused);
            println!("   ├─ Reduce Only:      {}", t.reduce_only);
            println!(
                "   ├─ Settle Spread:    {}-{} bps",
                t.min_settle_delta_bps, t.max_settle_delta_bps
            );
            println!("   └─ Max Rebalance:    ${}", t.max_rebalance_usd);
        }
        None => println!("   └─ Not stored, defaults in effect"),
    }

    let orders = persistence.recent_orders(limit)?;
    if !orders.is_empty() {
        println!("\n📜 Recent Orders");
        for o in &orders {
            println!(
                "   ├─ {} [{}] {} {} {} {} on {} ({})",
                o.timestamp.format("%Y-%m-%d %H:%M:%S"),
                o.phase,
                o.token,
                o.side,
                o.quantity,
                o.symbol,
                o.venue,
                o.status
            );
        }
    }

    let snapshots = persistence.recent_snapshots(5)?;
    if !snapshots.is_empty() {
        println!("\n📉 Recent Equity Snapshots");
        for s in &snapshots {
            println!(
                "   ├─ {}: equity ${:.2} gross ${:.2} ({} tokens)",
                s.timestamp.format("%Y-%m-%d %H:%M"),
                s.total_equity,
                s.gross_notional,
                s.token_count
            );
        }
    }

    println!();
    Ok(())
}
