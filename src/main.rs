//! Leveraged futures trend engine.
//!
//! Runs one decision loop per symbol: trend regime, pullback/breakout/ranging
//! entries, an optional external analyst, risk sizing under a margin cap and
//! a ratcheting position lifecycle.

mod api;
mod bot;
mod db;
mod error;
mod indicators;
mod metrics;
mod models;
mod notify;
mod paper;
mod trading;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{
    AnalystPort, FileAnalyst, MarketClient, MarketDataPort, NeutralAnalyst, PersistencePort,
};
use crate::bot::{Ports, SymbolTrader};
use crate::db::Database;
use crate::metrics::{TradeStats, INITIAL_AI_SCORE};
use crate::models::Position;
use crate::notify::LogNotifier;
use crate::paper::{PaperConfig, PaperExchange};
use crate::trading::{
    DynamicParams, EngineConfig, InterpolatedPolicy, PerformancePolicy, StaticPolicy,
};

/// Leveraged futures trend engine CLI.
#[derive(Parser)]
#[command(name = "trend-engine")]
#[command(about = "Trend-following decision and risk engine for perpetual futures", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "ENGINE_DATABASE_URL", default_value = "sqlite:./trend_engine.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "ENGINE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// JSON file overriding the default configuration
    #[arg(short, long, env = "ENGINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the per-symbol decision loops
    Run {
        /// Symbols to trade, comma separated (e.g. BTCUSDT,ETHUSDT)
        #[arg(short, long, value_delimiter = ',')]
        symbols: Option<Vec<String>>,

        /// Let analyst signals open positions once the score allows it
        #[arg(long)]
        live: bool,

        /// Starting equity of the paper account (quote currency)
        #[arg(short, long, default_value = "1000")]
        capital: f64,

        /// Cycle interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Show open positions and the analyst score
    Status,

    /// Show recent closed trades with summary statistics
    Trades {
        /// Only this symbol
        #[arg(short, long)]
        symbol: Option<String>,

        /// Number of trades
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Starting equity for the drawdown curve
        #[arg(short, long, default_value = "1000")]
        capital: f64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = EngineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            symbols,
            live,
            capital,
            interval,
        } => {
            if let Some(symbols) = symbols {
                config.runtime.symbols = symbols.into_iter().map(|s| s.to_uppercase()).collect();
            }
            if let Some(interval) = interval {
                config.runtime.cycle_secs = interval;
            }
            config.arbiter.live_enabled = live;
            config.validate()?;
            let capital = Decimal::try_from(capital).context("Invalid capital")?;

            run(Arc::new(config), capital, &cli.database).await?;
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            let positions = db.stored_positions().await?;
            let score = db
                .load_performance_score()
                .await?
                .unwrap_or(INITIAL_AI_SCORE);

            println!("\n=== Engine Status ===");
            println!("Closed trades:    {}", db.trade_count().await?);
            println!("Analyst score:    {:.1}", score);
            println!(
                "Analyst live:     {}",
                if config.arbiter.live_enabled { "enabled" } else { "shadow only" }
            );

            if positions.is_empty() {
                println!("\nNo open positions.");
                return Ok(());
            }

            println!(
                "\n{:<12} {:<6} {:<10} {:<16} {:>12} {:>12} {:>12} {:>5} {:>10}",
                "SYMBOL", "SIDE", "STRATEGY", "STATE", "QTY", "AVG", "STOP", "ADDS", "FUNDING"
            );
            println!("{}", "-".repeat(104));
            for row in positions {
                match serde_json::from_str::<Position>(&row.state_json) {
                    Ok(p) if p.validate().is_ok() => println!(
                        "{:<12} {:<6} {:<10} {:<16} {:>12} {:>12.4} {:>12.4} {:>5} {:>10.4}",
                        p.symbol,
                        p.direction.as_str(),
                        p.strategy.as_str(),
                        row.state,
                        p.quantity(),
                        p.average_price(),
                        p.stop,
                        p.pyramid_count,
                        p.funding_fees
                    ),
                    _ => println!(
                        "{:<12} {:<6} {:<10} {:<16} CORRUPT (updated {})",
                        row.symbol, row.direction, "", row.state, row.updated_at
                    ),
                }
            }
        }

        Commands::Trades {
            symbol,
            limit,
            capital,
        } => {
            let db = Database::new(&cli.database).await?;
            let symbol = symbol.map(|s| s.to_uppercase());
            let trades = db.recent_trades(symbol.as_deref(), limit).await?;

            if trades.is_empty() {
                println!("No closed trades yet.");
                return Ok(());
            }

            println!(
                "\n{:<12} {:<9} {:<6} {:>12} {:>12} {:>10} {:>7} {:<12}",
                "SYMBOL", "STRATEGY", "SIDE", "ENTRY", "EXIT", "NET PNL", "R", "EXIT REASON"
            );
            println!("{}", "-".repeat(88));
            for t in &trades {
                println!(
                    "{:<12} {:<9} {:<6} {:>12.4} {:>12.4} {:>10.2} {:>7.2} {:<12}",
                    t.symbol,
                    t.strategy.as_str(),
                    t.direction.as_str(),
                    t.entry_price,
                    t.exit_price,
                    t.net_pnl,
                    t.r_multiple,
                    t.exit_reason.as_str()
                );
            }

            let capital = Decimal::try_from(capital).context("Invalid capital")?;
            println!("\n{}", TradeStats::calculate(&trades, capital));
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Spawn one loop per symbol and wait for all of them after Ctrl+C.
async fn run(config: Arc<EngineConfig>, capital: Decimal, database: &str) -> Result<()> {
    info!(
        symbols = ?config.runtime.symbols,
        cycle_secs = config.runtime.cycle_secs,
        leverage = config.account.leverage,
        live = config.arbiter.live_enabled,
        "Starting engine"
    );

    let db = Arc::new(Database::new(database).await?);
    let market: Arc<dyn MarketDataPort> = Arc::new(MarketClient::new(&config.runtime.market_base_url)?);
    let execution = Arc::new(PaperExchange::new(
        PaperConfig {
            starting_equity: capital,
            ..Default::default()
        },
        market.clone(),
    ));
    let analyst: Arc<dyn AnalystPort> = match &config.runtime.analyst_dir {
        Some(dir) => Arc::new(FileAnalyst::new(dir)),
        None => Arc::new(NeutralAnalyst),
    };
    let ports = Ports {
        market,
        execution,
        analyst,
        store: db,
        notifier: Arc::new(LogNotifier),
    };
    let performance = &config.performance;
    let policy: Arc<dyn PerformancePolicy> = if performance.enabled {
        Arc::new(InterpolatedPolicy::new(performance.clone(), capital))
    } else {
        Arc::new(StaticPolicy(DynamicParams::interpolate(
            &performance.defensive,
            &performance.aggressive,
            0.5,
        )))
    };

    println!("\n=== Trend Engine ===");
    println!("Symbols:   {}", config.runtime.symbols.join(", "));
    println!("Capital:   {}", capital);
    println!("Leverage:  {}x {}", config.account.leverage, config.account.margin_mode.as_str());
    println!("Interval:  {}s", config.runtime.cycle_secs);
    println!(
        "Analyst:   {}",
        if config.arbiter.live_enabled { "LIVE (score gated)" } else { "shadow only" }
    );
    println!("\nPress Ctrl+C to stop.\n");

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    let mut loops = Vec::new();
    for symbol in &config.runtime.symbols {
        let mut trader = SymbolTrader::new(symbol.clone(), config.clone(), ports.clone(), policy.clone());
        trader
            .initialize()
            .await
            .with_context(|| format!("Failed to initialize {}", symbol))?;
        loops.push(tokio::spawn(trader.run(shutdown.clone())));
    }

    for result in join_all(loops).await {
        if let Err(e) = result {
            error!(error = %e, "Symbol loop aborted");
        }
    }

    info!("All symbol loops stopped");
    Ok(())
}
