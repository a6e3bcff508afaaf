//! Batch Hedger - Main Entry Point
//!
//! Paper-trading engine: a synthetic market feed drives a mock venue while
//! the generator/queue/worker pipeline runs exactly as it would against a
//! real one.

use anyhow::{Context, Result};
use batch_hedger::batch::BatchGenerator;
use batch_hedger::config::Config;
use batch_hedger::exchange::{ExchangeApi, MockVenue, PriceFeed, Quote};
use batch_hedger::persistence::SqliteStore;
use batch_hedger::pool::{Account, AccountPool};
use batch_hedger::queue;
use batch_hedger::strategy::{HedgeCoordinator, OrderExecutor};
use batch_hedger::worker::WorkerPool;
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Batch Hedger CLI
#[derive(Parser)]
#[command(name = "batch-hedger")]
#[command(version, about = "Hedge-balanced multi-account batch trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show pool and batch history from the persisted state
    Status {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/batch_hedger.db")]
        db: String,
    },

    /// Seed the account table with paper-trading accounts
    Seed {
        /// Path to SQLite database
        #[arg(short, long, default_value = "data/batch_hedger.db")]
        db: String,

        /// Number of accounts to create
        #[arg(short, long, default_value = "12")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::Status { db }) => return show_status(&db),
        Some(Commands::Seed { db, count }) => return seed_accounts(&db, count),
        None => {}
    }

    run().await
}

async fn run() -> Result<()> {
    info!("Batch Hedger v{} - paper trading", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    config.validate()?;
    info!(
        config = %serde_json::to_string(&config).unwrap_or_default(),
        "Configuration loaded"
    );

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::open(&config.database.path)?);

    let mut accounts = store.load_accounts()?;
    if accounts.is_empty() {
        warn!("No accounts in database, seeding a default paper-trading set");
        accounts = default_accounts(12);
        store.save_accounts(&accounts)?;
    }

    let pool = AccountPool::new(
        accounts,
        chrono::Duration::seconds(config.pool.cooldown_secs as i64),
        config.pool.min_batch_size,
    )
    .into_shared();

    // Market plumbing: a synthetic random walk feeds both the quote cache
    // and the mock venue's mark prices.
    let feed = PriceFeed::new();
    let venue = Arc::new(MockVenue::new());
    let (quote_tx, quote_rx) = mpsc::channel(64);
    let pump = feed.spawn_pump(quote_rx);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sim = spawn_market_sim(
        config.batch.markets.clone(),
        quote_tx,
        Arc::clone(&venue),
        shutdown_rx.clone(),
    );

    let executor = Arc::new(OrderExecutor::new(
        Arc::clone(&venue) as Arc<dyn ExchangeApi>,
        Arc::clone(&feed),
        config.execution.clone(),
        shutdown_rx.clone(),
    ));
    let coordinator = Arc::new(HedgeCoordinator::new(
        executor,
        config.execution.balance_tolerance,
    ));

    let (task_tx, task_rx) = queue::bounded(config.queue.capacity);
    let queue_view = task_rx.clone();

    // The generator owns the only sender: when it stops, the queue closes
    // and the workers drain whatever is left.
    let generator = BatchGenerator::new(
        Arc::clone(&pool),
        task_tx,
        config.batch.clone(),
        config.execution.mode,
        shutdown_rx.clone(),
    );
    let generator_handle = tokio::spawn(generator.run());

    let workers = WorkerPool::spawn(
        config.workers.count,
        task_rx,
        coordinator,
        Arc::clone(&pool),
        Arc::clone(&store),
    );
    let stats = workers.stats();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        shutdown_tx.send(true).ok();
    });

    info!(
        workers = config.workers.count,
        queue_capacity = config.queue.capacity,
        markets = ?config.batch.markets,
        mode = ?config.execution.mode,
        "Engine running"
    );

    // Periodic stats until shutdown.
    let mut shutdown = shutdown_rx;
    let mut interval =
        tokio::time::interval(Duration::from_secs(config.workers.stats_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                let pool_stats = pool.lock().await.stats();
                info!(
                    available = pool_stats.available,
                    reserved = pool_stats.reserved,
                    cooldown = pool_stats.cooldown,
                    disabled = pool_stats.disabled,
                    utilization = pool_stats.utilization(),
                    queue_depth = queue_view.depth(),
                    tasks = stats.tasks_processed.load(Ordering::Relaxed),
                    completed = stats.completed.load(Ordering::Relaxed),
                    rebalanced = stats.rebalanced.load(Ordering::Relaxed),
                    unwound = stats.unwound.load(Ordering::Relaxed),
                    exposure_held = stats.exposure_held.load(Ordering::Relaxed),
                    failed = stats.failed.load(Ordering::Relaxed),
                    "Engine stats"
                );
            }
        }
    }

    info!("Draining: generator stops, workers finish queued batches");
    let generated = generator_handle.await.unwrap_or(0);
    workers.join().await;
    sim.abort();
    pump.abort();

    // Final snapshot so cooldowns and disables survive the restart.
    store.save_accounts(&pool.lock().await.snapshot())?;

    info!(
        generated,
        processed = stats.tasks_processed.load(Ordering::Relaxed),
        completed = stats.completed.load(Ordering::Relaxed),
        rebalanced = stats.rebalanced.load(Ordering::Relaxed),
        unwound = stats.unwound.load(Ordering::Relaxed),
        exposure_held = stats.exposure_held.load(Ordering::Relaxed),
        failed = stats.failed.load(Ordering::Relaxed),
        "Shutdown complete"
    );
    Ok(())
}

/// Random-walk quote generator for paper trading. Pushes quotes into the
/// feed pump and keeps the mock venue's marks in sync.
fn spawn_market_sim(
    markets: Vec<String>,
    quotes: mpsc::Sender<Quote>,
    venue: Arc<MockVenue>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut prices: Vec<(String, Decimal)> = markets
            .into_iter()
            .map(|m| {
                let seed = if m.starts_with("BTC") {
                    dec!(50000)
                } else if m.starts_with("ETH") {
                    dec!(3000)
                } else {
                    dec!(100)
                };
                (m, seed)
            })
            .collect();

        let mut interval = tokio::time::interval(Duration::from_millis(500));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    for (market, price) in prices.iter_mut() {
                        // Step up to 5 bp either way.
                        let step = Decimal::from_f64_retain(rng.gen_range(-0.0005..=0.0005))
                            .unwrap_or_default();
                        *price = (*price * (Decimal::ONE + step)).round_dp(2);
                        let half_spread = (*price * dec!(0.0001)).round_dp(2);

                        venue.set_mark(market, *price);
                        let quote = Quote {
                            market: market.clone(),
                            bid: *price - half_spread,
                            ask: *price + half_spread,
                            timestamp: Utc::now(),
                        };
                        if quotes.send(quote).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    })
}

fn default_accounts(count: usize) -> Vec<Account> {
    (0..count)
        .map(|i| {
            let mut account = Account::new(format!("acct-{i:03}"), format!("cred-{i:03}"));
            account.proxy_ref = Some(format!("egress-{}", i % 4));
            account
        })
        .collect()
}

fn show_status(db: &str) -> Result<()> {
    let store = SqliteStore::open(db)?;

    let accounts = store.load_accounts()?;
    println!("Accounts: {}", accounts.len());
    for state in ["available", "reserved", "cooldown", "disabled"] {
        let count = accounts.iter().filter(|a| a.state.as_str() == state).count();
        if count > 0 {
            println!("  {state}: {count}");
        }
    }
    let trades: u64 = accounts.iter().map(|a| a.trades).sum();
    println!("  total trades: {trades}");

    println!("Batches:");
    for (outcome, count) in store.batch_counts()? {
        println!("  {outcome}: {count}");
    }
    let residual = store.total_residual()?;
    if residual > Decimal::ZERO {
        println!("  residual exposure recorded: ${residual}");
    }
    Ok(())
}

fn seed_accounts(db: &str, count: usize) -> Result<()> {
    if let Some(parent) = std::path::Path::new(db).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(db)?;
    let accounts = default_accounts(count);
    store.save_accounts(&accounts)?;
    println!("Seeded {count} accounts into {db}");
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "batch-hedger.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration.
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("batch_hedger=debug".parse()?)
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
