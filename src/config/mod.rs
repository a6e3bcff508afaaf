//! Configuration management for the batch hedger.
//!
//! Loads settings from environment variables (`BATCHER__` prefix) and an
//! optional config file, with sensible defaults for every field.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::OrderMode;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Account pool and cooldown settings
    #[serde(default)]
    pub pool: PoolConfig,
    /// Batch generation settings
    #[serde(default)]
    pub batch: BatchConfig,
    /// Task queue settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Worker pool settings
    #[serde(default)]
    pub workers: WorkerConfig,
    /// Order execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Persistence settings
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Mandatory idle period after a trade, in seconds
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Smallest batch worth reserving accounts for
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Accounts per batch, lower bound
    #[serde(default = "default_batch_size_min")]
    pub size_min: usize,
    /// Accounts per batch, upper bound
    #[serde(default = "default_batch_size_max")]
    pub size_max: usize,
    /// Total batch notional in USD, lower bound
    #[serde(default = "default_notional_min")]
    pub notional_min: Decimal,
    /// Total batch notional in USD, upper bound
    #[serde(default = "default_notional_max")]
    pub notional_max: Decimal,
    /// Per-leg size variation range (0.1-0.4 = legs deviate 10-40% from the
    /// side average while the side total stays exact)
    #[serde(default = "default_size_variation")]
    pub size_variation: f64,
    /// Seconds between generation ticks
    #[serde(default = "default_generation_interval_secs")]
    pub generation_interval_secs: u64,
    /// How long a tick may wait on a full queue before rolling back
    #[serde(default = "default_enqueue_timeout_secs")]
    pub enqueue_timeout_secs: u64,
    /// Markets batches are opened on (one chosen per batch)
    #[serde(default = "default_markets")]
    pub markets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum tasks buffered between generator and workers
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent batch workers (3-5 sensible)
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Seconds between stats log lines
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// LIMIT rests on the book and retries; MARKET fires one IOC shot
    #[serde(default = "default_order_mode")]
    pub mode: OrderMode,
    /// Maximum attempts per leg in LIMIT mode
    #[serde(default = "default_limit_max_attempts")]
    pub limit_max_attempts: u32,
    /// Initial price offset from the touch for resting orders (0.0001 = 1 bp)
    #[serde(default = "default_limit_offset")]
    pub limit_offset: Decimal,
    /// Ceiling for the adaptive offset as retries widen it
    #[serde(default = "default_limit_offset_cap")]
    pub limit_offset_cap: Decimal,
    /// How long a resting order may wait for a fill before cancel-and-retry,
    /// in seconds
    #[serde(default = "default_fill_wait_secs")]
    pub fill_wait_secs: u64,
    /// Order status poll cadence while waiting, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Base delay between LIMIT attempts, in milliseconds (doubles per
    /// attempt)
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Ceiling for the exponential backoff, in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Oldest quote the executor will trade on, in milliseconds
    #[serde(default = "default_quote_max_age_ms")]
    pub quote_max_age_ms: u64,
    /// Largest acceptable long/short fill imbalance before corrective
    /// action, in USD
    #[serde(default = "default_balance_tolerance")]
    pub balance_tolerance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub path: String,
}

// Default value functions

fn default_cooldown_secs() -> u64 {
    60
}

fn default_min_batch_size() -> usize {
    5
}

fn default_batch_size_min() -> usize {
    5
}

fn default_batch_size_max() -> usize {
    7
}

fn default_notional_min() -> Decimal {
    Decimal::new(1000, 0) // $1000 total batch size
}

fn default_notional_max() -> Decimal {
    Decimal::new(1200, 0)
}

fn default_size_variation() -> f64 {
    0.3 // legs deviate up to 30% from the side average
}

fn default_generation_interval_secs() -> u64 {
    5
}

fn default_enqueue_timeout_secs() -> u64 {
    10
}

fn default_markets() -> Vec<String> {
    vec!["BTC-USD".to_string(), "ETH-USD".to_string()]
}

fn default_queue_capacity() -> usize {
    20
}

fn default_worker_count() -> usize {
    3
}

fn default_stats_interval_secs() -> u64 {
    300
}

fn default_order_mode() -> OrderMode {
    OrderMode::Limit
}

fn default_limit_max_attempts() -> u32 {
    5
}

fn default_limit_offset() -> Decimal {
    Decimal::new(1, 4) // 0.0001 = 1 bp from the touch
}

fn default_limit_offset_cap() -> Decimal {
    Decimal::new(2, 3) // 0.002 = 20 bp
}

fn default_fill_wait_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    8000
}

fn default_quote_max_age_ms() -> u64 {
    2000
}

fn default_balance_tolerance() -> Decimal {
    // Batches are constructed in exact cents, but fills carry quantity
    // rounding of up to a few cents per leg.
    Decimal::ONE
}

fn default_db_path() -> String {
    "data/batch_hedger.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("BATCHER"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.batch.size_min >= 2 && self.batch.size_min <= self.batch.size_max,
            "batch size range must satisfy 2 <= size_min <= size_max"
        );

        anyhow::ensure!(
            self.pool.min_batch_size >= 2 && self.pool.min_batch_size <= self.batch.size_min,
            "min_batch_size must be >= 2 and <= batch size_min"
        );

        anyhow::ensure!(
            self.batch.notional_min > Decimal::ZERO
                && self.batch.notional_min <= self.batch.notional_max,
            "batch notional range must be positive and ordered"
        );

        anyhow::ensure!(
            (0.0..1.0).contains(&self.batch.size_variation),
            "size_variation must be in [0, 1)"
        );

        anyhow::ensure!(!self.batch.markets.is_empty(), "at least one market required");

        anyhow::ensure!(self.queue.capacity >= 1, "queue capacity must be >= 1");

        anyhow::ensure!(self.workers.count >= 1, "worker count must be >= 1");

        anyhow::ensure!(
            self.execution.limit_max_attempts >= 1,
            "limit_max_attempts must be >= 1"
        );

        anyhow::ensure!(
            self.execution.limit_offset > Decimal::ZERO
                && self.execution.limit_offset <= self.execution.limit_offset_cap,
            "limit offset must be positive and <= its cap"
        );

        anyhow::ensure!(
            self.execution.balance_tolerance >= Decimal::ZERO,
            "balance_tolerance must be >= 0"
        );

        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            min_batch_size: default_min_batch_size(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size_min: default_batch_size_min(),
            size_max: default_batch_size_max(),
            notional_min: default_notional_min(),
            notional_max: default_notional_max(),
            size_variation: default_size_variation(),
            generation_interval_secs: default_generation_interval_secs(),
            enqueue_timeout_secs: default_enqueue_timeout_secs(),
            markets: default_markets(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: default_order_mode(),
            limit_max_attempts: default_limit_max_attempts(),
            limit_offset: default_limit_offset(),
            limit_offset_cap: default_limit_offset_cap(),
            fill_wait_secs: default_fill_wait_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            quote_max_age_ms: default_quote_max_age_ms(),
            balance_tolerance: default_balance_tolerance(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_batch_range_rejected() {
        let mut config = Config::default();
        config.batch.size_min = 8;
        config.batch.size_max = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_offset_above_cap_rejected() {
        let mut config = Config::default();
        config.execution.limit_offset = Decimal::new(5, 3);
        config.execution.limit_offset_cap = Decimal::new(1, 3);
        assert!(config.validate().is_err());
    }
}
