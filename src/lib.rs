//! # Batch Hedger
//!
//! A multi-account batch trading engine that opens hedge-balanced long/short
//! order groups across a pool of accounts.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `pool`: Account availability, cooldowns, and atomic batch reservation
//! - `batch`: Balanced batch construction and the periodic generator
//! - `queue`: Bounded FIFO task queue between generator and workers
//! - `worker`: Symmetric worker pool consuming batch tasks
//! - `strategy`: Per-leg order execution and hedge reconciliation
//! - `exchange`: Venue abstraction, price feed, and the paper-trading venue
//! - `persistence`: SQLite-based account and batch history storage
//! - `utils`: Shared decimal arithmetic helpers

pub mod batch;
pub mod config;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod pool;
pub mod queue;
pub mod strategy;
pub mod utils;
pub mod worker;

pub use config::Config;
pub use error::EngineError;
