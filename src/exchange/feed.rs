//! Live price feed: latest-value cache over a stream of quote updates.
//!
//! One pump task consumes an infinite, non-restartable sequence of quotes and
//! keeps the freshest value per market; executors read the cache and refuse
//! to trade on anything older than the configured threshold.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::exchange::Quote;

/// Shared read-only view of the freshest quote per market.
#[derive(Default)]
pub struct PriceFeed {
    quotes: RwLock<HashMap<String, Quote>>,
}

impl PriceFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record a quote, keeping only the freshest value per market.
    pub fn update(&self, quote: Quote) {
        let mut quotes = self.quotes.write().expect("price feed lock poisoned");
        match quotes.get(&quote.market) {
            Some(existing) if existing.timestamp > quote.timestamp => {
                // Out-of-order update; the cache already has fresher data.
                debug!(market = %quote.market, "Dropping out-of-order quote");
            }
            _ => {
                quotes.insert(quote.market.clone(), quote);
            }
        }
    }

    /// Freshest quote for a market, regardless of age.
    pub fn latest(&self, market: &str) -> Option<Quote> {
        self.quotes
            .read()
            .expect("price feed lock poisoned")
            .get(market)
            .cloned()
    }

    /// Freshest quote for a market, failing with `StaleQuote` when it is
    /// missing or older than `max_age` relative to `now`.
    pub fn fresh(
        &self,
        market: &str,
        max_age: Duration,
        now: DateTime<Utc>,
    ) -> Result<Quote, EngineError> {
        match self.latest(market) {
            Some(quote) if now - quote.timestamp <= max_age => Ok(quote),
            Some(quote) => {
                warn!(
                    market,
                    age_ms = (now - quote.timestamp).num_milliseconds(),
                    "Quote too old to trade on"
                );
                Err(EngineError::StaleQuote {
                    market: market.to_string(),
                })
            }
            None => Err(EngineError::StaleQuote {
                market: market.to_string(),
            }),
        }
    }

    /// Spawn the pump task that drains a quote stream into the cache. The
    /// task ends when the stream producer drops.
    pub fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<Quote>) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(quote) = rx.recv().await {
                feed.update(quote);
            }
            debug!("Quote stream ended, price feed pump stopping");
        })
    }
}
