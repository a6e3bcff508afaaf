//! Per-leg order execution with retry and backoff discipline.
//!
//! MARKET mode fires one immediate-or-cancel order: speed over cost, any
//! failure is terminal for the leg. LIMIT mode rests on the book for the
//! fee saving and cycles Pending -> Canceled-Retrying -> Pending with a
//! widening price offset and exponential backoff, up to the attempt cap.
//! Shutdown is observed between LIMIT attempts; the previous attempt's
//! resting order is already canceled when the check runs.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::ExecutionConfig;
use crate::error::EngineError;
use crate::exchange::{
    ExchangeApi, OrderHandle, OrderMode, OrderRequest, OrderStatus, PriceFeed, Side, VenueError,
};

/// Terminal (or pending) status of one placement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Pending,
    Filled,
    Rejected,
    TimedOut,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Filled => "filled",
            AttemptStatus::Rejected => "rejected",
            AttemptStatus::TimedOut => "timed_out",
        }
    }
}

/// Record of one placement attempt, kept for statistics.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub status: AttemptStatus,
}

/// What actually filled for a leg.
#[derive(Debug, Clone)]
pub struct LegFill {
    pub quantity: Decimal,
    pub price: Decimal,
}

impl LegFill {
    pub fn notional(&self) -> Decimal {
        self.quantity * self.price
    }
}

/// Outcome of executing one leg: a fill, the attempt history, and the error
/// that ended execution if no (full) fill was reached.
#[derive(Debug)]
pub struct LegResult {
    pub fill: Option<LegFill>,
    pub attempts: Vec<AttemptRecord>,
    pub error: Option<EngineError>,
}

impl LegResult {
    pub fn filled_notional(&self) -> Decimal {
        self.fill.as_ref().map(|f| f.notional()).unwrap_or_default()
    }

    /// The account's credentials were refused; it must be disabled.
    pub fn is_credential_failure(&self) -> bool {
        matches!(self.error, Some(EngineError::CredentialInvalid { .. }))
    }

    /// Worth another shot with a re-derived notional during rebalancing.
    pub fn is_retryable_failure(&self) -> bool {
        self.fill.is_none() && self.error.is_some() && !self.is_credential_failure()
    }
}

/// Places and retries orders for one account/side at a time. Stateless
/// between calls; safe to share across workers.
pub struct OrderExecutor {
    venue: Arc<dyn ExchangeApi>,
    feed: Arc<PriceFeed>,
    config: ExecutionConfig,
    shutdown: watch::Receiver<bool>,
}

impl OrderExecutor {
    pub fn new(
        venue: Arc<dyn ExchangeApi>,
        feed: Arc<PriceFeed>,
        config: ExecutionConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            venue,
            feed,
            config,
            shutdown,
        }
    }

    /// Execute one leg. Never panics and never returns mid-attempt: resting
    /// orders are always canceled before giving up on an attempt.
    pub async fn execute(
        &self,
        account_id: &str,
        side: Side,
        market: &str,
        notional: Decimal,
        mode: OrderMode,
    ) -> LegResult {
        match mode {
            OrderMode::Market => self.execute_market(account_id, side, market, notional).await,
            OrderMode::Limit => self.execute_limit(account_id, side, market, notional).await,
        }
    }

    /// Close a previously filled quantity with an immediate-or-cancel order.
    /// Used by the coordinator's unwind path.
    pub async fn unwind(
        &self,
        account_id: &str,
        side: Side,
        market: &str,
        quantity: Decimal,
    ) -> Result<LegFill, EngineError> {
        let request = OrderRequest {
            account_id: account_id.to_string(),
            market: market.to_string(),
            side: side.flip(),
            price: None,
            quantity,
            reduce_only: true,
        };

        let handle = self
            .venue
            .place_order(&request)
            .await
            .map_err(|e| self.classify(account_id, market, e))?;
        let state = self
            .venue
            .query_status(&handle)
            .await
            .map_err(|e| self.classify(account_id, market, e))?;

        if state.filled_qty >= quantity {
            Ok(LegFill {
                quantity: state.filled_qty,
                price: state.avg_price,
            })
        } else {
            Err(EngineError::OrderRejected {
                account: account_id.to_string(),
                market: market.to_string(),
                reason: "unwind order did not fill".to_string(),
            })
        }
    }

    async fn execute_market(
        &self,
        account_id: &str,
        side: Side,
        market: &str,
        notional: Decimal,
    ) -> LegResult {
        // Single shot: quote gate, place IOC, read the result.
        let quote = match self.feed.fresh(market, self.quote_max_age(), Utc::now()) {
            Ok(q) => q,
            Err(e) => {
                return LegResult {
                    fill: None,
                    attempts: vec![AttemptRecord {
                        attempt: 1,
                        price: None,
                        quantity: None,
                        status: AttemptStatus::Rejected,
                    }],
                    error: Some(e),
                }
            }
        };

        // Market orders cross the spread; size against the touch we hit.
        let reference = match side {
            Side::Long => quote.ask,
            Side::Short => quote.bid,
        };
        let quantity = (notional / reference).round_dp(6);

        let request = OrderRequest {
            account_id: account_id.to_string(),
            market: market.to_string(),
            side,
            price: None,
            quantity,
            reduce_only: false,
        };

        let mut record = AttemptRecord {
            attempt: 1,
            price: None,
            quantity: Some(quantity),
            status: AttemptStatus::Pending,
        };

        let result = match self.venue.place_order(&request).await {
            Ok(handle) => match self.venue.query_status(&handle).await {
                Ok(state) if state.filled_qty > Decimal::ZERO => {
                    record.status = AttemptStatus::Filled;
                    LegResult {
                        fill: Some(LegFill {
                            quantity: state.filled_qty,
                            price: state.avg_price,
                        }),
                        attempts: vec![],
                        error: None,
                    }
                }
                Ok(_) => {
                    record.status = AttemptStatus::Rejected;
                    LegResult {
                        fill: None,
                        attempts: vec![],
                        error: Some(EngineError::OrderRejected {
                            account: account_id.to_string(),
                            market: market.to_string(),
                            reason: "IOC order canceled unfilled".to_string(),
                        }),
                    }
                }
                Err(e) => {
                    record.status = AttemptStatus::Rejected;
                    LegResult {
                        fill: None,
                        attempts: vec![],
                        error: Some(self.classify(account_id, market, e)),
                    }
                }
            },
            Err(e) => {
                record.status = AttemptStatus::Rejected;
                LegResult {
                    fill: None,
                    attempts: vec![],
                    error: Some(self.classify(account_id, market, e)),
                }
            }
        };

        let mut result = result;
        result.attempts.push(record);
        result
    }

    async fn execute_limit(
        &self,
        account_id: &str,
        side: Side,
        market: &str,
        notional: Decimal,
    ) -> LegResult {
        let mut attempts = Vec::new();

        for attempt in 1..=self.config.limit_max_attempts {
            if attempt > 1 {
                if *self.shutdown.borrow() {
                    warn!(
                        account_id,
                        market, attempt, "Shutdown during limit retries, abandoning leg"
                    );
                    return LegResult {
                        fill: None,
                        attempts,
                        error: Some(EngineError::OrderRejected {
                            account: account_id.to_string(),
                            market: market.to_string(),
                            reason: "aborted by shutdown".to_string(),
                        }),
                    };
                }
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }

            let quote = match self.feed.fresh(market, self.quote_max_age(), Utc::now()) {
                Ok(q) => q,
                Err(e) => {
                    // Terminal for this attempt only; the feed may catch up
                    // before the next one.
                    attempts.push(AttemptRecord {
                        attempt,
                        price: None,
                        quantity: None,
                        status: AttemptStatus::Rejected,
                    });
                    if attempt == self.config.limit_max_attempts {
                        return LegResult {
                            fill: None,
                            attempts,
                            error: Some(e),
                        };
                    }
                    continue;
                }
            };

            let offset = self.adaptive_offset(attempt);
            let price = match side {
                Side::Long => (quote.bid * (Decimal::ONE - offset)).round_dp(2),
                Side::Short => (quote.ask * (Decimal::ONE + offset)).round_dp(2),
            };
            let quantity = (notional / price).round_dp(6);

            let request = OrderRequest {
                account_id: account_id.to_string(),
                market: market.to_string(),
                side,
                price: Some(price),
                quantity,
                reduce_only: false,
            };

            debug!(
                account_id,
                market,
                %side,
                attempt,
                %price,
                %quantity,
                "Placing limit order"
            );

            let handle = match self.venue.place_order(&request).await {
                Ok(handle) => handle,
                Err(VenueError::CredentialInvalid) => {
                    attempts.push(AttemptRecord {
                        attempt,
                        price: Some(price),
                        quantity: Some(quantity),
                        status: AttemptStatus::Rejected,
                    });
                    return LegResult {
                        fill: None,
                        attempts,
                        error: Some(EngineError::CredentialInvalid {
                            account: account_id.to_string(),
                        }),
                    };
                }
                Err(e) => {
                    warn!(account_id, market, attempt, error = %e, "Order placement failed");
                    attempts.push(AttemptRecord {
                        attempt,
                        price: Some(price),
                        quantity: Some(quantity),
                        status: AttemptStatus::Rejected,
                    });
                    if !e.is_retryable() {
                        return LegResult {
                            fill: None,
                            attempts,
                            error: Some(self.classify(account_id, market, e)),
                        };
                    }
                    continue;
                }
            };

            // Pending: wait for the resting order inside the fill window.
            if let Some(fill) = self.await_fill(&handle).await {
                attempts.push(AttemptRecord {
                    attempt,
                    price: Some(price),
                    quantity: Some(quantity),
                    status: AttemptStatus::Filled,
                });
                debug!(account_id, market, attempt, price = %fill.price, "Leg filled");
                return LegResult {
                    fill: Some(fill),
                    attempts,
                    error: None,
                };
            }

            // Canceled-Retrying: pull the order, keep any partial fill, loop
            // back with an adjusted price.
            let _ = self.venue.cancel_order(&handle).await;
            if let Ok(state) = self.venue.query_status(&handle).await {
                if state.filled_qty > Decimal::ZERO {
                    attempts.push(AttemptRecord {
                        attempt,
                        price: Some(price),
                        quantity: Some(quantity),
                        status: AttemptStatus::Filled,
                    });
                    warn!(
                        account_id,
                        market,
                        filled = %state.filled_qty,
                        wanted = %quantity,
                        "Partial fill kept after cancel"
                    );
                    return LegResult {
                        fill: Some(LegFill {
                            quantity: state.filled_qty,
                            price: state.avg_price,
                        }),
                        attempts,
                        error: None,
                    };
                }
            }

            attempts.push(AttemptRecord {
                attempt,
                price: Some(price),
                quantity: Some(quantity),
                status: AttemptStatus::TimedOut,
            });
        }

        LegResult {
            fill: None,
            attempts,
            error: Some(EngineError::OrderRejected {
                account: account_id.to_string(),
                market: market.to_string(),
                reason: format!(
                    "unfilled after {} limit attempts",
                    self.config.limit_max_attempts
                ),
            }),
        }
    }

    /// Poll a resting order until it fills or the wait window closes.
    async fn await_fill(&self, handle: &OrderHandle) -> Option<LegFill> {
        let polls = (self.config.fill_wait_secs * 1000 / self.config.poll_interval_ms.max(1)).max(1);

        for _ in 0..polls {
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;

            match self.venue.query_status(handle).await {
                Ok(state) if state.status == OrderStatus::Filled => {
                    return Some(LegFill {
                        quantity: state.filled_qty,
                        price: state.avg_price,
                    });
                }
                Ok(_) => {}
                // Keep polling through transient query errors; the cancel
                // after the window cleans up either way.
                Err(e) => debug!(error = %e, "Status query failed, still waiting"),
            }
        }
        None
    }

    /// Offset from the touch for attempt n: doubles each retry, capped.
    fn adaptive_offset(&self, attempt: u32) -> Decimal {
        let mut offset = self.config.limit_offset;
        for _ in 1..attempt {
            offset = (offset * Decimal::TWO).min(self.config.limit_offset_cap);
        }
        offset
    }

    /// Delay before attempt n: exponential from the base, capped. Attempt 1
    /// has no delay; later delays are non-decreasing.
    pub(crate) fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(2).min(20);
        let ms = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.config.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    fn quote_max_age(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.config.quote_max_age_ms as i64)
    }

    fn classify(&self, account_id: &str, market: &str, error: VenueError) -> EngineError {
        match error {
            VenueError::CredentialInvalid => EngineError::CredentialInvalid {
                account: account_id.to_string(),
            },
            VenueError::Transient(reason) | VenueError::Rejected(reason) => {
                EngineError::OrderRejected {
                    account: account_id.to_string(),
                    market: market.to_string(),
                    reason,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockBehavior, MockVenue, Quote};
    use rust_decimal_macros::dec;

    fn feed_with_quote(market: &str, bid: Decimal, ask: Decimal) -> Arc<PriceFeed> {
        let feed = PriceFeed::new();
        feed.update(Quote {
            market: market.to_string(),
            bid,
            ask,
            timestamp: Utc::now(),
        });
        feed
    }

    fn test_config() -> ExecutionConfig {
        ExecutionConfig {
            fill_wait_secs: 2,
            poll_interval_ms: 500,
            backoff_base_ms: 500,
            backoff_cap_ms: 2000,
            ..ExecutionConfig::default()
        }
    }

    fn executor(venue: Arc<MockVenue>, feed: Arc<PriceFeed>) -> OrderExecutor {
        let (_, shutdown) = watch::channel(false);
        OrderExecutor::new(venue, feed, test_config(), shutdown)
    }

    #[tokio::test]
    async fn test_market_mode_single_shot() {
        let venue = Arc::new(MockVenue::new());
        let feed = feed_with_quote("BTC-USD", dec!(49999), dec!(50001));
        let exec = executor(Arc::clone(&venue), feed);

        let result = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Market)
            .await;

        assert!(result.fill.is_some());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(venue.placed_orders().len(), 1);
        assert!(venue.placed_orders()[0].price.is_none());
    }

    #[tokio::test]
    async fn test_market_mode_no_retry_on_failure() {
        let venue = Arc::new(MockVenue::new());
        venue.set_behavior("acct-1", MockBehavior::NeverFill);
        let feed = feed_with_quote("BTC-USD", dec!(49999), dec!(50001));
        let exec = executor(Arc::clone(&venue), feed);

        let result = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Market)
            .await;

        assert!(result.fill.is_none());
        assert!(matches!(result.error, Some(EngineError::OrderRejected { .. })));
        assert_eq!(venue.placed_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_feed_refuses_to_trade() {
        let venue = Arc::new(MockVenue::new());
        let feed = PriceFeed::new(); // no quotes at all
        let exec = executor(Arc::clone(&venue), feed);

        let result = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Market)
            .await;

        assert!(matches!(result.error, Some(EngineError::StaleQuote { .. })));
        assert!(venue.placed_orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_attempt_cap() {
        let venue = Arc::new(MockVenue::new());
        venue.set_behavior("acct-1", MockBehavior::NeverFill);
        let feed = feed_with_quote("BTC-USD", dec!(49999), dec!(50001));
        let exec = executor(Arc::clone(&venue), feed);

        let result = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Limit)
            .await;

        assert!(result.fill.is_none());
        assert_eq!(result.attempts.len(), 5);
        assert_eq!(venue.placed_orders().len(), 5);
        assert!(result
            .attempts
            .iter()
            .all(|a| a.status == AttemptStatus::TimedOut));
        assert!(matches!(result.error, Some(EngineError::OrderRejected { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_offset_widens_each_attempt() {
        let venue = Arc::new(MockVenue::new());
        venue.set_behavior("acct-1", MockBehavior::NeverFill);
        let feed = feed_with_quote("BTC-USD", dec!(50000), dec!(50010));
        let exec = executor(Arc::clone(&venue), feed);

        let _ = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Limit)
            .await;

        let prices: Vec<Decimal> = venue
            .placed_orders()
            .iter()
            .map(|o| o.price.unwrap())
            .collect();
        // Long legs rest below the bid; widening offsets move them lower.
        for pair in prices.windows(2) {
            assert!(pair[1] <= pair[0], "offset narrowed: {pair:?}");
        }
        assert!(prices[0] < dec!(50000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_fills_after_polls() {
        let venue = Arc::new(MockVenue::new());
        venue.set_behavior("acct-1", MockBehavior::FillAfterPolls(2));
        let feed = feed_with_quote("BTC-USD", dec!(49999), dec!(50001));
        let exec = executor(Arc::clone(&venue), feed);

        let result = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Limit)
            .await;

        assert!(result.fill.is_some());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(result.attempts[0].status, AttemptStatus::Filled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_limit_retries_after_current_attempt() {
        let venue = Arc::new(MockVenue::new());
        venue.set_behavior("acct-1", MockBehavior::NeverFill);
        let feed = feed_with_quote("BTC-USD", dec!(49999), dec!(50001));
        let (tx, shutdown) = watch::channel(false);
        let exec = OrderExecutor::new(venue.clone(), feed, test_config(), shutdown);
        tx.send(true).unwrap();

        let result = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Limit)
            .await;

        // The in-flight attempt completes; no further ones start.
        assert!(result.fill.is_none());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(venue.placed_orders().len(), 1);
        assert!(venue
            .orders()
            .iter()
            .all(|(_, state)| state.status == OrderStatus::Canceled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_recovers_from_transient_placement_errors() {
        let venue = Arc::new(MockVenue::new());
        venue.set_behavior("acct-1", MockBehavior::FailPlacements(2));
        let feed = feed_with_quote("BTC-USD", dec!(49999), dec!(50001));
        let exec = executor(Arc::clone(&venue), feed);

        let result = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Limit)
            .await;

        assert!(result.fill.is_some());
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts[0].status, AttemptStatus::Rejected);
        assert_eq!(result.attempts[1].status, AttemptStatus::Rejected);
        assert_eq!(result.attempts[2].status, AttemptStatus::Filled);
    }

    #[tokio::test]
    async fn test_credential_failure_short_circuits() {
        let venue = Arc::new(MockVenue::new());
        venue.set_behavior("acct-1", MockBehavior::RejectCredentials);
        let feed = feed_with_quote("BTC-USD", dec!(49999), dec!(50001));
        let exec = executor(Arc::clone(&venue), feed);

        let result = exec
            .execute("acct-1", Side::Long, "BTC-USD", dec!(100), OrderMode::Limit)
            .await;

        assert!(result.is_credential_failure());
        assert_eq!(result.attempts.len(), 1);
        assert_eq!(venue.placed_orders().len(), 1);
    }

    #[test]
    fn test_backoff_non_decreasing_and_capped() {
        let venue: Arc<MockVenue> = Arc::new(MockVenue::new());
        let exec = executor(Arc::clone(&venue), PriceFeed::new());

        let delays: Vec<Duration> = (2..=6).map(|n| exec.backoff_delay(n)).collect();
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_unwind_places_reduce_only_opposite() {
        let venue = Arc::new(MockVenue::new());
        let exec = executor(Arc::clone(&venue), PriceFeed::new());

        let fill = exec
            .unwind("acct-1", Side::Long, "BTC-USD", dec!(0.5))
            .await
            .unwrap();
        assert_eq!(fill.quantity, dec!(0.5));

        let placed = venue.placed_orders();
        assert_eq!(placed.len(), 1);
        assert!(placed[0].reduce_only);
        assert_eq!(placed[0].side, Side::Short);
    }
}
