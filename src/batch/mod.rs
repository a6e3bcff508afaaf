//! Batch construction: hedge-balanced partitioning of reserved accounts and
//! the periodic generator that feeds the task queue.
//!
//! A batch's long legs and short legs always sum to exactly the same
//! notional. Splitting is done in integer cents (see `utils::decimal`), so
//! the balance invariant holds with zero tolerance at generation time.

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::error::EngineError;
use crate::exchange::{OrderMode, Side};
use crate::pool::{Account, ReleaseOutcome, SharedPool};
use crate::queue::{PushError, TaskSender};
use crate::utils::decimal::{even_cents, split_by_weights};

/// One account's single-sided order within a batch.
#[derive(Debug, Clone)]
pub struct Leg {
    pub account_id: String,
    pub side: Side,
    pub notional: Decimal,
}

/// A hedge-balanced group of orders, consumed exactly once by a worker.
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub id: u64,
    pub market: String,
    /// Total batch notional; each side carries exactly half.
    pub notional: Decimal,
    pub mode: OrderMode,
    pub legs: Vec<Leg>,
    pub created_at: DateTime<Utc>,
}

impl BatchTask {
    pub fn side_notional(&self, side: Side) -> Decimal {
        self.legs
            .iter()
            .filter(|l| l.side == side)
            .map(|l| l.notional)
            .sum()
    }

    pub fn side_count(&self, side: Side) -> usize {
        self.legs.iter().filter(|l| l.side == side).count()
    }

    /// Long and short totals match within `tolerance`.
    pub fn is_balanced(&self, tolerance: Decimal) -> bool {
        (self.side_notional(Side::Long) - self.side_notional(Side::Short)).abs() <= tolerance
    }
}

/// Partition reserved accounts into balanced long/short legs.
///
/// `long_count = n / 2`; the short side takes the extra account when `n` is
/// odd. Each side receives exactly half of `total` (which must be an even
/// number of cents), split across its legs with randomized weights in
/// `1 ± variation` so sizes differ account to account while the side totals
/// stay exact.
pub fn build_legs(accounts: &[Account], total: Decimal, variation: f64) -> Vec<Leg> {
    debug_assert!(accounts.len() >= 2);

    let long_count = accounts.len() / 2;
    let half = total / Decimal::TWO;
    let mut rng = rand::thread_rng();

    let weights = |n: usize, rng: &mut rand::rngs::ThreadRng| -> Vec<f64> {
        (0..n)
            .map(|_| (1.0 + rng.gen_range(-variation..=variation)).max(0.3))
            .collect()
    };

    let long_amounts = split_by_weights(half, &weights(long_count, &mut rng));
    let short_amounts = split_by_weights(half, &weights(accounts.len() - long_count, &mut rng));

    let mut legs = Vec::with_capacity(accounts.len());
    for (account, notional) in accounts[..long_count].iter().zip(long_amounts) {
        legs.push(Leg {
            account_id: account.id.clone(),
            side: Side::Long,
            notional,
        });
    }
    for (account, notional) in accounts[long_count..].iter().zip(short_amounts) {
        legs.push(Leg {
            account_id: account.id.clone(),
            side: Side::Short,
            notional,
        });
    }
    legs
}

/// Periodically reserves accounts and emits balanced batch tasks.
pub struct BatchGenerator {
    pool: SharedPool,
    queue: TaskSender,
    config: BatchConfig,
    mode: OrderMode,
    shutdown: watch::Receiver<bool>,
    next_task_id: u64,
    generated: u64,
}

impl BatchGenerator {
    pub fn new(
        pool: SharedPool,
        queue: TaskSender,
        config: BatchConfig,
        mode: OrderMode,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            queue,
            config,
            mode,
            shutdown,
            next_task_id: 0,
            generated: 0,
        }
    }

    /// Generation loop. Returns the number of tasks emitted. Dropping `self`
    /// on exit releases the producer half of the queue.
    pub async fn run(mut self) -> u64 {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.generation_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(()) => {}
                        Err(EngineError::QueueClosed) => break,
                        Err(e) if e.is_soft() => debug!(error = %e, "Tick skipped"),
                        Err(e) => warn!(error = %e, "Batch generation failed"),
                    }
                }
            }
        }

        info!(generated = self.generated, "Batch generator stopped");
        self.generated
    }

    /// One generation attempt: reserve, partition, enqueue (with rollback on
    /// backpressure timeout).
    pub async fn tick(&mut self) -> Result<(), EngineError> {
        let (size, market, total) = {
            let mut rng = rand::thread_rng();
            let size = rng.gen_range(self.config.size_min..=self.config.size_max);
            let market = self
                .config
                .markets
                .choose(&mut rng)
                .cloned()
                .unwrap_or_else(|| "BTC-USD".to_string());
            let lo = self.config.notional_min.to_f64().unwrap_or(1000.0);
            let hi = self.config.notional_max.to_f64().unwrap_or(lo);
            let notional = rng.gen_range(lo..=hi.max(lo));
            let total = even_cents(Decimal::from_f64(notional).unwrap_or(self.config.notional_min));
            (size, market, total)
        };

        let now = Utc::now();
        let reserved = self.pool.lock().await.reserve(size, now)?;

        let legs = build_legs(&reserved, total, self.config.size_variation);
        self.next_task_id += 1;
        let task = BatchTask {
            id: self.next_task_id,
            market: market.clone(),
            notional: total,
            mode: self.mode,
            legs,
            created_at: now,
        };
        debug_assert!(task.is_balanced(Decimal::ZERO));

        let timeout = Duration::from_secs(self.config.enqueue_timeout_secs);
        match self.queue.push_timeout(task, timeout).await {
            Ok(()) => {
                self.generated += 1;
                debug!(
                    task_id = self.next_task_id,
                    market = %market,
                    accounts = reserved.len(),
                    notional = %total,
                    "Batch queued"
                );
                Ok(())
            }
            Err(PushError::Timeout(task)) => {
                // Backpressure bound hit: roll the reservation back without
                // cooldown, the accounts never traded.
                warn!(task_id = task.id, "Queue full past timeout, abandoning tick");
                let mut pool = self.pool.lock().await;
                for leg in &task.legs {
                    pool.release(&leg.account_id, ReleaseOutcome::Immediate, Utc::now());
                }
                Ok(())
            }
            Err(PushError::Closed(task)) => {
                let mut pool = self.pool.lock().await;
                for leg in &task.legs {
                    pool.release(&leg.account_id, ReleaseOutcome::Immediate, Utc::now());
                }
                Err(EngineError::QueueClosed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn accounts(n: usize) -> Vec<Account> {
        (0..n)
            .map(|i| Account::new(format!("acct-{i:02}"), format!("key-{i:02}")))
            .collect()
    }

    #[test]
    fn test_even_batch_balances_exactly() {
        let legs = build_legs(&accounts(6), dec!(600.00), 0.3);

        let long: Decimal = legs
            .iter()
            .filter(|l| l.side == Side::Long)
            .map(|l| l.notional)
            .sum();
        let short: Decimal = legs
            .iter()
            .filter(|l| l.side == Side::Short)
            .map(|l| l.notional)
            .sum();

        assert_eq!(legs.iter().filter(|l| l.side == Side::Long).count(), 3);
        assert_eq!(legs.iter().filter(|l| l.side == Side::Short).count(), 3);
        assert_eq!(long, dec!(300.00));
        assert_eq!(short, dec!(300.00));
    }

    #[test]
    fn test_odd_batch_short_side_takes_extra() {
        let legs = build_legs(&accounts(7), dec!(1000.00), 0.4);

        assert_eq!(legs.iter().filter(|l| l.side == Side::Long).count(), 3);
        assert_eq!(legs.iter().filter(|l| l.side == Side::Short).count(), 4);

        let long: Decimal = legs
            .iter()
            .filter(|l| l.side == Side::Long)
            .map(|l| l.notional)
            .sum();
        let short: Decimal = legs
            .iter()
            .filter(|l| l.side == Side::Short)
            .map(|l| l.notional)
            .sum();
        assert_eq!(long, short);
    }

    #[test]
    fn test_balance_holds_across_random_sizes() {
        for n in 2..=9 {
            for _ in 0..20 {
                let legs = build_legs(&accounts(n), dec!(1111.42), 0.4);
                let task = BatchTask {
                    id: 1,
                    market: "BTC-USD".to_string(),
                    notional: dec!(1111.42),
                    mode: OrderMode::Market,
                    legs,
                    created_at: Utc::now(),
                };
                assert!(task.is_balanced(Decimal::ZERO), "imbalanced at n={n}");
            }
        }
    }

    #[tokio::test]
    async fn test_insufficient_accounts_is_a_soft_skip() {
        use crate::pool::AccountPool;

        let pool = AccountPool::new(accounts(2), chrono::Duration::seconds(60), 5).into_shared();
        let (tx, _rx) = crate::queue::bounded(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = BatchConfig {
            size_min: 5,
            size_max: 5,
            notional_min: dec!(500),
            notional_max: dec!(500),
            size_variation: 0.3,
            generation_interval_secs: 1,
            enqueue_timeout_secs: 1,
            markets: vec!["BTC-USD".to_string()],
        };
        let mut generator =
            BatchGenerator::new(pool, tx, config, OrderMode::Market, shutdown_rx);

        let err = generator.tick().await.unwrap_err();
        assert!(err.is_soft(), "tick starvation must stay a soft condition");
    }

    #[test]
    fn test_zero_variation_splits_evenly() {
        let legs = build_legs(&accounts(4), dec!(400.00), 0.0);
        for leg in &legs {
            assert_eq!(leg.notional, dec!(100.00));
        }
    }
}
