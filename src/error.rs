//! Engine error taxonomy.
//!
//! Failures are classified by how far they propagate: soft tick-level
//! conditions stay inside the generator, per-attempt failures stay inside the
//! executor's retry loop, and only batch-level exposure problems reach the
//! operator log.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors produced by the batch scheduling and execution core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Not enough Available accounts to form a batch. Soft: the generator
    /// skips the tick and tries again on the next interval.
    #[error("insufficient accounts: {available} available, {needed} needed")]
    InsufficientAccounts { available: usize, needed: usize },

    /// The task queue has been closed for shutdown. Propagates as
    /// termination, not failure.
    #[error("task queue closed")]
    QueueClosed,

    /// An order was terminally rejected by the venue (retries exhausted for
    /// LIMIT mode, or the single IOC shot for MARKET mode).
    #[error("order rejected for account {account} on {market}: {reason}")]
    OrderRejected {
        account: String,
        market: String,
        reason: String,
    },

    /// The freshest quote for a market is older than the configured
    /// threshold; trading on it is refused.
    #[error("stale quote for {market}")]
    StaleQuote { market: String },

    /// The venue rejected the account's credentials. Fatal for the account:
    /// it transitions to Disabled and is never reconsidered.
    #[error("credentials rejected for account {account}")]
    CredentialInvalid { account: String },

    /// A batch could not be rebalanced and its filled legs could not be
    /// unwound. Exposure is being held; requires operator attention.
    #[error("rebalance impossible for task {task_id}: residual imbalance {imbalance}")]
    RebalanceImpossible { task_id: u64, imbalance: Decimal },
}

impl EngineError {
    /// True for conditions that are part of normal operation and should not
    /// be escalated beyond a debug/warn log.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientAccounts { .. } | EngineError::QueueClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_softness_classification() {
        assert!(EngineError::InsufficientAccounts {
            available: 2,
            needed: 5
        }
        .is_soft());
        assert!(EngineError::QueueClosed.is_soft());
        assert!(!EngineError::RebalanceImpossible {
            task_id: 1,
            imbalance: dec!(100)
        }
        .is_soft());
    }
}
