//! The trading API contract the engine executes against.
//!
//! Implementations handle signing, egress identity, and transport; the engine
//! only cares about placing, canceling, and querying orders, and about
//! whether a failure is worth retrying.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{OrderHandle, OrderRequest, OrderState};

/// Errors surfaced by a venue, pre-classified for the retry loop.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    /// Network hiccup, rate limit, venue overload. Worth another attempt.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// The venue refused the order itself. Terminal for this leg.
    #[error("order rejected by venue: {0}")]
    Rejected(String),

    /// The account's signing credentials were refused. Terminal for the
    /// account, not just the order.
    #[error("credentials rejected by venue")]
    CredentialInvalid,
}

impl VenueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::Transient(_))
    }
}

/// Order-execution primitives supplied by an external venue integration.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Place an order. A `None` price means immediate-or-cancel at the touch.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle, VenueError>;

    /// Cancel a resting order. Canceling an already-terminal order is not an
    /// error.
    async fn cancel_order(&self, handle: &OrderHandle) -> Result<(), VenueError>;

    /// Query current execution state of an order.
    async fn query_status(&self, handle: &OrderHandle) -> Result<OrderState, VenueError>;
}
