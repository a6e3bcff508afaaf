//! Order and market-data types shared across the engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a position or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The opposite direction (used when unwinding a filled leg).
    pub fn flip(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// How orders are placed.
///
/// LIMIT rests on the book for a lower fee and retries with adaptive pricing;
/// MARKET fires a single immediate-or-cancel shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderMode {
    Limit,
    Market,
}

/// A request to place one order for one account.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub account_id: String,
    pub market: String,
    pub side: Side,
    /// Resting price for LIMIT orders; `None` means immediate-or-cancel at
    /// the touch.
    pub price: Option<Decimal>,
    pub quantity: Decimal,
    /// Closing order that must not increase exposure.
    pub reduce_only: bool,
}

/// Opaque handle to an order accepted by the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    pub order_id: u64,
    pub account_id: String,
    pub market: String,
}

/// Venue-side order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

/// Snapshot of an order's execution state.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
}

impl OrderState {
    pub fn filled_notional(&self) -> Decimal {
        self.filled_qty * self.avg_price
    }
}

/// Best bid/ask for a market at a point in time.
#[derive(Debug, Clone)]
pub struct Quote {
    pub market: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}
