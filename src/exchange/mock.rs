//! In-memory venue for paper trading and tests.
//!
//! Behavior is scripted per account so tests can exercise the executor's
//! retry loop and the coordinator's rebalance/unwind paths without a network:
//! fills can be immediate, delayed by a number of status polls, withheld
//! entirely, or replaced by venue/credential rejections.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::traits::{ExchangeApi, VenueError};
use super::types::{OrderHandle, OrderRequest, OrderState, OrderStatus};

/// Scripted venue behavior, keyed by account id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Every order fills in full as soon as it is placed.
    FillImmediately,
    /// Resting orders fill after this many status queries; IOC orders fill
    /// immediately.
    FillAfterPolls(u32),
    /// Resting orders never fill; IOC orders cancel unfilled.
    NeverFill,
    /// `place_order` fails with a transient error.
    TransientError,
    /// The next N placements fail transiently, then orders fill immediately.
    FailPlacements(u32),
    /// The first N placements fill immediately, later ones fail transiently.
    FailAfterPlacements(u32),
    /// `place_order` fails with a venue rejection.
    RejectOrder,
    /// `place_order` fails with a credential rejection.
    RejectCredentials,
}

#[derive(Debug)]
struct MockOrder {
    request: OrderRequest,
    state: OrderState,
    polls_until_fill: Option<u32>,
    fill_price: Decimal,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    orders: HashMap<u64, MockOrder>,
    behaviors: HashMap<String, MockBehavior>,
    marks: HashMap<String, Decimal>,
    placed: Vec<OrderRequest>,
}

/// Deterministic in-memory exchange.
pub struct MockVenue {
    inner: Mutex<Inner>,
    default_behavior: MockBehavior,
}

impl MockVenue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            default_behavior: MockBehavior::FillImmediately,
        }
    }

    pub fn with_default_behavior(behavior: MockBehavior) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            default_behavior: behavior,
        }
    }

    /// Script the behavior for one account's orders.
    pub fn set_behavior(&self, account_id: &str, behavior: MockBehavior) {
        self.inner
            .lock()
            .unwrap()
            .behaviors
            .insert(account_id.to_string(), behavior);
    }

    /// Reference price used to fill IOC orders (default 100).
    pub fn set_mark(&self, market: &str, price: Decimal) {
        self.inner
            .lock()
            .unwrap()
            .marks
            .insert(market.to_string(), price);
    }

    /// Every request that reached `place_order`, in order.
    pub fn placed_orders(&self) -> Vec<OrderRequest> {
        self.inner.lock().unwrap().placed.clone()
    }

    /// Snapshot of all accepted orders and their current state.
    pub fn orders(&self) -> Vec<(OrderRequest, OrderState)> {
        let inner = self.inner.lock().unwrap();
        inner
            .orders
            .values()
            .map(|o| (o.request.clone(), o.state.clone()))
            .collect()
    }

    /// Signed net quantity across all accounts on a market: long fills add,
    /// short fills subtract.
    pub fn net_market_qty(&self, market: &str) -> Decimal {
        let inner = self.inner.lock().unwrap();
        inner
            .orders
            .values()
            .filter(|o| o.request.market == market)
            .map(|o| match o.request.side {
                super::types::Side::Long => o.state.filled_qty,
                super::types::Side::Short => -o.state.filled_qty,
            })
            .sum()
    }

    fn behavior_for(&self, inner: &Inner, account_id: &str) -> MockBehavior {
        inner
            .behaviors
            .get(account_id)
            .copied()
            .unwrap_or(self.default_behavior)
    }
}

impl Default for MockVenue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeApi for MockVenue {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderHandle, VenueError> {
        let mut inner = self.inner.lock().unwrap();
        inner.placed.push(request.clone());

        match inner.behaviors.get_mut(&request.account_id) {
            Some(MockBehavior::FailPlacements(n)) => {
                if *n > 0 {
                    *n -= 1;
                    return Err(VenueError::Transient("connection reset".to_string()));
                }
            }
            Some(MockBehavior::FailAfterPlacements(n)) => {
                if *n == 0 {
                    return Err(VenueError::Transient("connection reset".to_string()));
                }
                *n -= 1;
            }
            _ => {}
        }

        let behavior = self.behavior_for(&inner, &request.account_id);
        match behavior {
            MockBehavior::TransientError => {
                return Err(VenueError::Transient("connection reset".to_string()))
            }
            MockBehavior::RejectOrder => {
                return Err(VenueError::Rejected("order refused".to_string()))
            }
            MockBehavior::RejectCredentials => return Err(VenueError::CredentialInvalid),
            _ => {}
        }

        let mark = inner
            .marks
            .get(&request.market)
            .copied()
            .unwrap_or(dec!(100));
        let fill_price = request.price.unwrap_or(mark);
        let is_ioc = request.price.is_none();

        let (state, polls_until_fill) = match behavior {
            // Unexhausted failure budgets fill like the default.
            MockBehavior::FillImmediately
            | MockBehavior::FailPlacements(_)
            | MockBehavior::FailAfterPlacements(_) => (
                OrderState {
                    status: OrderStatus::Filled,
                    filled_qty: request.quantity,
                    avg_price: fill_price,
                },
                None,
            ),
            MockBehavior::FillAfterPolls(_) if is_ioc => (
                OrderState {
                    status: OrderStatus::Filled,
                    filled_qty: request.quantity,
                    avg_price: fill_price,
                },
                None,
            ),
            MockBehavior::FillAfterPolls(n) => (
                OrderState {
                    status: OrderStatus::New,
                    filled_qty: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                },
                Some(n),
            ),
            MockBehavior::NeverFill if is_ioc => (
                OrderState {
                    status: OrderStatus::Canceled,
                    filled_qty: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                },
                None,
            ),
            MockBehavior::NeverFill => (
                OrderState {
                    status: OrderStatus::New,
                    filled_qty: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                },
                None,
            ),
            // Rejection variants returned above.
            _ => unreachable!(),
        };

        inner.next_id += 1;
        let order_id = inner.next_id;
        inner.orders.insert(
            order_id,
            MockOrder {
                request: request.clone(),
                state,
                polls_until_fill,
                fill_price,
            },
        );

        Ok(OrderHandle {
            order_id,
            account_id: request.account_id.clone(),
            market: request.market.clone(),
        })
    }

    async fn cancel_order(&self, handle: &OrderHandle) -> Result<(), VenueError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(order) = inner.orders.get_mut(&handle.order_id) {
            if matches!(
                order.state.status,
                OrderStatus::New | OrderStatus::PartiallyFilled
            ) {
                order.state.status = OrderStatus::Canceled;
            }
        }
        Ok(())
    }

    async fn query_status(&self, handle: &OrderHandle) -> Result<OrderState, VenueError> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .get_mut(&handle.order_id)
            .ok_or_else(|| VenueError::Rejected("unknown order".to_string()))?;

        if order.state.status == OrderStatus::New {
            if let Some(polls) = order.polls_until_fill.as_mut() {
                if *polls <= 1 {
                    order.state = OrderState {
                        status: OrderStatus::Filled,
                        filled_qty: order.request.quantity,
                        avg_price: order.fill_price,
                    };
                    order.polls_until_fill = None;
                } else {
                    *polls -= 1;
                }
            }
        }

        Ok(order.state.clone())
    }
}
