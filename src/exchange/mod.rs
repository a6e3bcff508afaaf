//! Venue-facing layer: order types, the trading API contract, the live
//! price feed, and an in-memory venue for paper trading and tests.
//!
//! Real exchange connectivity (signing, transport, proxies) lives outside
//! this crate; everything here talks to the venue through [`ExchangeApi`].

pub mod feed;
pub mod mock;
mod traits;
mod types;

pub use feed::PriceFeed;
pub use mock::{MockBehavior, MockVenue};
pub use traits::{ExchangeApi, VenueError};
pub use types::*;
