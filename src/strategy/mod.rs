//! Order execution and hedge coordination.
//!
//! `OrderExecutor` drives a single account's order through its retry state
//! machine; `HedgeCoordinator` fans a batch's legs out concurrently and
//! reconciles the outcomes so no batch ever finishes with unhedged exposure.

mod executor;
mod hedge;

pub use executor::{AttemptRecord, AttemptStatus, LegFill, LegResult, OrderExecutor};
pub use hedge::{BatchOutcome, BatchReport, HedgeCoordinator, LegReport};
