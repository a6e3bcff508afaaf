//! Concurrent leg execution and balance reconciliation.
//!
//! All legs of a batch run at the same time. Afterwards the coordinator
//! measures the filled long/short imbalance and corrects it: re-fire failed
//! legs on the deficit side, trim the overweight side back into tolerance,
//! or failing both unwind every position the batch opened. A batch never
//! ends with unhedged exposure unless the venue refuses the corrective
//! orders too; that case is marked `ExposureHeld` and surfaced as an
//! explicit error for the operator.

use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::batch::BatchTask;
use crate::error::EngineError;
use crate::exchange::Side;
use crate::strategy::executor::{LegResult, OrderExecutor};

/// How a batch ended, after any corrective action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Fills landed within tolerance, no correction needed.
    Completed,
    /// Overweight side trimmed back into tolerance.
    Rebalanced,
    /// Every position the batch opened was closed again.
    Unwound,
    /// Unwind orders themselves failed; residual exposure is being held.
    ExposureHeld,
    /// Nothing filled on either side.
    Failed,
}

impl BatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOutcome::Completed => "completed",
            BatchOutcome::Rebalanced => "rebalanced",
            BatchOutcome::Unwound => "unwound",
            BatchOutcome::ExposureHeld => "exposure_held",
            BatchOutcome::Failed => "failed",
        }
    }
}

/// One leg's requested size and what execution made of it.
#[derive(Debug)]
pub struct LegReport {
    pub account_id: String,
    pub side: Side,
    pub requested: Decimal,
    pub result: LegResult,
}

/// Full account of one batch: per-leg results plus the reconciled outcome.
#[derive(Debug)]
pub struct BatchReport {
    pub task_id: u64,
    pub market: String,
    pub outcome: BatchOutcome,
    pub legs: Vec<LegReport>,
    /// Set only when correction itself failed and exposure may remain.
    pub error: Option<EngineError>,
}

impl BatchReport {
    pub fn filled_notional(&self, side: Side) -> Decimal {
        self.legs
            .iter()
            .filter(|l| l.side == side)
            .map(|l| l.result.filled_notional())
            .sum()
    }

    /// Long minus short filled notional.
    pub fn imbalance(&self) -> Decimal {
        self.filled_notional(Side::Long) - self.filled_notional(Side::Short)
    }

    /// Accounts whose credentials the venue refused.
    pub fn credential_failures(&self) -> Vec<&str> {
        self.legs
            .iter()
            .filter(|l| l.result.is_credential_failure())
            .map(|l| l.account_id.as_str())
            .collect()
    }
}

/// Fold a corrective retry into a leg's original result, keeping the full
/// attempt history with continuous numbering.
fn merge_retry(original: &mut LegResult, retry: LegResult) {
    let offset = original.attempts.len() as u32;
    original
        .attempts
        .extend(retry.attempts.into_iter().map(|mut a| {
            a.attempt += offset;
            a
        }));
    original.fill = retry.fill;
    original.error = retry.error;
}

/// An open position left by a leg, tracked through corrective trades.
struct OpenPosition {
    account_id: String,
    side: Side,
    quantity: Decimal,
    price: Decimal,
}

/// Runs a batch's legs concurrently and guarantees a balanced (or flat)
/// end state.
pub struct HedgeCoordinator {
    executor: Arc<OrderExecutor>,
    tolerance: Decimal,
}

impl HedgeCoordinator {
    pub fn new(executor: Arc<OrderExecutor>, tolerance: Decimal) -> Self {
        Self {
            executor,
            tolerance,
        }
    }

    pub async fn run(&self, task: &BatchTask) -> BatchReport {
        let futures = task.legs.iter().map(|leg| {
            let executor = Arc::clone(&self.executor);
            let market = task.market.clone();
            let mode = task.mode;
            async move {
                executor
                    .execute(&leg.account_id, leg.side, &market, leg.notional, mode)
                    .await
            }
        });
        let results = join_all(futures).await;

        let mut legs = Vec::with_capacity(task.legs.len());
        for (leg, result) in task.legs.iter().zip(results) {
            legs.push(LegReport {
                account_id: leg.account_id.clone(),
                side: leg.side,
                requested: leg.notional,
                result,
            });
        }

        let mut report = BatchReport {
            task_id: task.id,
            market: task.market.clone(),
            outcome: BatchOutcome::Completed,
            legs,
            error: None,
        };

        let imbalance = report.imbalance();
        let any_fill = report.legs.iter().any(|l| l.result.fill.is_some());

        if !any_fill {
            warn!(task_id = task.id, market = %task.market, "No leg filled");
            report.outcome = BatchOutcome::Failed;
            return report;
        }

        if imbalance.abs() <= self.tolerance {
            debug!(
                task_id = task.id,
                imbalance = %imbalance,
                "Batch balanced within tolerance"
            );
            return report;
        }

        warn!(
            task_id = task.id,
            market = %task.market,
            imbalance = %imbalance,
            "Fill imbalance, correcting"
        );
        self.correct(task, &mut report, imbalance).await;
        report
    }

    /// Close the gap, cheapest first: re-fire failed deficit-side legs with a
    /// re-derived notional, then trim the overweight side, and as a last
    /// resort unwind every position the batch opened.
    async fn correct(&self, task: &BatchTask, report: &mut BatchReport, imbalance: Decimal) {
        let over_side = if imbalance > Decimal::ZERO {
            Side::Long
        } else {
            Side::Short
        };
        let mut excess = imbalance.abs();

        let deficit_side = over_side.flip();
        for leg in report.legs.iter_mut() {
            if excess <= self.tolerance {
                break;
            }
            if leg.side != deficit_side || !leg.result.is_retryable_failure() {
                continue;
            }
            // Immediate-or-cancel here: the correction path wants flatness
            // now, not a resting order.
            let notional = excess.min(leg.requested);
            debug!(
                task_id = task.id,
                account_id = %leg.account_id,
                notional = %notional,
                "Retrying failed leg to close the gap"
            );
            let retry = self
                .executor
                .execute(
                    &leg.account_id,
                    deficit_side,
                    &task.market,
                    notional,
                    crate::exchange::OrderMode::Market,
                )
                .await;
            if let Some(fill) = &retry.fill {
                excess -= fill.notional();
            }
            merge_retry(&mut leg.result, retry);
        }

        let mut positions: Vec<OpenPosition> = report
            .legs
            .iter()
            .filter_map(|l| {
                l.result.fill.as_ref().map(|f| OpenPosition {
                    account_id: l.account_id.clone(),
                    side: l.side,
                    quantity: f.quantity,
                    price: f.price,
                })
            })
            .collect();

        let mut trim_failed = false;

        for i in 0..positions.len() {
            if positions[i].side != over_side {
                continue;
            }
            if excess <= self.tolerance {
                break;
            }
            let cut = positions[i]
                .quantity
                .min((excess / positions[i].price).round_dp(6));
            if cut <= Decimal::ZERO {
                continue;
            }
            match self
                .executor
                .unwind(&positions[i].account_id, positions[i].side, &task.market, cut)
                .await
            {
                Ok(_) => {
                    positions[i].quantity -= cut;
                    excess -= cut * positions[i].price;
                    debug!(
                        task_id = task.id,
                        account_id = %positions[i].account_id,
                        cut = %cut,
                        remaining_excess = %excess,
                        "Trimmed overweight leg"
                    );
                }
                Err(e) => {
                    warn!(
                        task_id = task.id,
                        account_id = %positions[i].account_id,
                        error = %e,
                        "Trim failed, unwinding batch"
                    );
                    trim_failed = true;
                    break;
                }
            }
        }

        if trim_failed {
            self.unwind_all(task, report, positions).await;
            return;
        }

        if excess.abs() <= self.tolerance {
            info!(task_id = task.id, "Batch rebalanced");
            report.outcome = BatchOutcome::Rebalanced;
        } else {
            // Overweight fills exhausted without reaching tolerance.
            self.unwind_all(task, report, positions).await;
        }
    }

    /// Close every remaining position. Failures here leave real exposure and
    /// are escalated rather than swallowed.
    async fn unwind_all(
        &self,
        task: &BatchTask,
        report: &mut BatchReport,
        positions: Vec<OpenPosition>,
    ) {
        let mut residual = Decimal::ZERO;

        for position in &positions {
            if position.quantity <= Decimal::ZERO {
                continue;
            }
            if let Err(e) = self
                .executor
                .unwind(
                    &position.account_id,
                    position.side,
                    &task.market,
                    position.quantity,
                )
                .await
            {
                error!(
                    task_id = task.id,
                    account_id = %position.account_id,
                    quantity = %position.quantity,
                    error = %e,
                    "Unwind failed, position remains open"
                );
                let signed = position.quantity * position.price;
                residual += match position.side {
                    Side::Long => signed,
                    Side::Short => -signed,
                };
            }
        }

        if residual == Decimal::ZERO {
            info!(task_id = task.id, "Batch fully unwound");
            report.outcome = BatchOutcome::Unwound;
        } else {
            error!(task_id = task.id, residual = %residual, "Residual exposure after unwind");
            report.outcome = BatchOutcome::ExposureHeld;
            report.error = Some(EngineError::RebalanceImpossible {
                task_id: task.id,
                imbalance: residual,
            });
        }
    }
}
