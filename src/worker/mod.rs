//! Worker pool: symmetric consumers of the task queue.
//!
//! Every worker runs the same loop: pop a task, hand it to the hedge
//! coordinator, release the batch's accounts according to the outcome, and
//! persist the report. Workers stop when the queue is closed and drained,
//! which makes shutdown a natural drain with no task ever dropped.

use chrono::Utc;
use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::persistence::SqliteStore;
use crate::pool::{ReleaseOutcome, SharedPool};
use crate::queue::TaskReceiver;
use crate::strategy::{BatchOutcome, BatchReport, HedgeCoordinator};

/// Shared counters across all workers, for the stats log.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub tasks_processed: AtomicU64,
    pub completed: AtomicU64,
    pub rebalanced: AtomicU64,
    pub unwound: AtomicU64,
    pub exposure_held: AtomicU64,
    pub failed: AtomicU64,
}

impl WorkerStats {
    fn record(&self, outcome: BatchOutcome) {
        self.tasks_processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            BatchOutcome::Completed => &self.completed,
            BatchOutcome::Rebalanced => &self.rebalanced,
            BatchOutcome::Unwound => &self.unwound,
            BatchOutcome::ExposureHeld => &self.exposure_held,
            BatchOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Spawned worker tasks plus their shared counters.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    /// Spawn `count` identical workers consuming from `queue`.
    pub fn spawn(
        count: usize,
        queue: TaskReceiver,
        coordinator: Arc<HedgeCoordinator>,
        pool: SharedPool,
        store: Arc<SqliteStore>,
    ) -> Self {
        let stats = Arc::new(WorkerStats::default());

        let handles = (0..count)
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    queue: queue.clone(),
                    coordinator: Arc::clone(&coordinator),
                    pool: Arc::clone(&pool),
                    store: Arc::clone(&store),
                    stats: Arc::clone(&stats),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(count, "Worker pool started");
        Self { handles, stats }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Wait for every worker to finish draining.
    pub async fn join(self) {
        join_all(self.handles).await;
        info!("All workers stopped");
    }
}

struct Worker {
    worker_id: usize,
    queue: TaskReceiver,
    coordinator: Arc<HedgeCoordinator>,
    pool: SharedPool,
    store: Arc<SqliteStore>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    async fn run(self) {
        info!(worker_id = self.worker_id, "Worker started");

        while let Some(task) = self.queue.pop().await {
            let task_id = task.id;
            info!(
                worker_id = self.worker_id,
                task_id,
                market = %task.market,
                legs = task.legs.len(),
                notional = %task.notional,
                "Processing batch"
            );

            let report = self.coordinator.run(&task).await;

            if let Some(error) = &report.error {
                error!(worker_id = self.worker_id, task_id, %error, "Batch left residual exposure");
            }

            self.release_accounts(&report).await;
            self.stats.record(report.outcome);

            if let Err(e) = self.store.record_batch(&report) {
                warn!(worker_id = self.worker_id, task_id, error = %e, "Failed to persist batch report");
            }

            info!(
                worker_id = self.worker_id,
                task_id,
                outcome = report.outcome.as_str(),
                imbalance = %report.imbalance(),
                "Batch done"
            );
        }

        info!(worker_id = self.worker_id, "Queue drained, worker stopping");
    }

    /// Return every account in the batch to the pool. Credential failures
    /// disable the account; everything else rests through cooldown, since
    /// even a failed leg hit the venue.
    async fn release_accounts(&self, report: &BatchReport) {
        let now = Utc::now();
        let mut pool = self.pool.lock().await;
        for leg in &report.legs {
            let outcome = if leg.result.is_credential_failure() {
                ReleaseOutcome::Disabled
            } else {
                ReleaseOutcome::Cooldown
            };
            pool.release(&leg.account_id, outcome, now);
        }
    }
}
