//! Bounded FIFO queue of batch tasks.
//!
//! Built on a tokio mpsc channel: `push` applies backpressure when the queue
//! is at capacity, `pop` waits when it is empty. Closing happens by dropping
//! the producer half; consumers drain whatever remains and then observe
//! end-of-stream. FIFO across tasks is the only ordering guarantee.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::batch::BatchTask;
use crate::error::EngineError;

/// Why a `push_timeout` did not enqueue; the task comes back so the caller
/// can roll back its reservation.
#[derive(Debug)]
pub enum PushError {
    /// Queue stayed full for the whole timeout (backpressure bound hit).
    Timeout(BatchTask),
    /// Queue closed for shutdown.
    Closed(BatchTask),
}

/// Producer half, held by the batch generator.
#[derive(Clone)]
pub struct TaskSender {
    tx: mpsc::Sender<BatchTask>,
    depth: Arc<AtomicUsize>,
}

/// Consumer half, shared by all workers.
#[derive(Clone)]
pub struct TaskReceiver {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<BatchTask>>>,
    depth: Arc<AtomicUsize>,
}

/// Create a bounded task queue.
pub fn bounded(capacity: usize) -> (TaskSender, TaskReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    (
        TaskSender {
            tx,
            depth: Arc::clone(&depth),
        },
        TaskReceiver {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            depth,
        },
    )
}

impl TaskSender {
    /// Enqueue, waiting as long as it takes when the queue is full.
    pub async fn push(&self, task: BatchTask) -> Result<(), EngineError> {
        self.tx
            .send(task)
            .await
            .map_err(|_| EngineError::QueueClosed)?;
        self.depth.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue with a bound on how long backpressure may hold the producer.
    pub async fn push_timeout(&self, task: BatchTask, timeout: Duration) -> Result<(), PushError> {
        match self.tx.send_timeout(task, timeout).await {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(task)) => Err(PushError::Timeout(task)),
            Err(SendTimeoutError::Closed(task)) => Err(PushError::Closed(task)),
        }
    }

    /// Tasks currently enqueued (approximate, for the stats log).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl TaskReceiver {
    /// Dequeue the next task in FIFO order; `None` once the queue is closed
    /// and drained.
    pub async fn pop(&self) -> Option<BatchTask> {
        let task = self.rx.lock().await.recv().await;
        if task.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        task
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}
