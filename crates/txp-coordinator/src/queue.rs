//! The in-memory channel between admission and the train scheduler.
//!
//! Bounded, non-blocking on the enqueue side: a full queue is the primary
//! backpressure signal (`QueueFull`), and a draining scheduler refuses new
//! work (`ShuttingDown`). The receive side is handed to the scheduler task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use txp_schemas::WorkItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    QueueFull,
    ShuttingDown,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnqueueError::QueueFull => write!(f, "scheduler queue is full"),
            EnqueueError::ShuttingDown => write!(f, "scheduler is shutting down"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Enqueue-side handle. Cheap to clone; all clones share the shutdown flag.
#[derive(Clone)]
pub struct TrainQueue {
    tx: mpsc::Sender<WorkItem>,
    accepting: Arc<AtomicBool>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    capacity: usize,
}

/// Receive side, consumed by the scheduler loop.
pub struct TrainReceiver {
    pub rx: mpsc::Receiver<WorkItem>,
    pub shutdown: watch::Receiver<bool>,
}

impl TrainQueue {
    pub fn new(capacity: usize) -> (Self, TrainReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        (
            Self {
                tx,
                accepting: Arc::new(AtomicBool::new(true)),
                shutdown_tx: Arc::new(shutdown_tx),
                capacity,
            },
            TrainReceiver {
                rx,
                shutdown: shutdown_rx,
            },
        )
    }

    /// Non-blocking enqueue.
    pub fn try_enqueue(&self, item: WorkItem) -> Result<(), EnqueueError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EnqueueError::ShuttingDown);
        }

        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::ShuttingDown),
        }
    }

    /// Items currently buffered and not yet taken by the scheduler.
    pub fn depth(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop accepting enqueues and signal the scheduler to drain.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
    }
}
