//! # Shutdown Coordinator
//!
//! Closes an output queue exactly once, after every worker writing to it has
//! finished. It is a join barrier: the coordinator holds one registration
//! hold, every worker holds a [`WorkerGuard`], and whoever releases the last
//! one closes the output.
//!
//! Guards release on `Drop`, so a worker that unwinds or whose task is
//! aborted still counts as finished and the output is never left open.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::queue::BoundedQueue;

struct Barrier<T> {
    name: String,
    output: BoundedQueue<T>,
    /// Registration hold plus live worker guards.
    outstanding: AtomicUsize,
    closed_tx: watch::Sender<bool>,
}

impl<T> Barrier<T> {
    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self.output.close() {
            debug!(coordinator = %self.name, "All writers finished, output closed");
        } else {
            warn!(coordinator = %self.name, "Output queue was closed by another owner");
        }
        self.closed_tx.send_replace(true);
    }
}

/// Owner of an output queue's closing.
///
/// Share one coordinator between several pools to let them fan in to the same
/// output queue. Enlist every writer, then [`seal`](Self::seal) it (dropping
/// the coordinator seals it too).
pub struct ShutdownCoordinator<T> {
    barrier: Arc<Barrier<T>>,
}

impl<T> ShutdownCoordinator<T> {
    pub fn new(name: impl Into<String>, output: BoundedQueue<T>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            barrier: Arc::new(Barrier {
                name: name.into(),
                output,
                outstanding: AtomicUsize::new(1),
                closed_tx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.barrier.name
    }

    /// The queue this coordinator closes.
    pub fn output(&self) -> &BoundedQueue<T> {
        &self.barrier.output
    }

    /// Register one more writer.
    ///
    /// Cannot race with the close: the coordinator's own hold keeps the
    /// count above zero until it is sealed.
    pub fn enlist(&self) -> WorkerGuard<T> {
        self.barrier.outstanding.fetch_add(1, Ordering::AcqRel);
        WorkerGuard {
            barrier: self.barrier.clone(),
        }
    }

    /// Number of writers still running, excluding the registration hold.
    pub fn active_writers(&self) -> usize {
        self.barrier
            .outstanding
            .load(Ordering::Acquire)
            .saturating_sub(1)
    }

    /// Observer of the close event that outlives the coordinator.
    pub fn watcher(&self) -> CloseWatcher {
        CloseWatcher {
            rx: self.barrier.closed_tx.subscribe(),
        }
    }

    /// Stop registering writers. The output closes when the last one finishes.
    pub fn seal(self) {
        drop(self);
    }
}

impl<T> Drop for ShutdownCoordinator<T> {
    fn drop(&mut self) {
        self.barrier.release();
    }
}

/// Held by one writer for as long as it may put into the output queue.
pub struct WorkerGuard<T> {
    barrier: Arc<Barrier<T>>,
}

impl<T> Drop for WorkerGuard<T> {
    fn drop(&mut self) {
        self.barrier.release();
    }
}

/// Reports when a coordinator has closed its output.
#[derive(Clone)]
pub struct CloseWatcher {
    rx: watch::Receiver<bool>,
}

impl CloseWatcher {
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the output has been closed.
    pub async fn closed(&mut self) {
        // The sender lives in the barrier, which is dropped only after the
        // close has been published.
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}
