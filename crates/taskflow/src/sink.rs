//! Accounting for results that could not be delivered.
//!
//! A worker never silently discards a result. When the output queue is
//! closed, or a cancelled pool cannot hand a result over in time, the result
//! is reported to a [`DropSink`] instead.

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::ErrorKind;
use crate::task::{TaskId, WorkerId};

/// Why a result was not delivered to the output queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The output queue was already closed.
    OutputClosed,
    /// The pool was cancelled and the output queue stayed full.
    Cancelled,
    /// The consumer stopped reading before end-of-stream.
    Abandoned,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::OutputClosed => write!(f, "output closed"),
            DropReason::Cancelled => write!(f, "cancelled"),
            DropReason::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Summary of an undeliverable result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedResult {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    /// `None` when the dropped result was a success.
    pub error_kind: Option<ErrorKind>,
    pub reason: DropReason,
}

/// Receiver of undeliverable results.
pub trait DropSink: Send + Sync + 'static {
    fn on_drop(&self, dropped: DroppedResult);
}

/// Logs every dropped result at `warn` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDropSink;

impl DropSink for LogDropSink {
    fn on_drop(&self, dropped: DroppedResult) {
        warn!(
            task_id = dropped.task_id,
            worker = dropped.worker_id,
            error_kind = ?dropped.error_kind,
            reason = %dropped.reason,
            "Result dropped"
        );
    }
}

/// Keeps dropped results for later inspection, and logs them.
#[derive(Debug, Default)]
pub struct RecordingDropSink {
    dropped: Mutex<Vec<DroppedResult>>,
}

impl RecordingDropSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.dropped.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dropped.lock().is_empty()
    }

    /// Snapshot of everything dropped so far.
    pub fn dropped(&self) -> Vec<DroppedResult> {
        self.dropped.lock().clone()
    }
}

impl DropSink for RecordingDropSink {
    fn on_drop(&self, dropped: DroppedResult) {
        LogDropSink.on_drop(dropped.clone());
        self.dropped.lock().push(dropped);
    }
}
