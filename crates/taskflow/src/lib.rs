//! # Taskflow
//!
//! Concurrent task processing on Tokio: bounded queues, worker pools that
//! isolate per-task failures, pipelines chaining pools together, and
//! deadline-driven cooperative cancellation with leak-free shutdown.
//!
//! ## Features
//!
//! - `BoundedQueue<T>`: MPMC FIFO with backpressure, end-of-stream and rendezvous mode
//! - `WorkerPool`: N workers, one result per task, panics caught at the worker boundary
//! - `ShutdownCoordinator`: closes an output exactly once after its last writer exits
//! - `Pipeline`: stage k's output queue is stage k+1's input queue
//! - `DeadlineController`: time budgets that broadcast cancellation on expiry
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use taskflow::{EngineConfig, PipelineBuilder, Task, TaskError};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut pipeline = PipelineBuilder::new(EngineConfig::default())
//!     .filter(2, |n: &u64| n % 2 == 0)
//!     .stage(2, |task: Task<u64>| async move { Ok::<_, TaskError>(task.payload() * 2) })
//!     .build()?;
//!
//! for n in 1..=5 {
//!     pipeline.submit(n).await?;
//! }
//! pipeline.submit_and_close();
//!
//! for result in pipeline.await_all(Duration::from_secs(5)).await? {
//!     println!("{}: {:?}", result.task_id(), result.outcome());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//!
//! MIT License

pub mod classify;
pub mod config;
pub mod deadline;
pub mod error;
pub mod panic_trace;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod shutdown;
pub mod sink;
pub mod task;

#[cfg(test)]
pub(crate) mod test_utils;

pub use classify::{DefaultClassifier, ErrorClassifier};
pub use config::{DEFAULT_QUEUE_CAPACITY, EngineConfig};
pub use deadline::{DeadlineController, await_with_deadline};
pub use error::{ConfigError, EngineError, ErrorInfo, ErrorKind, TaskError, TaskFailure};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineReport, Submitter};
pub use pool::{PoolReport, PoolState, TaskFn, WorkerPool, WorkerPoolBuilder, WorkerState};
pub use queue::{BoundedQueue, PutError, QueueErrorKind, TryTake};
pub use shutdown::{CloseWatcher, ShutdownCoordinator, WorkerGuard};
pub use sink::{DropReason, DropSink, DroppedResult, LogDropSink, RecordingDropSink};
pub use task::{Intake, Task, TaskHandle, TaskId, TaskResult, WorkerId};

pub use tokio_util::sync::CancellationToken;
