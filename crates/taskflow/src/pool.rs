//! # Worker Pool
//!
//! A fixed set of Tokio tasks consuming one input queue and writing one
//! [`TaskResult`] per task to an output queue.
//!
//! Every worker:
//! - takes an item, checks for cancellation at the task boundary, and runs it;
//! - catches panics from task logic and records them as `Unclassified`;
//! - maps errors through the pool's [`ErrorClassifier`];
//! - forwards upstream failures untouched;
//! - reports results it cannot deliver to the pool's [`DropSink`].
//!
//! Workers exit when the input reaches end-of-stream. The output queue is
//! closed by a [`ShutdownCoordinator`] once the last worker writing to it has
//! exited, so a pool never closes an output another pool is still feeding.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::classify::{DefaultClassifier, ErrorClassifier, classify_error, classify_panic};
use crate::config::EngineConfig;
use crate::error::{ConfigError, ErrorInfo, TaskError};
use crate::panic_trace;
use crate::queue::{BoundedQueue, PutError, QueueErrorKind};
use crate::shutdown::{CloseWatcher, ShutdownCoordinator, WorkerGuard};
use crate::sink::{DropReason, DropSink, DroppedResult, LogDropSink};
use crate::task::{Intake, Task, TaskResult, WorkerId};

/// Task execution logic run by a pool.
///
/// Implemented for async closures `Fn(Task<P>) -> impl Future<Output =
/// Result<O, TaskError>>`. Use [`WorkerPoolBuilder::spawn_blocking`] for
/// synchronous, CPU-bound logic.
#[async_trait]
pub trait TaskFn<P, O>: Send + Sync + 'static {
    async fn call(&self, task: Task<P>) -> Result<O, TaskError>;
}

#[async_trait]
impl<P, O, F, Fut> TaskFn<P, O> for F
where
    F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, TaskError>> + Send + 'static,
    P: Send + 'static,
    O: Send + 'static,
{
    async fn call(&self, task: Task<P>) -> Result<O, TaskError> {
        self(task).await
    }
}

/// How a stage failed, before classification.
pub(crate) enum StageFailure {
    /// Returned by task logic; goes through the classifier.
    Error(TaskError),
    /// Already classified, e.g. a panic caught on a blocking thread.
    Fault(ErrorInfo),
}

/// What a pool actually runs. `Ok(None)` filters the task out.
#[async_trait]
pub(crate) trait StageFn<P, O>: Send + Sync + 'static {
    async fn run(&self, task: Task<P>) -> Result<Option<O>, StageFailure>;
}

pub(crate) struct MapStage<F>(pub(crate) F);

#[async_trait]
impl<P, O, F> StageFn<P, O> for MapStage<F>
where
    F: TaskFn<P, O>,
    P: Send + 'static,
    O: Send + 'static,
{
    async fn run(&self, task: Task<P>) -> Result<Option<O>, StageFailure> {
        self.0.call(task).await.map(Some).map_err(StageFailure::Error)
    }
}

pub(crate) struct FilterStage<F>(pub(crate) F);

#[async_trait]
impl<P, F> StageFn<P, P> for FilterStage<F>
where
    F: Fn(&P) -> bool + Send + Sync + 'static,
    P: Send + 'static,
{
    async fn run(&self, task: Task<P>) -> Result<Option<P>, StageFailure> {
        if (self.0)(task.payload()) {
            Ok(Some(task.into_payload()))
        } else {
            Ok(None)
        }
    }
}

/// Runs synchronous logic on Tokio's blocking thread pool.
pub(crate) struct BlockingStage<F> {
    func: Arc<F>,
    capture_traces: bool,
}

impl<F> BlockingStage<F> {
    pub(crate) fn new(func: F, capture_traces: bool) -> Self {
        Self {
            func: Arc::new(func),
            capture_traces,
        }
    }
}

#[async_trait]
impl<P, O, F> StageFn<P, O> for BlockingStage<F>
where
    F: Fn(Task<P>) -> Result<O, TaskError> + Send + Sync + 'static,
    P: Send + 'static,
    O: Send + 'static,
{
    async fn run(&self, task: Task<P>) -> Result<Option<O>, StageFailure> {
        let func = self.func.clone();
        let capture_traces = self.capture_traces;
        let joined = tokio::task::spawn_blocking(move || {
            if capture_traces {
                panic_trace::clear();
            }
            std::panic::catch_unwind(AssertUnwindSafe(|| (*func)(task))).map_err(|payload| {
                let trace = if capture_traces {
                    panic_trace::take()
                } else {
                    None
                };
                classify_panic(payload, trace)
            })
        })
        .await;

        match joined {
            Ok(Ok(Ok(output))) => Ok(Some(output)),
            Ok(Ok(Err(err))) => Err(StageFailure::Error(err)),
            Ok(Err(fault)) => Err(StageFailure::Fault(fault)),
            Err(join_err) if join_err.is_panic() => Err(StageFailure::Fault(classify_panic(
                join_err.into_panic(),
                None,
            ))),
            Err(_) => Err(StageFailure::Fault(ErrorInfo::cancelled(
                "blocking task was aborted",
            ))),
        }
    }
}

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Accepting work.
    Open,
    /// Input closed or cancellation requested; workers are finishing.
    Draining,
    /// Every worker has exited and the output is closed.
    Closed,
}

/// What one worker is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Finished,
}

/// Per-worker tallies, summed into a [`PoolReport`] at join.
#[derive(Debug, Default, Clone, Copy)]
struct WorkerSummary {
    completed: usize,
    failed: usize,
    cancelled: usize,
    forwarded: usize,
    filtered: usize,
    dropped: usize,
}

/// Final accounting of a pool run.
///
/// Every task taken from the input is counted exactly once among
/// `completed`, `failed`, `cancelled`, `forwarded` and `filtered`. `dropped`
/// counts the subset of those results that could not be delivered.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub name: String,
    /// Tasks that ran and succeeded.
    pub completed: usize,
    /// Tasks that ran and failed, panics included.
    pub failed: usize,
    /// Tasks turned into `Cancelled` results without running.
    pub cancelled: usize,
    /// Upstream failures passed through.
    pub forwarded: usize,
    /// Tasks a filter stage removed.
    pub filtered: usize,
    /// Results handed to the drop sink.
    pub dropped: usize,
    /// Workers whose Tokio task did not return normally.
    pub lost_workers: usize,
}

impl PoolReport {
    /// Number of tasks taken from the input.
    pub fn processed(&self) -> usize {
        self.completed + self.failed + self.cancelled + self.forwarded + self.filtered
    }

    /// Number of results written to the output.
    pub fn delivered(&self) -> usize {
        self.completed + self.failed + self.cancelled + self.forwarded - self.dropped
    }

    fn absorb(&mut self, summary: WorkerSummary) {
        self.completed += summary.completed;
        self.failed += summary.failed;
        self.cancelled += summary.cancelled;
        self.forwarded += summary.forwarded;
        self.filtered += summary.filtered;
        self.dropped += summary.dropped;
    }

    pub(crate) fn merge(&mut self, other: &PoolReport) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.forwarded += other.forwarded;
        self.filtered += other.filtered;
        self.dropped += other.dropped;
        self.lost_workers += other.lost_workers;
    }
}

/// Configures and spawns a [`WorkerPool`].
///
/// `I` is the item type of the input queue, either [`Task`] or the
/// [`TaskResult`] of an upstream pool.
pub struct WorkerPoolBuilder<I: Intake, O> {
    name: String,
    input: BoundedQueue<I>,
    output: BoundedQueue<TaskResult<O>>,
    workers: usize,
    classifier: Arc<dyn ErrorClassifier>,
    drop_sink: Arc<dyn DropSink>,
    token: CancellationToken,
    drain_timeout: Duration,
    capture_traces: bool,
    await_input_close: bool,
}

impl<I, O> WorkerPoolBuilder<I, O>
where
    I: Intake,
    O: Send + 'static,
{
    fn new(input: BoundedQueue<I>, output: BoundedQueue<TaskResult<O>>) -> Self {
        let defaults = EngineConfig::default();
        Self {
            name: "pool".to_string(),
            input,
            output,
            workers: defaults.worker_count,
            classifier: Arc::new(DefaultClassifier),
            drop_sink: Arc::new(LogDropSink),
            token: CancellationToken::new(),
            drain_timeout: defaults.drain_timeout(),
            capture_traces: defaults.capture_traces,
            await_input_close: false,
        }
    }

    /// Name used in logs and reports.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Apply worker count, drain timeout and trace capture from `config`.
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.workers = config.worker_count;
        self.drain_timeout = config.drain_timeout();
        self.capture_traces = config.capture_traces;
        self
    }

    pub fn classifier(self, classifier: impl ErrorClassifier) -> Self {
        self.shared_classifier(Arc::new(classifier))
    }

    pub fn shared_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn drop_sink(mut self, drop_sink: Arc<dyn DropSink>) -> Self {
        self.drop_sink = drop_sink;
        self
    }

    /// Token observed by every worker. Defaults to a fresh token.
    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Grace period for delivering results after cancellation.
    pub fn drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn capture_traces(mut self, capture_traces: bool) -> Self {
        self.capture_traces = capture_traces;
        self
    }

    /// After cancellation, wait for the input to reach end-of-stream instead
    /// of giving up after the drain timeout.
    ///
    /// Only for inputs whose writer is guaranteed to close them, such as the
    /// output of an upstream pool. Otherwise items written after the workers
    /// exit are never read.
    pub fn await_input_close(mut self, await_input_close: bool) -> Self {
        self.await_input_close = await_input_close;
        self
    }

    /// Start the workers. The pool closes its output when they have all exited.
    pub fn spawn<F>(self, func: F) -> Result<WorkerPool, ConfigError>
    where
        F: TaskFn<I::Payload, O>,
    {
        let coordinator = ShutdownCoordinator::new(self.name.clone(), self.output.clone());
        self.spawn_stage(Arc::new(MapStage(func)), &coordinator)
    }

    /// Start the workers as writers of a shared coordinator's output.
    ///
    /// The output closes when the coordinator is sealed and every writer of
    /// every pool enlisted with it has exited.
    pub fn spawn_joined<F>(
        self,
        coordinator: &ShutdownCoordinator<TaskResult<O>>,
        func: F,
    ) -> Result<WorkerPool, ConfigError>
    where
        F: TaskFn<I::Payload, O>,
    {
        self.spawn_stage(Arc::new(MapStage(func)), coordinator)
    }

    /// Start workers running synchronous `func` on the blocking thread pool.
    pub fn spawn_blocking<F>(self, func: F) -> Result<WorkerPool, ConfigError>
    where
        F: Fn(Task<I::Payload>) -> Result<O, TaskError> + Send + Sync + 'static,
    {
        let coordinator = ShutdownCoordinator::new(self.name.clone(), self.output.clone());
        let stage = BlockingStage::new(func, self.capture_traces);
        self.spawn_stage(Arc::new(stage), &coordinator)
    }

    pub(crate) fn spawn_stage(
        self,
        stage: Arc<dyn StageFn<I::Payload, O>>,
        coordinator: &ShutdownCoordinator<TaskResult<O>>,
    ) -> Result<WorkerPool, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !BoundedQueue::same_queue(coordinator.output(), &self.output) {
            return Err(ConfigError::Invalid(format!(
                "pool {} does not write to the output of coordinator {}",
                self.name,
                coordinator.name()
            )));
        }
        if self.capture_traces {
            panic_trace::install();
        }

        info!(
            pool = %self.name,
            workers = self.workers,
            "Starting worker pool"
        );

        let name: Arc<str> = Arc::from(self.name.as_str());
        let mut handles = Vec::with_capacity(self.workers);
        let mut states = Vec::with_capacity(self.workers);

        for worker_id in 1..=self.workers {
            let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
            let worker = Worker {
                id: worker_id,
                pool: name.clone(),
                input: self.input.clone(),
                output: self.output.clone(),
                stage: stage.clone(),
                classifier: self.classifier.clone(),
                drop_sink: self.drop_sink.clone(),
                token: self.token.clone(),
                drain_timeout: self.drain_timeout,
                capture_traces: self.capture_traces,
                await_input_close: self.await_input_close,
                state_tx,
                _guard: coordinator.enlist(),
            };
            handles.push(tokio::spawn(worker.run()));
            states.push(state_rx);
        }

        let input = self.input;
        Ok(WorkerPool {
            name: self.name,
            handles,
            states,
            token: self.token,
            input_closed: Box::new(move || input.is_closed()),
            close_watcher: coordinator.watcher(),
        })
    }
}

impl<P> WorkerPoolBuilder<Task<P>, P>
where
    P: Send + 'static,
{
    /// Start workers that pass through tasks matching `predicate` and drop
    /// the rest without producing a result.
    pub fn spawn_filter<F>(self, predicate: F) -> Result<WorkerPool, ConfigError>
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        let coordinator = ShutdownCoordinator::new(self.name.clone(), self.output.clone());
        self.spawn_stage(Arc::new(FilterStage(predicate)), &coordinator)
    }
}

/// Handle to a running pool.
///
/// Dropping the handle detaches the workers; they still run to end-of-stream
/// and close the output.
pub struct WorkerPool {
    name: String,
    handles: Vec<JoinHandle<WorkerSummary>>,
    states: Vec<watch::Receiver<WorkerState>>,
    token: CancellationToken,
    input_closed: Box<dyn Fn() -> bool + Send + Sync>,
    close_watcher: CloseWatcher,
}

impl WorkerPool {
    /// Start configuring a pool reading `input` and writing `output`.
    pub fn builder<I, O>(
        input: BoundedQueue<I>,
        output: BoundedQueue<TaskResult<O>>,
    ) -> WorkerPoolBuilder<I, O>
    where
        I: Intake,
        O: Send + 'static,
    {
        WorkerPoolBuilder::new(input, output)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn state(&self) -> PoolState {
        if self.close_watcher.is_closed() {
            PoolState::Closed
        } else if self.token.is_cancelled() || (self.input_closed)() {
            PoolState::Draining
        } else {
            PoolState::Open
        }
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.states.iter().map(|rx| *rx.borrow()).collect()
    }

    /// Ask workers to stop at their next task boundary.
    ///
    /// Tasks still in the input are turned into `Cancelled` results, as long
    /// as the input's producer closes it.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!(pool = %self.name, "Cancelling worker pool");
            self.token.cancel();
        }
    }

    pub(crate) fn watcher(&self) -> CloseWatcher {
        self.close_watcher.clone()
    }

    /// Wait until the output has been closed.
    pub async fn closed(&self) {
        self.close_watcher.clone().closed().await;
    }

    /// Wait for every worker to exit and collect their tallies.
    pub async fn join(self) -> PoolReport {
        let mut report = PoolReport {
            name: self.name,
            ..Default::default()
        };
        for joined in futures::future::join_all(self.handles).await {
            match joined {
                Ok(summary) => report.absorb(summary),
                Err(e) => {
                    error!(pool = %report.name, error = %e, "Worker task failed");
                    report.lost_workers += 1;
                }
            }
        }
        info!(
            pool = %report.name,
            completed = report.completed,
            failed = report.failed,
            cancelled = report.cancelled,
            dropped = report.dropped,
            "Worker pool finished"
        );
        report
    }

    /// Cancel and wait for the workers.
    pub async fn stop(self) -> PoolReport {
        self.cancel();
        self.join().await
    }
}

struct Worker<I: Intake, O> {
    id: WorkerId,
    pool: Arc<str>,
    input: BoundedQueue<I>,
    output: BoundedQueue<TaskResult<O>>,
    stage: Arc<dyn StageFn<I::Payload, O>>,
    classifier: Arc<dyn ErrorClassifier>,
    drop_sink: Arc<dyn DropSink>,
    token: CancellationToken,
    drain_timeout: Duration,
    capture_traces: bool,
    await_input_close: bool,
    state_tx: watch::Sender<WorkerState>,
    _guard: WorkerGuard<TaskResult<O>>,
}

impl<I, O> Worker<I, O>
where
    I: Intake,
    O: Send + 'static,
{
    async fn run(self) -> WorkerSummary {
        let mut summary = WorkerSummary::default();
        debug!(pool = %self.pool, worker = self.id, "Worker started");

        loop {
            let next = if self.token.is_cancelled() && self.await_input_close {
                self.input.take().await
            } else if self.token.is_cancelled() {
                // The producer closes the input on cancellation; don't wait
                // forever on one that never does.
                match tokio::time::timeout(self.drain_timeout, self.input.take()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            pool = %self.pool,
                            worker = self.id,
                            "Input still open after cancellation, worker exiting"
                        );
                        break;
                    }
                }
            } else {
                tokio::select! {
                    biased;
                    next = self.input.take() => next,
                    _ = self.token.cancelled() => continue,
                }
            };

            let Some(item) = next else {
                debug!(pool = %self.pool, worker = self.id, "Input exhausted");
                break;
            };

            let result = match item.into_task::<O>() {
                Err(forwarded) => {
                    summary.forwarded += 1;
                    forwarded
                }
                Ok(task) if self.token.is_cancelled() => {
                    summary.cancelled += 1;
                    TaskResult::failed(
                        task.id(),
                        self.id,
                        ErrorInfo::cancelled("pool was cancelled before the task started"),
                    )
                }
                Ok(task) => {
                    self.state_tx.send_replace(WorkerState::Running);
                    let executed = self.execute(task).await;
                    self.state_tx.send_replace(WorkerState::Idle);
                    match executed {
                        Some(result) if result.is_ok() => {
                            summary.completed += 1;
                            result
                        }
                        Some(result) => {
                            summary.failed += 1;
                            result
                        }
                        None => {
                            summary.filtered += 1;
                            continue;
                        }
                    }
                }
            };

            self.deliver(result, &mut summary).await;
        }

        self.state_tx.send_replace(WorkerState::Finished);
        debug!(pool = %self.pool, worker = self.id, "Worker stopped");
        summary
    }

    /// Run one task. `None` means a filter removed it.
    async fn execute(&self, task: Task<I::Payload>) -> Option<TaskResult<O>> {
        let task_id = task.id();
        let started_at = Utc::now();
        if self.capture_traces {
            panic_trace::clear();
        }

        let outcome = AssertUnwindSafe(self.stage.run(task)).catch_unwind().await;
        let finished_at = Utc::now();

        let outcome = match outcome {
            Ok(Ok(Some(output))) => Ok(output),
            Ok(Ok(None)) => {
                trace!(pool = %self.pool, worker = self.id, task_id, "Task filtered out");
                return None;
            }
            Ok(Err(StageFailure::Error(err))) => {
                let info = classify_error(self.classifier.as_ref(), &err);
                debug!(
                    pool = %self.pool,
                    worker = self.id,
                    task_id,
                    kind = %info.kind(),
                    error = %err,
                    "Task failed"
                );
                Err(info)
            }
            Ok(Err(StageFailure::Fault(info))) => {
                error!(pool = %self.pool, worker = self.id, task_id, error = %info, "Task panicked");
                Err(info)
            }
            Err(payload) => {
                let trace = if self.capture_traces {
                    panic_trace::take()
                } else {
                    None
                };
                let info = classify_panic(payload, trace);
                error!(pool = %self.pool, worker = self.id, task_id, error = %info, "Task panicked");
                Err(info)
            }
        };

        Some(TaskResult::new(
            task_id,
            self.id,
            outcome,
            started_at,
            finished_at,
        ))
    }

    async fn deliver(&self, result: TaskResult<O>, summary: &mut WorkerSummary) {
        let task_id = result.task_id();
        let error_kind = result.error_kind();

        let mut attempt = self.output.put_cancellable(result, &self.token).await;
        if let Err(PutError::Interrupted(result)) = attempt {
            debug!(
                pool = %self.pool,
                worker = self.id,
                task_id,
                "Cancelled with a full output, waiting out the drain timeout"
            );
            attempt = self.output.put_timeout(result, self.drain_timeout).await;
        }

        if let Err(err) = attempt {
            let reason = match err.kind() {
                QueueErrorKind::Closed => DropReason::OutputClosed,
                QueueErrorKind::Full | QueueErrorKind::Interrupted => DropReason::Cancelled,
            };
            summary.dropped += 1;
            self.drop_sink.on_drop(DroppedResult {
                task_id,
                worker_id: self.id,
                error_kind,
                reason,
            });
        }
    }
}
