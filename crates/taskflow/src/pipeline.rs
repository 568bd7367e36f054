//! # Pipeline
//!
//! An ordered chain of worker pools. Stage k's output queue is the very
//! queue object stage k+1 reads from; each stage closes its output through
//! its own coordinator, so end-of-stream and cancellation travel downstream
//! by closing.
//!
//! The pipeline owns the source queue and a root cancellation token. Every
//! stage observes a child of that token. Cancelling (directly, through a
//! deadline, or by dropping the pipeline) closes the source, so every stage
//! drains its remaining tasks as `Cancelled` results and exits.

use futures::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::classify::{DefaultClassifier, ErrorClassifier};
use crate::config::EngineConfig;
use crate::deadline::DeadlineController;
use crate::error::{ConfigError, EngineError, ErrorInfo, TaskError};
use crate::pool::{
    BlockingStage, FilterStage, MapStage, PoolReport, PoolState, StageFn, TaskFn, WorkerPool,
};
use crate::queue::{BoundedQueue, QueueErrorKind};
use crate::shutdown::{CloseWatcher, ShutdownCoordinator};
use crate::sink::{DropReason, DropSink, DroppedResult, LogDropSink};
use crate::task::{Intake, Task, TaskHandle, TaskResult};

/// Options shared by every stage, resolved when the pipeline is built.
struct StageContext {
    config: EngineConfig,
    classifier: Arc<dyn ErrorClassifier>,
    drop_sink: Arc<dyn DropSink>,
    token: CancellationToken,
}

type Spawner = Box<dyn FnOnce(&StageContext) -> Result<WorkerPool, ConfigError> + Send>;

/// Builds a [`Pipeline`] stage by stage.
///
/// `T` is the item type of the queue the next stage will read: [`Task<P>`]
/// before the first stage, the previous stage's [`TaskResult`] afterwards.
/// Nothing is spawned until [`build`](PipelineBuilder::build).
pub struct PipelineBuilder<P, T> {
    config: EngineConfig,
    source: BoundedQueue<Task<P>>,
    tail: BoundedQueue<T>,
    classifier: Arc<dyn ErrorClassifier>,
    drop_sink: Arc<dyn DropSink>,
    spawners: Vec<Spawner>,
    invalid: Option<ConfigError>,
}

impl<P> PipelineBuilder<P, Task<P>>
where
    P: Send + 'static,
{
    pub fn new(config: EngineConfig) -> Self {
        let source = BoundedQueue::new(config.queue_capacity);
        Self {
            tail: source.clone(),
            source,
            config,
            classifier: Arc::new(DefaultClassifier),
            drop_sink: Arc::new(LogDropSink),
            spawners: Vec::new(),
            invalid: None,
        }
    }
}

impl<P, T> PipelineBuilder<P, T>
where
    P: Send + 'static,
    T: Intake,
{
    /// Append a stage mapping each payload through `func`.
    pub fn stage<O, F>(self, workers: usize, func: F) -> PipelineBuilder<P, TaskResult<O>>
    where
        O: Send + 'static,
        F: TaskFn<T::Payload, O>,
    {
        self.push_stage(workers, Arc::new(MapStage(func)))
    }

    /// Append a stage keeping only payloads matching `predicate`.
    pub fn filter<F>(self, workers: usize, predicate: F) -> PipelineBuilder<P, TaskResult<T::Payload>>
    where
        F: Fn(&T::Payload) -> bool + Send + Sync + 'static,
    {
        self.push_stage(workers, Arc::new(FilterStage(predicate)))
    }

    /// Append a stage running synchronous `func` on the blocking thread pool.
    pub fn stage_blocking<O, F>(self, workers: usize, func: F) -> PipelineBuilder<P, TaskResult<O>>
    where
        O: Send + 'static,
        F: Fn(Task<T::Payload>) -> Result<O, TaskError> + Send + Sync + 'static,
    {
        let capture_traces = self.config.capture_traces;
        self.push_stage(workers, Arc::new(BlockingStage::new(func, capture_traces)))
    }

    /// Classifier used by every stage.
    pub fn classifier(mut self, classifier: impl ErrorClassifier) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Sink receiving every undeliverable result, of any stage.
    pub fn drop_sink(mut self, drop_sink: Arc<dyn DropSink>) -> Self {
        self.drop_sink = drop_sink;
        self
    }

    fn push_stage<O>(
        mut self,
        workers: usize,
        stage: Arc<dyn StageFn<T::Payload, O>>,
    ) -> PipelineBuilder<P, TaskResult<O>>
    where
        O: Send + 'static,
    {
        if workers == 0 && self.invalid.is_none() {
            self.invalid = Some(ConfigError::NoWorkers);
        }

        let index = self.spawners.len() + 1;
        let input = self.tail;
        let output = BoundedQueue::new(self.config.queue_capacity);
        let stage_output = output.clone();
        self.spawners.push(Box::new(move |ctx: &StageContext| {
            let name = format!("stage-{index}");
            let coordinator = ShutdownCoordinator::new(name.clone(), stage_output.clone());
            WorkerPool::builder(input, stage_output)
                .name(name)
                .config(&ctx.config)
                .workers(workers)
                .shared_classifier(ctx.classifier.clone())
                .drop_sink(ctx.drop_sink.clone())
                .cancellation(ctx.token.child_token())
                .await_input_close(true)
                .spawn_stage(stage, &coordinator)
        }));

        PipelineBuilder {
            config: self.config,
            source: self.source,
            tail: output,
            classifier: self.classifier,
            drop_sink: self.drop_sink,
            spawners: self.spawners,
            invalid: self.invalid,
        }
    }
}

impl<P, O> PipelineBuilder<P, TaskResult<O>>
where
    P: Send + 'static,
    O: Send + 'static,
{
    /// Spawn every stage.
    ///
    /// Configuration is checked before anything is spawned. With a deadline
    /// in the config, a watchdog cancels the whole run when it expires.
    pub fn build(self) -> Result<Pipeline<P, O>, ConfigError> {
        self.config.validate()?;
        if let Some(err) = self.invalid {
            return Err(err);
        }

        let token = CancellationToken::new();
        let ctx = StageContext {
            config: self.config.clone(),
            classifier: self.classifier,
            drop_sink: self.drop_sink.clone(),
            token: token.clone(),
        };

        let mut stages = Vec::with_capacity(self.spawners.len());
        for spawner in self.spawners {
            match spawner(&ctx) {
                Ok(pool) => stages.push(pool),
                Err(err) => {
                    // Let the stages already running drain and exit.
                    token.cancel();
                    self.source.close();
                    return Err(err);
                }
            }
        }

        let last_closed = match stages.last() {
            Some(pool) => pool.watcher(),
            None => return Err(ConfigError::Invalid("pipeline has no stages".to_string())),
        };

        let watchdog = self.config.deadline().map(|budget| {
            let controller = DeadlineController::with_token(budget, token.clone());
            let mut done = last_closed.clone();
            controller.arm(async move { done.closed().await })
        });
        tokio::spawn(close_source_on_cancel(
            self.source.clone(),
            token.clone(),
            last_closed,
        ));

        info!(
            stages = stages.len(),
            queue_capacity = self.config.queue_capacity,
            deadline = ?self.config.deadline(),
            "Pipeline started"
        );

        Ok(Pipeline {
            submitter: Submitter {
                source: self.source,
                next_id: Arc::new(AtomicU64::new(1)),
                token: token.clone(),
            },
            output: self.tail,
            token,
            stages,
            drop_sink: self.drop_sink,
            pending: VecDeque::new(),
            watchdog,
        })
    }
}

/// Closes the source once the run is cancelled, unless it finishes first.
async fn close_source_on_cancel<P>(
    source: BoundedQueue<Task<P>>,
    token: CancellationToken,
    mut last_closed: CloseWatcher,
) {
    tokio::select! {
        _ = token.cancelled() => {
            if source.close() {
                debug!("Pipeline cancelled, source closed");
            }
        }
        _ = last_closed.closed() => {}
    }
}

/// Producer side of a pipeline. Clone it to submit from several tasks.
pub struct Submitter<P> {
    source: BoundedQueue<Task<P>>,
    next_id: Arc<AtomicU64>,
    token: CancellationToken,
}

impl<P> Clone for Submitter<P> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            next_id: self.next_id.clone(),
            token: self.token.clone(),
        }
    }
}

impl<P: Send + 'static> Submitter<P> {
    /// Submit a payload, waiting while the source queue is full.
    ///
    /// Task ids increase monotonically from 1 across all submitters.
    pub async fn submit(&self, payload: P) -> Result<TaskHandle, EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let task = self.new_task(payload);
        let handle = task.handle();
        self.source
            .put_cancellable(task, &self.token)
            .await
            .map_err(|err| self.rejection(err.kind()))?;
        trace!(task_id = handle.id, "Task submitted");
        Ok(handle)
    }

    /// Submit a payload without waiting.
    pub fn try_submit(&self, payload: P) -> Result<TaskHandle, EngineError> {
        if self.token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let task = self.new_task(payload);
        let handle = task.handle();
        self.source
            .try_put(task)
            .map_err(|err| self.rejection(err.kind()))?;
        Ok(handle)
    }

    /// Signal that no more tasks will be submitted.
    pub fn close(&self) -> bool {
        self.source.close()
    }

    pub fn is_closed(&self) -> bool {
        self.source.is_closed()
    }

    fn new_task(&self, payload: P) -> Task<P> {
        Task::new(self.next_id.fetch_add(1, Ordering::Relaxed), payload)
    }

    fn rejection(&self, kind: QueueErrorKind) -> EngineError {
        match kind {
            QueueErrorKind::Full => EngineError::Full,
            QueueErrorKind::Interrupted => EngineError::Cancelled,
            QueueErrorKind::Closed if self.token.is_cancelled() => EngineError::Cancelled,
            QueueErrorKind::Closed => EngineError::Closed,
        }
    }
}

/// Outcome of a whole pipeline run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    /// One report per stage, in order.
    pub stages: Vec<PoolReport>,
    /// Results still unread at shutdown, handed to the drop sink.
    pub abandoned: usize,
    pub deadline_expired: bool,
}

impl PipelineReport {
    /// All stage reports added together.
    pub fn totals(&self) -> PoolReport {
        let mut totals = PoolReport {
            name: "total".to_string(),
            ..Default::default()
        };
        for stage in &self.stages {
            totals.merge(stage);
        }
        totals
    }
}

/// A running chain of worker pools.
///
/// Dropping the pipeline cancels it.
pub struct Pipeline<P, O> {
    submitter: Submitter<P>,
    output: BoundedQueue<TaskResult<O>>,
    token: CancellationToken,
    stages: Vec<WorkerPool>,
    drop_sink: Arc<dyn DropSink>,
    /// Results gathered by an `await_all` that timed out.
    pending: VecDeque<TaskResult<O>>,
    watchdog: Option<JoinHandle<bool>>,
}

impl<P, O> Pipeline<P, O>
where
    P: Send + 'static,
    O: Send + 'static,
{
    /// A single worker pool with `config.worker_count` workers.
    pub fn single<F>(config: EngineConfig, func: F) -> Result<Self, ConfigError>
    where
        F: TaskFn<P, O>,
    {
        let workers = config.worker_count;
        PipelineBuilder::new(config).stage(workers, func).build()
    }

    pub async fn submit(&self, payload: P) -> Result<TaskHandle, EngineError> {
        self.submitter.submit(payload).await
    }

    pub fn try_submit(&self, payload: P) -> Result<TaskHandle, EngineError> {
        self.submitter.try_submit(payload)
    }

    /// Close the source. Results keep flowing until every stage has drained.
    pub fn submit_and_close(&self) {
        if self.submitter.close() {
            debug!("Source closed, no more submissions");
        }
    }

    pub fn submitter(&self) -> Submitter<P> {
        self.submitter.clone()
    }

    /// Next result in completion order; `None` at end-of-stream.
    pub async fn next_result(&mut self) -> Option<TaskResult<O>> {
        if let Some(result) = self.pending.pop_front() {
            return Some(result);
        }
        self.output.take().await
    }

    /// Results as a stream, ending at end-of-stream.
    pub fn results(&mut self) -> impl Stream<Item = TaskResult<O>> + '_ {
        futures::stream::unfold(self, |this| async move {
            let next = this.next_result().await;
            next.map(|result| (result, this))
        })
    }

    /// Collect every result until end-of-stream, for at most `deadline`.
    ///
    /// On expiry the pipeline is cancelled and `ErrorInfo::Timeout` is
    /// returned. Results collected so far stay buffered and are yielded
    /// first by the next consumption call.
    pub async fn await_all(&mut self, deadline: Duration) -> Result<Vec<TaskResult<O>>, ErrorInfo> {
        let controller = DeadlineController::with_token(deadline, self.token.clone());
        let output = self.output.clone();
        let pending = &mut self.pending;
        let gathered = controller
            .run(async {
                while let Some(result) = output.take().await {
                    pending.push_back(result);
                }
            })
            .await;

        match gathered {
            Ok(()) => Ok(self.pending.drain(..).collect()),
            Err(err) => {
                warn!(
                    buffered = self.pending.len(),
                    "Results not complete within the deadline"
                );
                self.submitter.close();
                Err(err)
            }
        }
    }

    /// Stop every stage at its next task boundary.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("Cancelling pipeline");
            self.token.cancel();
        }
        self.submitter.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn stage_states(&self) -> Vec<PoolState> {
        self.stages.iter().map(WorkerPool::state).collect()
    }

    /// Close the source, wait for every stage and report.
    ///
    /// Queued tasks still run unless the pipeline was cancelled first.
    /// Results nobody consumed go to the drop sink as abandoned.
    pub async fn shutdown(mut self) -> PipelineReport {
        self.submit_and_close();

        let mut abandoned = 0;
        while let Some(result) = self.next_result().await {
            abandoned += 1;
            self.drop_sink.on_drop(DroppedResult {
                task_id: result.task_id(),
                worker_id: result.worker_id(),
                error_kind: result.error_kind(),
                reason: DropReason::Abandoned,
            });
        }

        let mut report = PipelineReport {
            abandoned,
            ..Default::default()
        };
        for pool in std::mem::take(&mut self.stages) {
            report.stages.push(pool.join().await);
        }
        if let Some(watchdog) = self.watchdog.take() {
            report.deadline_expired = watchdog.await.unwrap_or(false);
        }

        info!(
            stages = report.stages.len(),
            abandoned = report.abandoned,
            deadline_expired = report.deadline_expired,
            "Pipeline finished"
        );
        report
    }
}

impl<P, O> Drop for Pipeline<P, O> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use futures::StreamExt;

    fn config(workers: usize, capacity: usize) -> EngineConfig {
        EngineConfig::default()
            .with_workers(workers)
            .with_queue_capacity(capacity)
    }

    #[tokio::test]
    async fn test_single_stage_round_trip() {
        let mut pipeline = Pipeline::single(config(2, 4), |task: Task<u32>| async move {
            Ok::<_, TaskError>(task.payload() + 1)
        })
        .unwrap();

        let producer = tokio::spawn({
            let submitter = pipeline.submitter();
            async move {
                let mut ids = Vec::new();
                for n in 0..10 {
                    ids.push(submitter.submit(n).await.unwrap().id);
                }
                submitter.close();
                ids
            }
        });

        let results = pipeline.await_all(Duration::from_secs(5)).await.unwrap();
        assert_eq!(producer.await.unwrap(), (1..=10).collect::<Vec<_>>());
        assert_eq!(results.len(), 10);
        for result in &results {
            assert_eq!(result.output(), Some(&(result.task_id() as u32)));
        }

        let report = pipeline.shutdown().await;
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].completed, 10);
        assert_eq!(report.abandoned, 0);
        assert!(!report.deadline_expired);
    }

    #[tokio::test]
    async fn test_filter_then_map() {
        let mut pipeline = PipelineBuilder::new(config(2, 2))
            .filter(2, |n: &u64| n % 2 == 0)
            .stage(2, |task: Task<u64>| async move { Ok::<_, TaskError>(task.payload() * 2) })
            .build()
            .unwrap();

        let submitter = pipeline.submitter();
        tokio::spawn(async move {
            for n in 1..=5 {
                submitter.submit(n).await.unwrap();
            }
            submitter.close();
        });

        let mut outputs: Vec<u64> = pipeline
            .results()
            .filter_map(|r| async move { r.into_outcome().ok() })
            .collect()
            .await;
        outputs.sort();
        assert_eq!(outputs, vec![4, 8]);

        let report = pipeline.shutdown().await;
        assert_eq!(report.stages[0].filtered, 3);
        assert_eq!(report.stages[1].completed, 2);
    }

    #[tokio::test]
    async fn test_blocking_stage_and_type_change() {
        let mut pipeline = PipelineBuilder::new(config(1, 4))
            .stage_blocking(2, |task: Task<u32>| Ok(format!("#{}", task.payload())))
            .stage(1, |task: Task<String>| async move {
                Ok::<_, TaskError>(task.payload().len())
            })
            .build()
            .unwrap();
        pipeline.submit(7).await.unwrap();
        pipeline.submit(42).await.unwrap();
        pipeline.submit_and_close();

        let mut lengths: Vec<_> = pipeline
            .await_all(Duration::from_secs(1))
            .await
            .unwrap()
            .into_iter()
            .filter_map(|r| r.output().copied())
            .collect();
        lengths.sort();
        assert_eq!(lengths, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_failures_reach_the_end_of_the_chain() {
        let mut pipeline = PipelineBuilder::new(config(1, 4))
            .stage(1, |task: Task<i32>| async move {
                if *task.payload() < 0 {
                    return Err(TaskError::from(crate::error::TaskFailure::validation(
                        "n", "negative",
                    )));
                }
                Ok::<_, TaskError>(*task.payload())
            })
            .stage(1, |task: Task<i32>| async move { Ok::<_, TaskError>(task.payload() * 10) })
            .build()
            .unwrap();
        for n in [1, -1, 2] {
            pipeline.submit(n).await.unwrap();
        }
        pipeline.submit_and_close();

        let mut results = pipeline.await_all(Duration::from_secs(1)).await.unwrap();
        results.sort_by_key(|r| r.task_id());
        assert_eq!(results[0].output(), Some(&10));
        assert_eq!(results[1].error_kind(), Some(ErrorKind::Validation));
        assert_eq!(results[2].output(), Some(&20));

        let report = pipeline.shutdown().await;
        assert_eq!(report.stages[1].forwarded, 1);
        assert_eq!(report.totals().failed, 1);
    }

    #[tokio::test]
    async fn test_zero_worker_stage_rejected_before_spawn() {
        let result = PipelineBuilder::new(config(1, 1))
            .stage(1, |task: Task<u8>| async move { Ok::<_, TaskError>(*task.payload()) })
            .stage(0, |task: Task<u8>| async move { Ok::<_, TaskError>(*task.payload()) })
            .build();
        assert!(matches!(result, Err(ConfigError::NoWorkers)));
    }

    #[tokio::test]
    async fn test_submit_after_close() {
        let pipeline = Pipeline::single(config(1, 1), |task: Task<u8>| async move {
            Ok::<_, TaskError>(*task.payload())
        })
        .unwrap();
        pipeline.submit_and_close();
        assert_eq!(pipeline.submit(1).await, Err(EngineError::Closed));

        pipeline.cancel();
        assert_eq!(pipeline.try_submit(1), Err(EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_try_submit_full() {
        let pipeline = Pipeline::single(config(1, 1), |task: Task<u8>| async move {
            std::future::pending::<()>().await;
            Ok::<_, TaskError>(*task.payload())
        })
        .unwrap();
        let mut full = false;
        for n in 0..8 {
            if pipeline.try_submit(n) == Err(EngineError::Full) {
                full = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(full);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_all_timeout_keeps_partial_results() {
        crate::test_utils::init_tracing();
        let mut pipeline = Pipeline::single(config(1, 16), |task: Task<u64>| async move {
            tokio::time::sleep(Duration::from_millis(100 * task.payload())).await;
            Ok::<_, TaskError>(*task.payload())
        })
        .unwrap();
        for n in 1..=4 {
            pipeline.submit(n).await.unwrap();
        }

        // Task 1 finishes at 100ms, task 2 is in flight at 250ms.
        let err = pipeline
            .await_all(Duration::from_millis(250))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(pipeline.is_cancelled());

        let rest: Vec<_> = pipeline.results().collect().await;
        let ids: Vec<_> = rest.iter().map(|r| r.task_id()).collect();
        assert_eq!(ids[0], 1, "buffered result comes first");
        assert_eq!(rest.len(), 4);
        assert!(rest[1].is_ok(), "in-flight task completes");
        assert_eq!(rest[2].error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(rest[3].error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_config_deadline_cancels_run() {
        crate::test_utils::init_tracing();
        let config = config(1, 8).with_deadline(Duration::from_millis(50));
        let mut pipeline = Pipeline::single(config, |task: Task<u64>| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, TaskError>(*task.payload())
        })
        .unwrap();
        for n in 1..=5 {
            pipeline.submit(n).await.unwrap();
        }

        // No submit_and_close: the deadline closes the source.
        let results: Vec<_> = pipeline.results().collect().await;
        assert_eq!(results.len(), 5);
        let completed = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(completed, 2);

        let report = pipeline.shutdown().await;
        assert!(report.deadline_expired);
        assert_eq!(report.stages[0].cancelled, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_unread_results() {
        crate::test_utils::init_tracing();
        let sink = Arc::new(crate::sink::RecordingDropSink::new());
        let pipeline = PipelineBuilder::new(config(2, 8))
            .drop_sink(sink.clone())
            .stage(2, |task: Task<u8>| async move { Ok::<_, TaskError>(*task.payload()) })
            .build()
            .unwrap();
        for n in 0..3 {
            pipeline.submit(n).await.unwrap();
        }

        let report = pipeline.shutdown().await;
        assert_eq!(report.abandoned, 3);
        assert_eq!(sink.len(), 3);
        assert!(
            sink.dropped()
                .iter()
                .all(|d| d.reason == DropReason::Abandoned)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_pipeline_stops_workers() {
        let pipeline = Pipeline::single(config(1, 1), |task: Task<u8>| async move {
            Ok::<_, TaskError>(*task.payload())
        })
        .unwrap();
        let output = pipeline.output.clone();
        pipeline.submit(1).await.unwrap();
        pipeline.submit(2).await.unwrap();
        drop(pipeline);

        // The output closes even though nobody reads it.
        while !output.is_closed() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
