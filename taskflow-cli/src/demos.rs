//! Demonstration workloads, one per subcommand.

use serde::Serialize;
use std::fmt;
use std::io;
use std::time::Duration;
use taskflow::{
    BoundedQueue, EngineConfig, EngineError, ErrorInfo, ErrorKind, Pipeline, PipelineBuilder, PoolReport,
    Submitter, Task, TaskError, TaskFailure, TaskId, TaskResult, WorkerId, WorkerPool,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cli::StageOrder;
use crate::error::{AppError, Result};

/// One result, flattened for display.
#[derive(Debug, Clone, Serialize)]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub output: Option<String>,
    pub error: Option<ErrorInfo>,
    pub duration_ms: i64,
}

impl<O: fmt::Display> From<&TaskResult<O>> for ResultRecord {
    fn from(result: &TaskResult<O>) -> Self {
        Self {
            task_id: result.task_id(),
            worker_id: result.worker_id(),
            output: result.output().map(ToString::to_string),
            error: result.err().cloned(),
            duration_ms: (result.finished_at() - result.started_at()).num_milliseconds(),
        }
    }
}

/// Everything a subcommand prints.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub command: &'static str,
    pub results: Vec<ResultRecord>,
    /// How the stages were chained, when there is more than one.
    pub layout: Option<&'static str>,
    pub stages: Vec<PoolReport>,
    pub abandoned: usize,
    pub deadline_expired: bool,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_none()).count()
    }

    pub fn count_kind(&self, kind: ErrorKind) -> usize {
        self.results
            .iter()
            .filter(|r| r.error.as_ref().is_some_and(|e| e.kind() == kind))
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DataProcessing,
    FileOperation,
    Calculation,
}

impl JobKind {
    pub fn for_id(id: TaskId) -> Self {
        match id % 3 {
            0 => JobKind::DataProcessing,
            1 => JobKind::FileOperation,
            _ => JobKind::Calculation,
        }
    }

    fn cost(self) -> Duration {
        match self {
            JobKind::DataProcessing => Duration::from_millis(200),
            JobKind::FileOperation => Duration::from_millis(300),
            JobKind::Calculation => Duration::from_millis(150),
        }
    }

    fn apply(self, id: TaskId) -> u64 {
        match self {
            JobKind::DataProcessing => id * 100,
            JobKind::FileOperation => id + 50,
            JobKind::Calculation => id * id,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::DataProcessing => write!(f, "data processing"),
            JobKind::FileOperation => write!(f, "file operation"),
            JobKind::Calculation => write!(f, "calculation"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOutput {
    pub kind: JobKind,
    pub value: u64,
}

impl fmt::Display for JobOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.kind, self.value)
    }
}

async fn run_job(task: Task<JobKind>) -> std::result::Result<JobOutput, TaskError> {
    let kind = *task.payload();
    debug!(task_id = task.id(), %kind, "Running job");
    tokio::time::sleep(kind.cost()).await;
    Ok(JobOutput {
        kind,
        value: kind.apply(task.id()),
    })
}

/// Mixed jobs on a single worker pool fed through a bounded queue.
pub async fn pool(config: &EngineConfig, jobs: u64) -> Result<RunSummary> {
    let input = BoundedQueue::new(config.queue_capacity);
    let output = BoundedQueue::new(config.queue_capacity);
    let pool = WorkerPool::builder(input.clone(), output.clone())
        .name("jobs")
        .config(config)
        .spawn(run_job)?;

    let producer = tokio::spawn(async move {
        for id in 1..=jobs {
            if let Err(e) = input.put(Task::new(id, JobKind::for_id(id))).await {
                warn!(task_id = id, error = %e, "Job not submitted");
                break;
            }
        }
        input.close();
    });

    let mut results = Vec::new();
    while let Some(result) = output.take().await {
        results.push(ResultRecord::from(&result));
    }
    producer.await?;

    Ok(RunSummary {
        command: "pool",
        results,
        layout: None,
        stages: vec![pool.join().await],
        abandoned: 0,
        deadline_expired: false,
    })
}

async fn double(task: Task<u64>) -> std::result::Result<u64, TaskError> {
    Ok(task.payload() * 2)
}

fn is_even(n: &u64) -> bool {
    n % 2 == 0
}

/// `1..=count` through filter-even and double, in the given order.
pub async fn pipeline(config: &EngineConfig, count: u64, order: StageOrder) -> Result<RunSummary> {
    let workers = config.worker_count;
    let builder = PipelineBuilder::new(config.clone());
    let pipeline = match order {
        StageOrder::FilterFirst => builder
            .filter(workers, is_even)
            .stage(workers, double)
            .build()?,
        StageOrder::DoubleFirst => builder
            .stage(workers, double)
            .filter(workers, is_even)
            .build()?,
    };
    let producer = spawn_producer(pipeline.submitter(), 1..=count);
    let mut summary = finish("pipeline", pipeline, producer).await?;
    summary.layout = Some(order.describe());
    Ok(summary)
}

/// Slow tasks under a deadline; whatever has not started is cancelled.
pub async fn timeout(
    config: &EngineConfig,
    jobs: u64,
    deadline: Duration,
    task_cost: Duration,
) -> Result<RunSummary> {
    if deadline.is_zero() {
        return Err(AppError::InvalidInput("deadline must be positive".to_string()));
    }
    let config = config.clone().with_deadline(deadline);
    let pipeline = Pipeline::single(config, move |task: Task<u64>| async move {
        tokio::time::sleep(task_cost).await;
        Ok::<_, TaskError>(*task.payload())
    })?;
    let producer = spawn_producer(pipeline.submitter(), 1..=jobs);
    finish("timeout", pipeline, producer).await
}

/// Tasks that panic, or fail with validation or resource errors.
pub async fn faults(config: &EngineConfig, jobs: u64, panic_every: u64) -> Result<RunSummary> {
    if panic_every == 0 {
        return Err(AppError::InvalidInput(
            "--panic-every must be at least 1".to_string(),
        ));
    }
    let pipeline = Pipeline::single(config.clone(), move |task: Task<u64>| async move {
        let id = task.id();
        if id % panic_every == 0 {
            panic!("job {id} hit an unrecoverable state");
        }
        match id % 5 {
            1 => Err(TaskError::from(TaskFailure::validation(
                "payload",
                format!("job {id} is malformed"),
            ))),
            3 => Err(TaskError::from(TaskFailure::resource(
                "fetch",
                io::Error::new(io::ErrorKind::ConnectionRefused, "dependency unavailable"),
            ))),
            _ => Ok(task.payload() * 10),
        }
    })?;
    let producer = spawn_producer(pipeline.submitter(), 1..=jobs);
    finish("faults", pipeline, producer).await
}

/// Several producers submitting concurrently to one pool.
pub async fn fan_in(config: &EngineConfig, producers: u64, per_producer: u64) -> Result<RunSummary> {
    let pipeline = Pipeline::single(config.clone(), |task: Task<(u64, u64)>| async move {
        let (producer, seq) = *task.payload();
        Ok::<_, TaskError>(format!("producer {producer} item {seq}"))
    })?;

    let handles: Vec<_> = (1..=producers)
        .map(|producer| {
            let submitter = pipeline.submitter();
            tokio::spawn(async move {
                for seq in 1..=per_producer {
                    submitter.submit((producer, seq)).await?;
                }
                Ok::<_, EngineError>(())
            })
        })
        .collect();

    let submitter = pipeline.submitter();
    let closer = tokio::spawn(async move {
        let mut outcome = Ok(());
        for handle in futures::future::join_all(handles).await {
            if let Err(e) = handle? {
                outcome = Err(AppError::from(e));
            }
        }
        submitter.close();
        outcome
    });
    finish("fan-in", pipeline, closer).await
}

/// Submit every payload, then close the source.
///
/// A cancelled run (for example, an expired deadline) ends submission early
/// without failing.
fn spawn_producer<P, I>(submitter: Submitter<P>, payloads: I) -> JoinHandle<Result<()>>
where
    P: Send + 'static,
    I: IntoIterator<Item = P> + Send + 'static,
    I::IntoIter: Send,
{
    tokio::spawn(async move {
        for payload in payloads {
            match submitter.submit(payload).await {
                Ok(_) => {}
                Err(EngineError::Cancelled) => {
                    info!("Run cancelled, submission stopped");
                    break;
                }
                Err(e) => {
                    submitter.close();
                    return Err(e.into());
                }
            }
        }
        submitter.close();
        Ok(())
    })
}

async fn finish<P, O>(
    command: &'static str,
    mut pipeline: Pipeline<P, O>,
    producer: JoinHandle<Result<()>>,
) -> Result<RunSummary>
where
    P: Send + 'static,
    O: Send + fmt::Display + 'static,
{
    let mut results = Vec::new();
    while let Some(result) = pipeline.next_result().await {
        results.push(ResultRecord::from(&result));
    }
    producer.await??;

    let report = pipeline.shutdown().await;
    Ok(RunSummary {
        command,
        results,
        layout: None,
        stages: report.stages,
        abandoned: report.abandoned,
        deadline_expired: report.deadline_expired,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(workers: usize) -> EngineConfig {
        EngineConfig::default().with_workers(workers)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_job_types() {
        let summary = pool(&config(3), 6).await.unwrap();
        let mut outputs: Vec<_> = summary
            .results
            .iter()
            .map(|r| (r.task_id, r.output.clone().unwrap()))
            .collect();
        outputs.sort();
        assert_eq!(outputs[0], (1, "file operation -> 51".to_string()));
        assert_eq!(outputs[1], (2, "calculation -> 4".to_string()));
        assert_eq!(outputs[2], (3, "data processing -> 300".to_string()));
        assert_eq!(summary.stages[0].completed, 6);
    }

    #[tokio::test]
    async fn test_pipeline_keeps_doubled_evens() {
        let summary = pipeline(&config(2), 5, StageOrder::FilterFirst).await.unwrap();
        let mut outputs: Vec<_> = summary
            .results
            .iter()
            .filter_map(|r| r.output.clone())
            .collect();
        outputs.sort();
        assert_eq!(outputs, vec!["4".to_string(), "8".to_string()]);
        assert_eq!(summary.stages[0].filtered, 3);
        assert_eq!(summary.layout, Some("filter-even -> double"));
    }

    #[tokio::test]
    async fn test_pipeline_double_first_keeps_everything() {
        let summary = pipeline(&config(2), 5, StageOrder::DoubleFirst).await.unwrap();
        let mut outputs: Vec<u64> = summary
            .results
            .iter()
            .filter_map(|r| r.output.as_deref())
            .map(|o| o.parse().unwrap())
            .collect();
        outputs.sort();
        assert_eq!(outputs, vec![2, 4, 6, 8, 10]);
        assert_eq!(summary.stages[1].filtered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cancels_unstarted_jobs() {
        let summary = timeout(
            &config(1),
            5,
            Duration::from_millis(250),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        assert!(summary.deadline_expired);
        assert_eq!(summary.results.len(), 5);
        assert_eq!(summary.succeeded(), 3);
        assert_eq!(summary.count_kind(ErrorKind::Cancelled), 2);
    }

    #[tokio::test]
    async fn test_faults_are_classified() {
        let summary = faults(&config(2), 10, 4).await.unwrap();
        assert_eq!(summary.results.len(), 10);
        // 4 and 8 panic; 1 and 6 are malformed; 3 is a resource failure.
        assert_eq!(summary.count_kind(ErrorKind::Unclassified), 2);
        assert_eq!(summary.count_kind(ErrorKind::Validation), 2);
        assert_eq!(summary.count_kind(ErrorKind::Resource), 1);
        assert_eq!(summary.succeeded(), 5);
    }

    #[tokio::test]
    async fn test_faults_rejects_zero_period() {
        assert!(matches!(
            faults(&config(1), 3, 0).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_fan_in_collects_every_producer() {
        let summary = fan_in(&config(2), 3, 4).await.unwrap();
        assert_eq!(summary.results.len(), 12);
        for producer in 1..=3 {
            let count = summary
                .results
                .iter()
                .filter_map(|r| r.output.as_deref())
                .filter(|o| o.starts_with(&format!("producer {producer} ")))
                .count();
            assert_eq!(count, 4);
        }
    }
}
