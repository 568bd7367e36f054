//! Task and result types shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorInfo, ErrorKind};

/// Identifier of a submitted task, unique within one pipeline.
pub type TaskId = u64;

/// Identifier of a worker within its pool, starting at 1.
pub type WorkerId = usize;

/// A unit of work. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task<P> {
    id: TaskId,
    payload: P,
    enqueued_at: DateTime<Utc>,
}

impl<P> Task<P> {
    /// Create a task stamped with the current time.
    pub fn new(id: TaskId, payload: P) -> Self {
        Self {
            id,
            payload,
            enqueued_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    /// Handle describing this task to the submitter.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            id: self.id,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Receipt returned to the producer for an accepted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub id: TaskId,
    pub enqueued_at: DateTime<Utc>,
}

/// Outcome of processing one task.
///
/// Created exactly once per task by the worker that processed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult<O> {
    task_id: TaskId,
    worker_id: WorkerId,
    outcome: Result<O, ErrorInfo>,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl<O> TaskResult<O> {
    pub(crate) fn new(
        task_id: TaskId,
        worker_id: WorkerId,
        outcome: Result<O, ErrorInfo>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            worker_id,
            outcome,
            started_at,
            finished_at,
        }
    }

    /// A failure recorded without running the task (cancelled or forwarded).
    pub(crate) fn failed(task_id: TaskId, worker_id: WorkerId, err: ErrorInfo) -> Self {
        let now = Utc::now();
        Self::new(task_id, worker_id, Err(err), now, now)
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn output(&self) -> Option<&O> {
        self.outcome.as_ref().ok()
    }

    pub fn err(&self) -> Option<&ErrorInfo> {
        self.outcome.as_ref().err()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.err().map(ErrorInfo::kind)
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn outcome(&self) -> &Result<O, ErrorInfo> {
        &self.outcome
    }

    pub fn into_outcome(self) -> Result<O, ErrorInfo> {
        self.outcome
    }

    /// Re-type a failed result for another output type.
    ///
    /// Returns `Err(self)` when the result is a success.
    pub fn into_failure<U>(self) -> Result<TaskResult<U>, Self> {
        let TaskResult {
            task_id,
            worker_id,
            outcome,
            started_at,
            finished_at,
        } = self;
        match outcome {
            Err(err) => Ok(TaskResult::new(
                task_id,
                worker_id,
                Err(err),
                started_at,
                finished_at,
            )),
            Ok(output) => Err(TaskResult::new(
                task_id,
                worker_id,
                Ok(output),
                started_at,
                finished_at,
            )),
        }
    }
}

/// Items a worker pool can consume from its input queue.
///
/// A source queue carries [`Task`]s. Inside a pipeline, a stage consumes the
/// [`TaskResult`]s of the stage before it: successes become tasks carrying the
/// upstream output, failures are forwarded untouched.
pub trait Intake: Send + 'static {
    type Payload: Send + 'static;

    /// Turn the item into a runnable task, or into the result to forward.
    fn into_task<U>(self) -> Result<Task<Self::Payload>, TaskResult<U>>;
}

impl<P: Send + 'static> Intake for Task<P> {
    type Payload = P;

    fn into_task<U>(self) -> Result<Task<P>, TaskResult<U>> {
        Ok(self)
    }
}

impl<O: Send + 'static> Intake for TaskResult<O> {
    type Payload = O;

    fn into_task<U>(self) -> Result<Task<O>, TaskResult<U>> {
        let TaskResult {
            task_id,
            worker_id,
            outcome,
            started_at,
            finished_at,
        } = self;
        match outcome {
            Ok(output) => Ok(Task {
                id: task_id,
                payload: output,
                enqueued_at: finished_at,
            }),
            Err(err) => Err(TaskResult::new(
                task_id,
                worker_id,
                Err(err),
                started_at,
                finished_at,
            )),
        }
    }
}
