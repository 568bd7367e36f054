//! Error taxonomy for task processing.
//!
//! Task-level failures never cross a worker boundary as panics or `Err`
//! returns; they are converted into an [`ErrorInfo`] carried by the
//! [`TaskResult`](crate::TaskResult) of the task that failed.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by task execution functions.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Classification of a task failure, without its details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input task. Not retried.
    Validation,
    /// An unavailable dependency. Safe to retry by resubmitting the task.
    Resource,
    /// The operation exceeded its deadline.
    Timeout,
    /// Pool-wide shutdown was in progress. Never retried automatically.
    Cancelled,
    /// Abnormal termination of task logic, or an error nobody recognized.
    Unclassified,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Resource => write!(f, "resource"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
            ErrorKind::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Classified failure attached to a task result.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorInfo {
    #[error("Validation failure: {0}")]
    ValidationFailure(String),

    #[error("Resource failure: {0}")]
    ResourceFailure(String),

    #[error("Timed out after {budget:?}")]
    Timeout { budget: Duration },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Unclassified failure: {description}")]
    Unclassified {
        description: String,
        /// Diagnostic trace captured where the fault happened, if available.
        trace: Option<String>,
    },
}

impl ErrorInfo {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationFailure(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Self::ResourceFailure(msg.into())
    }

    pub fn timeout(budget: Duration) -> Self {
        Self::Timeout { budget }
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn unclassified(description: impl Into<String>, trace: Option<String>) -> Self {
        Self::Unclassified {
            description: description.into(),
            trace,
        }
    }

    /// Build an `ErrorInfo` of the given kind from a textual description.
    ///
    /// `Timeout` has no description slot, so the budget is reported as zero.
    pub fn from_kind(kind: ErrorKind, description: impl Into<String>) -> Self {
        let description = description.into();
        match kind {
            ErrorKind::Validation => Self::ValidationFailure(description),
            ErrorKind::Resource => Self::ResourceFailure(description),
            ErrorKind::Timeout => Self::Timeout {
                budget: Duration::ZERO,
            },
            ErrorKind::Cancelled => Self::Cancelled(description),
            ErrorKind::Unclassified => Self::Unclassified {
                description,
                trace: None,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorInfo::ValidationFailure(_) => ErrorKind::Validation,
            ErrorInfo::ResourceFailure(_) => ErrorKind::Resource,
            ErrorInfo::Timeout { .. } => ErrorKind::Timeout,
            ErrorInfo::Cancelled(_) => ErrorKind::Cancelled,
            ErrorInfo::Unclassified { .. } => ErrorKind::Unclassified,
        }
    }

    /// The original failure's textual description.
    pub fn description(&self) -> String {
        match self {
            ErrorInfo::ValidationFailure(d)
            | ErrorInfo::ResourceFailure(d)
            | ErrorInfo::Cancelled(d) => d.clone(),
            ErrorInfo::Timeout { budget } => format!("deadline of {budget:?} exceeded"),
            ErrorInfo::Unclassified { description, .. } => description.clone(),
        }
    }

    pub fn trace(&self) -> Option<&str> {
        match self {
            ErrorInfo::Unclassified { trace, .. } => trace.as_deref(),
            _ => None,
        }
    }

    /// Whether resubmitting the task may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Resource | ErrorKind::Timeout)
    }
}

/// Error type for task authors who want their failures classified.
///
/// Returning a `TaskFailure` from an execution function lets the
/// [`DefaultClassifier`](crate::DefaultClassifier) tell malformed input apart
/// from an unavailable dependency.
#[derive(Error, Debug)]
pub enum TaskFailure {
    #[error("invalid {field}: {issue}")]
    Validation { field: String, issue: String },

    #[error("{operation} failed: {source}")]
    Resource {
        operation: String,
        #[source]
        source: TaskError,
    },
}

impl TaskFailure {
    pub fn validation(field: impl Into<String>, issue: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            issue: issue.into(),
        }
    }

    pub fn resource(operation: impl Into<String>, source: impl Into<TaskError>) -> Self {
        Self::Resource {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskFailure::Validation { .. } => ErrorKind::Validation,
            TaskFailure::Resource { .. } => ErrorKind::Resource,
        }
    }
}

/// Invalid construction-time configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors reported to producers submitting work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("submission is closed")]
    Closed,

    #[error("pipeline was cancelled")]
    Cancelled,

    #[error("source queue is full")]
    Full,
}
