//! Construction-time configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Default capacity for queues between stages.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// Configuration shared by pools and pipelines.
///
/// The error classifier is not part of it; it is code, set on the builders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Degree of parallelism of a pool.
    pub worker_count: usize,
    /// Backpressure threshold of every queue. `0` makes each hand-off a rendezvous.
    pub queue_capacity: usize,
    /// Wall-clock budget for a whole run, in milliseconds.
    pub deadline_ms: Option<u64>,
    /// How long a cancelled worker keeps trying to deliver a result to a full
    /// output queue before reporting it as dropped.
    pub drain_timeout_ms: u64,
    /// Record a backtrace for panicking task logic.
    pub capture_traces: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            deadline_ms: None,
            drain_timeout_ms: 1000,
            capture_traces: true,
        }
    }
}

impl EngineConfig {
    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(whole_millis(deadline));
        self
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout_ms = whole_millis(drain_timeout);
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.deadline_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "deadline must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Milliseconds, rounded up so a nonzero duration never becomes zero.
fn whole_millis(duration: Duration) -> u64 {
    let millis = duration.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX)
}
