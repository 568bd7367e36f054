//! # Deadline Controller
//!
//! Puts a wall-clock budget on a blocking wait. On expiry the caller gets an
//! [`ErrorInfo::Timeout`] immediately and a cancellation is broadcast through
//! a [`CancellationToken`]. Running task logic is never interrupted: workers
//! observe the token at their next task boundary.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ErrorInfo;

/// Wait for `op` for at most `budget`.
///
/// On expiry `op` is dropped and `ErrorInfo::Timeout` is returned.
pub async fn await_with_deadline<F>(op: F, budget: Duration) -> Result<F::Output, ErrorInfo>
where
    F: Future,
{
    tokio::time::timeout(budget, op)
        .await
        .map_err(|_| ErrorInfo::timeout(budget))
}

/// A time budget bound to a cancellation token.
#[derive(Debug, Clone)]
pub struct DeadlineController {
    budget: Duration,
    deadline: Instant,
    token: CancellationToken,
}

impl DeadlineController {
    /// Start a budget now, with a fresh token.
    pub fn new(budget: Duration) -> Self {
        Self::with_token(budget, CancellationToken::new())
    }

    /// Start a budget now; expiry cancels `token`.
    pub fn with_token(budget: Duration, token: CancellationToken) -> Self {
        Self {
            budget,
            deadline: Instant::now() + budget,
            token,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Wait for `op` until the deadline. Expiry cancels the token.
    pub async fn run<F>(&self, op: F) -> Result<F::Output, ErrorInfo>
    where
        F: Future,
    {
        match tokio::time::timeout_at(self.deadline, op).await {
            Ok(output) => Ok(output),
            Err(_) => {
                self.expire();
                Err(ErrorInfo::timeout(self.budget))
            }
        }
    }

    /// Spawn a watchdog that cancels the token when the budget runs out.
    ///
    /// The watchdog exits early once the token is cancelled or `done`
    /// resolves. Its handle yields `true` if the deadline fired.
    pub fn arm<F>(&self, done: F) -> JoinHandle<bool>
    where
        F: Future + Send + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = this.token.cancelled() => false,
                _ = done => {
                    debug!(budget = ?this.budget, "Operation finished within its deadline");
                    false
                }
                _ = tokio::time::sleep_until(this.deadline) => {
                    this.expire();
                    true
                }
            }
        })
    }

    fn expire(&self) {
        if !self.token.is_cancelled() {
            warn!(budget = ?self.budget, "Deadline expired, cancelling");
            self.token.cancel();
        }
    }
}
