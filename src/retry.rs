//! Retry policy for provisioning sub-operations, and the end-to-end deadline
//! that bounds every wait in a workflow.
//!
//! Retry applies to sub-operations (sandbox creation, status queries), never
//! to orchestrator steps. Only transient failures are retried, with a linear
//! `base * attempt` delay and a small attempt ceiling.

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::errors::{ErrorKind, ProvisionError};

/// Lowercased message fragments that identify network/timeout class failures.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "econnrefused",
    "connection refused",
    "econnreset",
    "connection reset",
    "enotfound",
    "name resolution",
    "failed to lookup address",
    "dns error",
    "etimedout",
    "timed out",
    "timeout",
    "socket hang up",
    "broken pipe",
    "transport error",
];

pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Whether `err` belongs to the retryable class.
pub fn is_transient(err: &ProvisionError) -> bool {
    match err.kind() {
        ErrorKind::Transient => true,
        ErrorKind::Other | ErrorKind::Remote => is_transient_message(&err.to_string()),
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Decide what to do after attempt number `attempt` (1-based) failed
    /// with `err`.
    pub fn should_retry(&self, err: &ProvisionError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts || !is_transient(err) {
            return RetryDecision::stop();
        }
        RetryDecision {
            retry: true,
            delay: self.base_delay * attempt,
        }
    }

    /// Run `op` until it succeeds, fails non-transiently, or runs out of
    /// attempts. `op` receives the 1-based attempt number.
    ///
    /// Callers wrapping a creation must re-check for existence inside `op`
    /// on attempts after the first so a retry never creates a duplicate.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, ProvisionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProvisionError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let decision = self.should_retry(&err, attempt);
                    if !decision.retry {
                        debug!(operation, attempt, error = %err, "Not retrying");
                        return Err(err);
                    }
                    warn!(
                        operation,
                        attempt,
                        delay_ms = decision.delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry"
                    );
                    sleep_or_cancel(decision.delay, cancel).await?;
                    attempt += 1;
                }
            }
        }
    }
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ProvisionError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProvisionError::Cancelled("operation cancelled".into())),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Single time budget shared by every wait in one workflow run.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// `wait` capped to whatever budget is left.
    pub fn clamp(&self, wait: Duration) -> Duration {
        wait.min(self.remaining())
    }
}
