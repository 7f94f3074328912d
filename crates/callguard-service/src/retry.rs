//! Retrying of failed network calls.
//!
//! Attempts are numbered from `0`. A call with `max_attempts` retries is attempted at most
//! `max_attempts + 1` times, and only the final failure is reported.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

use crate::config::RetryConfig;
use crate::error::{CallError, InvokeError};

/// Exponential backoff between attempts.
///
/// The delay before retry `n + 1` is `initial * 2^n`, capped at `max`. It only depends on the
/// attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Backoff {
    /// Retry immediately.
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// The delay after the failed attempt number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// The lifecycle of a retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryState<T> {
    Idle,
    Attempting(u32),
    Succeeded(T),
    Failed(CallError),
}

impl<T> RetryState<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryState::Succeeded(_) | RetryState::Failed(_))
    }
}

/// Decides which failures are retried and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retryable_statuses: BTreeSet<u16>,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(retryable_statuses: impl IntoIterator<Item = u16>, backoff: Backoff) -> Self {
        Self {
            retryable_statuses: retryable_statuses.into_iter().collect(),
            backoff,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.retryable_statuses.iter().copied(), config.backoff)
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Maps what the wire reported to what callers see.
    ///
    /// Statuses in the retryable set are server failures, all others client failures.
    pub fn classify(&self, error: InvokeError) -> CallError {
        match error {
            InvokeError::Transport(message) => CallError::Transport(message),
            InvokeError::Timeout(duration) => CallError::Timeout(duration),
            InvokeError::Status(status) if self.retryable_statuses.contains(&status) => {
                CallError::Server(status)
            }
            InvokeError::Status(status) => CallError::Client(status),
            InvokeError::InvalidRequest(message) => CallError::InvalidRequest(message),
        }
    }

    pub fn is_retryable(&self, failure: &CallError) -> bool {
        matches!(
            failure,
            CallError::Transport(_) | CallError::Timeout(_) | CallError::Server(_)
        )
    }

    /// Whether attempt number `attempt` failing with `failure` should be followed by another one.
    pub fn should_retry(&self, attempt: u32, max_attempts: u32, failure: &CallError) -> bool {
        attempt < max_attempts && self.is_retryable(failure)
    }

    /// The state following attempt number `attempt` with the given `result`.
    pub fn advance<T>(
        &self,
        attempt: u32,
        max_attempts: u32,
        result: Result<T, CallError>,
    ) -> RetryState<T> {
        match result {
            Ok(value) => RetryState::Succeeded(value),
            Err(failure) if self.should_retry(attempt, max_attempts, &failure) => {
                tracing::debug!(attempt, error = %failure, "Retrying failed call");
                RetryState::Attempting(attempt + 1)
            }
            Err(failure) => RetryState::Failed(failure),
        }
    }

    /// Drives `attempt` until it succeeds or runs out of retries.
    ///
    /// `attempt` receives the attempt number. Backoff delays are slept on the tokio timer.
    pub async fn run<T, F, Fut>(&self, max_attempts: u32, mut attempt: F) -> Result<T, CallError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        let mut state = RetryState::Idle;
        loop {
            state = match state {
                RetryState::Idle => RetryState::Attempting(0),
                RetryState::Attempting(n) => {
                    if n > 0 {
                        metric!(counter("calls.retries") += 1);
                        let delay = self.backoff.delay(n - 1);
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    let result = attempt(n).await.map_err(|e| self.classify(e));
                    self.advance(n, max_attempts, result)
                }
                RetryState::Succeeded(value) => return Ok(value),
                RetryState::Failed(failure) => return Err(failure),
            };
        }
    }
}
