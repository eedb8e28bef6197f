//! Attempt ceiling and exponential backoff shared by map items and merge calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{meta, ErrorCode, OrchestraResult, PipelineError};

/// Retry configuration. `max_attempts` counts the first try.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// No retries: one attempt only.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64, multiplier: f64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self.multiplier = multiplier;
        self
    }

    pub fn validate(&self) -> OrchestraResult<()> {
        if self.max_attempts == 0 {
            return Err(invalid("maxAttempts must be at least 1"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(invalid("multiplier must be a finite number >= 1"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid("maxBackoffMs must not be below initialBackoffMs"));
        }
        Ok(())
    }

    /// Delay before attempt `attempt + 1`, given `attempt` already failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable code, or the
    /// ceiling is reached.
    ///
    /// `op` receives the 1-based attempt number. Cancellation is checked
    /// before every attempt and during backoff. A retryable failure on the
    /// last attempt becomes `RETRY_EXHAUSTED` wrapping the final error;
    /// non-retryable failures come back with an `attempt` meta entry.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> OrchestraResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = OrchestraResult<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(PipelineError::cancelled(format!(
                    "{label} cancelled before attempt {attempt}"
                )));
            }

            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.is_cancelled() {
                return Err(err);
            }
            if !err.is_retryable() {
                return Err(err.with_meta("attempt", attempt));
            }
            if attempt >= max_attempts {
                tracing::warn!(label, attempts = attempt, code = %err.code(), "retries exhausted");
                return Err(err.wrap_as(
                    ErrorCode::RetryExhausted,
                    format!("{label} failed after {attempt} attempts"),
                    meta([("attempt", attempt), ("maxAttempts", max_attempts)]),
                ));
            }

            let delay = self.backoff(attempt);
            tracing::debug!(
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = %err.code(),
                "retrying after failure"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(PipelineError::cancelled(format!(
                        "{label} cancelled during backoff"
                    )));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn invalid(message: &str) -> PipelineError {
    PipelineError::new(ErrorCode::PipelineConfigInvalid, format!("Invalid retry policy: {message}"))
        .with_meta("section", "retry")
}
