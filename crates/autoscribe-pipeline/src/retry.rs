//! Backoff policies and bounded retry for transient worker errors.
//!
//! The orchestrator never retries a stage; workers that talk to flaky
//! transports use [`execute_with_retry`] internally, and the bulk queue uses a
//! [`BackoffPolicy`] to space out whole-task attempts.

use std::future::Future;
use std::time::Duration;

use autoscribe_types::{AutoscribeError, Result, Stage};
use serde::{Deserialize, Serialize};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// No delay between retries.
    None,
    /// Fixed delay between retries.
    Fixed { delay_ms: u64 },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let factor = 2u64.saturating_pow(attempt.min(u32::MAX as usize) as u32);
                Duration::from_millis(base_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

/// Call `f` up to `max_retries + 1` times, retrying only errors for which
/// [`AutoscribeError::is_retryable`] holds.
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    stage: Stage,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    stage = %stage,
                    attempt,
                    delay_ms = %delay.as_millis(),
                    error = %e,
                    "Retryable worker error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(stage = %stage, attempts = attempt + 1, "Retries exhausted");
                return Err(AutoscribeError::WorkerFailure {
                    stage,
                    message: format!("gave up after {} attempts: {e}", attempt + 1),
                });
            }
            Err(e) => return Err(e),
        }
    }
}
