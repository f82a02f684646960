//! Caller-side retry for transient system faults.
//!
//! The engine never retries on its own: a request runs at most once per call to
//! [`ExecutionEngine::invoke`]. Callers that prefer another attempt on a fresh sandbox after a
//! provisioning failure or a crashed runtime can wrap the call with [`invoke_with_retry`].
//!
//! Only [`SystemFaultReason::is_retryable`] faults are retried. User faults and timeouts are
//! returned as-is, and every attempt shares the original request deadline, so retrying never
//! extends the time a caller waits.
//!
//! ```rust,ignore
//! use fnexec::retry::{RetryConfig, invoke_with_retry};
//!
//! let config = RetryConfig::default().with_max_retries(2);
//! let result = invoke_with_retry(&engine, &config, request).await;
//! ```

use crate::engine::ExecutionEngine;
use crate::types::{InvocationRequest, InvocationResult, Outcome};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Backoff between caller-side retries. Delays double from `base_delay` up to `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the initial try)
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomise each delay by up to ±50%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay before retry number `attempt` (0-indexed) with `remaining` left until the
    /// deadline, or `None` when the retry would not get at least as long to run as it waited.
    pub fn backoff(&self, attempt: u32, remaining: Duration) -> Option<Duration> {
        let delay = self
            .base_delay
            .saturating_mul(1 << attempt.min(16))
            .min(self.max_delay);
        let delay = if self.jitter { jittered(delay) } else { delay };
        (delay.saturating_mul(2) < remaining).then_some(delay)
    }
}

fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let base_ms = delay.as_millis() as f64;
    let spread = base_ms * 0.5;
    let jitter = rand::rng().random_range(-spread..spread);
    Duration::from_millis((base_ms + jitter).max(0.0) as u64)
}

/// Whether another attempt could produce a different outcome.
pub fn is_retryable(outcome: &Outcome) -> bool {
    match outcome {
        Outcome::SystemFault { reason, .. } => reason.is_retryable(),
        _ => false,
    }
}

/// Invoke `request`, re-invoking on retryable system faults while the deadline allows.
///
/// Returns the last result. The request id is reused for every attempt.
pub async fn invoke_with_retry(
    engine: &ExecutionEngine,
    config: &RetryConfig,
    request: InvocationRequest,
) -> InvocationResult {
    let deadline = request.deadline;
    let mut attempt = 0;
    loop {
        let result = engine.invoke(request.clone()).await;
        if !is_retryable(&result.outcome) || attempt >= config.max_retries {
            return result;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(delay) = config.backoff(attempt, remaining) else {
            debug!(
                "not retrying {} after {}: deadline too close",
                request.request_id,
                result.outcome.kind().as_str()
            );
            return result;
        };

        attempt += 1;
        debug!(
            "retrying {} (attempt {}/{}) in {}ms after {:?}",
            request.request_id,
            attempt,
            config.max_retries,
            delay.as_millis(),
            result.outcome
        );
        tokio::time::sleep(delay).await;
    }
}
