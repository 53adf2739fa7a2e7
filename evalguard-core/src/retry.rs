//! Per-call retry policy for model backends.
//!
//! Transient failures (rate limits, timeouts, connection errors) are retried
//! with capped exponential backoff; permanent failures return immediately.
//! Each attempt is bounded by the configured call timeout, and an elapsed
//! timeout counts as a transient failure.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::BackendError;

/// Execute a backend call with timeout and exponential backoff retry.
///
/// Respects `retry_after_secs` on `BackendError::RateLimited`.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    call_timeout: Duration,
    operation: F,
) -> Result<T, BackendError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        let outcome = match tokio::time::timeout(call_timeout, operation()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BackendError::Timeout {
                timeout_secs: call_timeout.as_secs(),
            }),
        };
        let err = match outcome {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        if !err.is_transient() || attempt >= config.max_retries {
            return Err(err);
        }

        let backoff_ms = compute_backoff(config, attempt, &err);
        tracing::warn!(
            attempt = attempt + 1,
            max = config.max_retries,
            backoff_ms = backoff_ms,
            error = %err,
            "Retrying backend call after transient error"
        );
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

/// Compute backoff delay, respecting rate limit retry-after hints.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &BackendError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let BackendError::RateLimited { retry_after_secs } = err {
        return retry_after_secs.saturating_mul(1000).max(computed);
    }
    computed
}

/// Pure exponential backoff with optional jitter.
fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // Up to 25% jitter
        let jitter = (capped as f64 * 0.25 * rand::thread_rng().r#gen::<f64>()) as u64;
        capped + jitter
    } else {
        capped
    }
}
