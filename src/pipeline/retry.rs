use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{CurateError, Result};
use crate::observability::metrics;

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max_delay_ms`.
pub fn compute_backoff(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay_ms = retry.base_delay_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(retry.max_delay_ms))
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached. Backoff sleeps end early on cancellation.
pub async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    cancel: &CancellationToken,
    dataset: &str,
    partition: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                let delay = compute_backoff(retry, attempt);
                warn!(
                    "🔁 {}/{} attempt {}/{} failed: {}; retrying in {:?}",
                    dataset, partition, attempt, retry.max_attempts, err, delay
                );
                metrics::storage::retry(dataset);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(CurateError::Cancelled {
                            dataset: dataset.to_string(),
                            partition: partition.to_string(),
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
