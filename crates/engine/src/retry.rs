//! Bounded retries with exponential backoff.

use crate::error::{LoadError, LoadResult};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use updraft_core::config::LoaderConfig;

/// Run `fut` under a timeout, aborting early on cancellation.
///
/// An elapsed timeout is reported as a network error.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    cancel: &CancellationToken,
    fut: Fut,
) -> LoadResult<T>
where
    Fut: Future<Output = LoadResult<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(LoadError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => {
            result.unwrap_or(Err(LoadError::Timeout(timeout)))
        }
    }
}

/// Retries an operation on retryable failures.
///
/// Makes at most `config.max_attempts` attempts, sleeping
/// `config.backoff(n)` before retry `n`. Non-retryable errors and
/// cancellation return immediately.
pub async fn with_retry<T, F, Fut>(
    config: &LoaderConfig,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> LoadResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LoadResult<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.backoff(attempt);
                tracing::warn!(
                    target_name = what,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Fetch failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LoadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
