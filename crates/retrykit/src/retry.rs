//! Retry logic with exponential backoff for transient errors.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::types::RetryConfig;

/// Callback trait for retry progress notifications.
pub trait RetryCallback: Send + Sync {
    /// Called when an operation is about to be retried.
    ///
    /// # Arguments
    /// * `attempt` - The attempt that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Time until the next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &dyn fmt::Display, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _max_attempts: u32, _error: &dyn fmt::Display, _delay: Duration) {
    }
}

/// Callback that reports retries through the `log` facade.
pub struct LogCallback;

impl RetryCallback for LogCallback {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &dyn fmt::Display, delay: Duration) {
        log::warn!(
            "Attempt {}/{} failed: {}. Retrying in {:?}...",
            attempt,
            max_attempts,
            error,
            delay
        );
    }
}

/// Execute an async operation with retry logic.
///
/// Retries while `is_retryable` accepts the error, sleeping with exponential
/// backoff between attempts. `config.max_attempts` includes the first
/// attempt; once it is exhausted the last error is returned unchanged.
/// A non-retryable error is returned immediately.
///
/// The predicate is `FnMut` so it can consult caller-owned state such as a
/// [`crate::RetryOnce`] flag.
pub async fn with_retry<T, E, F, Fut, P>(
    config: &RetryConfig,
    callback: Option<&dyn RetryCallback>,
    mut action: F,
    mut is_retryable: P,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let error = match action().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt + 1 >= max_attempts || !is_retryable(&error) {
            return Err(error);
        }

        let delay = config.delay_for_attempt(attempt);
        log::debug!(
            "retryable error on attempt {}/{}: {}",
            attempt + 1,
            max_attempts,
            error
        );
        if let Some(cb) = callback {
            cb.on_retry(attempt + 1, max_attempts, &error, delay);
        }

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Retry `action` with exponential backoff starting at `initial_delay`.
///
/// Shorthand for [`with_retry`] with a doubling backoff and no callback.
pub async fn with_backoff<T, E, F, Fut, P>(
    action: F,
    is_retryable: P,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    E: fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    let config = RetryConfig::new(max_attempts, initial_delay, 2.0);
    with_retry(&config, None, action, is_retryable).await
}
