//! Retry configuration and the single-retry escape hatch.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between attempts
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            max_delay: Duration::from_secs(300),
        }
    }

    /// Calculate the delay that follows a failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// A flag that lets one class of error be retried at most once per call.
///
/// Some providers return a spurious "forbidden" right after credentials are
/// issued. Retrying it forever would hide real permission problems, so the
/// predicate consults a `RetryOnce` owned by the caller:
///
/// ```
/// use retrykit::RetryOnce;
///
/// let mut forbidden = RetryOnce::new();
/// let mut is_retryable = |status: &u16| match status {
///     403 => forbidden.allow(),
///     s => retrykit::is_retryable_status(*s),
/// };
/// assert!(is_retryable(&403));
/// assert!(!is_retryable(&403));
/// assert!(is_retryable(&503));
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetryOnce {
    used: bool,
}

impl RetryOnce {
    /// Create an unused flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time it is called, `false` afterwards
    pub fn allow(&mut self) -> bool {
        !std::mem::replace(&mut self.used, true)
    }

    /// Whether the single retry has been spent
    pub fn is_used(&self) -> bool {
        self.used
    }
}

/// Whether an HTTP status code usually signals a transient condition.
///
/// Request timeouts, rate limiting and server errors qualify.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}
