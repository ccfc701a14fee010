//! # retrykit
//!
//! Generic exponential-backoff retry for the network calls resource handlers
//! make. The reconciliation engine never retries on its own; providers wrap
//! their API calls with [`with_backoff`] or [`with_retry`] and decide which
//! errors are transient.
//!
//! ## Example
//!
//! ```no_run
//! use retrykit::{RetryOnce, with_backoff, is_retryable_status};
//! use std::time::Duration;
//!
//! # async fn call_api() -> Result<String, u16> { Ok(String::new()) }
//! # async fn example() -> Result<(), u16> {
//! let mut forbidden = RetryOnce::new();
//! let body = with_backoff(
//!     || call_api(),
//!     |status: &u16| match status {
//!         403 => forbidden.allow(),
//!         s => is_retryable_status(*s),
//!     },
//!     5,
//!     Duration::from_millis(500),
//! )
//! .await?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod retry;
pub mod types;

pub use retry::{LogCallback, NoCallback, RetryCallback, with_backoff, with_retry};
pub use types::{RetryConfig, RetryOnce, is_retryable_status};
