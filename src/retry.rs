//! Retry logic with exponential backoff
//!
//! Transfers are retried inside a single task attempt: the task stays Running
//! while the backoff sleeps, and a triggered cancellation token cuts the sleep
//! short.
//!
//! # Example
//!
//! ```no_run
//! use illust_dl::retry::fetch_with_retry;
//! use illust_dl::config::RetryConfig;
//! use illust_dl::error::TransferError;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), TransferError> {
//! let config = RetryConfig::default();
//! let token = CancellationToken::new();
//! let body = fetch_with_retry(&config, &token, || async {
//!     Ok::<_, TransferError>(b"image bytes".to_vec())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::TransferError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (not found, forbidden, disk full, cancellation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for TransferError {
    fn is_retryable(&self) -> bool {
        match self {
            // Server-side trouble and rate limiting are worth another try
            TransferError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            TransferError::Network(_) | TransferError::Timeout(_) => true,
            // Local disk problems won't fix themselves between attempts
            TransferError::Io { .. } => false,
            TransferError::Cancelled => false,
            TransferError::EmptyBody(_) => false,
        }
    }
}

/// Execute an async transfer operation with exponential backoff retry logic
///
/// The operation runs once, then up to `config.max_attempts` more times while it
/// keeps failing with retryable errors. If `token` is triggered during a backoff
/// sleep the loop stops with [`TransferError::Cancelled`].
pub async fn fetch_with_retry<F, Fut, T>(
    config: &RetryConfig,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransferError>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Transfer succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Transfer failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::select! {
                    _ = token.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(jittered_delay) => {}
                }

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Transfer failed after all retry attempts exhausted"
                    );
                } else if !matches!(e, TransferError::Cancelled) {
                    tracing::debug!(error = %e, "Transfer failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
