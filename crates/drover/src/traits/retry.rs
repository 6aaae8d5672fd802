//! Retry utilities
//!
//! Configurable exponential backoff shared by the provider (SELECT retries)
//! and the HTTP executor (attempt backoff window).

use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry (lower edge of the backoff window)
    pub initial_delay: Duration,
    /// Maximum delay between retries (upper edge of the backoff window)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry)
    pub backoff_multiplier: f64,
    /// Optional jitter factor (0.0 to 1.0) to add randomness to delays
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Create a retry config from a `[min, max]` backoff window
    pub fn window(max_retries: u32, min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: min_wait,
            max_delay: max_wait.max(min_wait),
            ..Default::default()
        }
    }

    /// Set jitter factor (builder pattern)
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Calculate delay before retry number `attempt` (1-indexed; 0 means no delay).
    ///
    /// The result always stays within `[initial_delay, max_delay]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // cap attempt to prevent i32 overflow and degenerate backoff
        let capped_attempt = attempt.min(30);
        let min_ms = self.initial_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let base_delay = min_ms * self.backoff_multiplier.powi(capped_attempt as i32 - 1);
        let capped_delay = base_delay.min(max_ms);

        let jitter = if self.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.jitter_factor;
            // Deterministic jitter based on attempt number
            let jitter_value = (attempt as f64 * 0.618033988749895) % 1.0;
            jitter_range * (jitter_value - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((capped_delay + jitter).clamp(min_ms, max_ms.max(min_ms)) as u64)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T> {
    /// The successful result, if any
    pub result: Option<T>,
    /// Number of attempts made
    pub attempts: u32,
    /// Last error encountered (if failed)
    pub last_error: Option<StoreError>,
}

impl<T> RetryResult<T> {
    /// Get the result or the last error
    pub fn into_result(self) -> Result<T, StoreError> {
        match self.result {
            Some(value) => Ok(value),
            None => Err(self.last_error.unwrap_or_else(|| {
                StoreError::Unavailable("retry exhausted with no error".to_string())
            })),
        }
    }
}

/// Execute an async store operation with retry logic.
///
/// Only [`StoreError::is_retryable`] errors are retried.
pub async fn retry<T, F, Fut>(config: &RetryConfig, mut operation: F) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => {
                return RetryResult {
                    result: Some(value),
                    attempts,
                    last_error: None,
                };
            }
            Err(error) => {
                if error.is_retryable() && attempts <= config.max_retries {
                    let delay = config.delay_for_attempt(attempts);
                    tracing::debug!(
                        attempt = attempts,
                        max_retries = config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying store operation: {}",
                        error
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    return RetryResult {
                        result: None,
                        attempts,
                        last_error: Some(error),
                    };
                }
            }
        }
    }
}
