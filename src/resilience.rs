//! Retry policy for transient failures.
//!
//! Used when opening sessions: serverless databases report error 42109
//! while they resume, and a short backoff lets the login succeed.

use crate::error::ConnectionError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Initial delay between retries.
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    pub max_delay: Duration,

    /// Multiplier for exponential backoff.
    pub multiplier: f64,

    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Login retries: the first attempt plus two retries with a longer backoff.
    pub fn login() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// Calculate delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay_ms = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt.saturating_sub(1) as i32);

        let capped_delay_ms = base_delay_ms.min(self.max_delay.as_millis() as f64);

        let final_delay_ms = if self.jitter {
            // Add +/- 25% jitter
            let jitter_factor = 0.75 + (rand_jitter() * 0.5);
            capped_delay_ms * jitter_factor
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms as u64)
    }
}

/// Pseudo-random value in [0, 1) from the clock's sub-second nanos.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    (nanos as f64) / (u32::MAX as f64)
}

/// Result of a retry operation.
#[derive(Debug)]
pub struct RetryResult<T> {
    /// The successful result, if any.
    pub value: Option<T>,

    /// Number of attempts made.
    pub attempts: u32,

    /// The last error encountered, if all attempts failed.
    pub last_error: Option<ConnectionError>,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.value.is_some()
    }

    pub fn into_result(self) -> Result<T, ConnectionError> {
        match self.value {
            Some(v) => Ok(v),
            None => Err(self
                .last_error
                .unwrap_or_else(|| ConnectionError::internal("Retry failed with no error captured"))),
        }
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the attempts run out.
pub async fn retry_async<F, Fut, T, P>(
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectionError>>,
    P: Fn(&ConnectionError) -> bool,
{
    let max_attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt);
            debug!("Retry attempt {} after {:?} delay", attempt + 1, delay);
            sleep(delay).await;
        }

        match operation().await {
            Ok(value) => {
                return RetryResult {
                    value: Some(value),
                    attempts: attempt + 1,
                    last_error: None,
                };
            }
            Err(e) if !should_retry(&e) => {
                debug!("Not retrying: {}", e);
                return RetryResult {
                    value: None,
                    attempts: attempt + 1,
                    last_error: Some(e),
                };
            }
            Err(e) => {
                warn!(
                    "Transient error on attempt {}/{}: {}",
                    attempt + 1,
                    max_attempts,
                    e
                );
                last_error = Some(e);
            }
        }
    }

    RetryResult {
        value: None,
        attempts: max_attempts,
        last_error,
    }
}
