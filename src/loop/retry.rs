//! Backoff and retry for CI provider fetches.
//!
//! Transient fetch failures (network errors, rate limits, provider 5xx) are
//! retried with capped exponential backoff. Authorization failures are never
//! retried.
//!
//! # Example
//!
//! ```
//! use ci_autorepair::r#loop::retry::calculate_backoff;
//! use std::time::Duration;
//!
//! assert_eq!(calculate_backoff(1), Duration::from_millis(2000));
//! assert_eq!(calculate_backoff(2), Duration::from_millis(4000));
//! assert_eq!(calculate_backoff(3), Duration::from_millis(8000));
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::ci::FetchError;

// ============================================================================
// Backoff Constants and Calculation
// ============================================================================

/// Base backoff delay in milliseconds for retry attempts.
pub const RETRY_BACKOFF_BASE_MS: u64 = 2000;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Multiplier for exponential backoff.
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Calculate exponential backoff delay for a given attempt number.
///
/// `attempt` is 1-indexed. The first retry waits the base delay.
#[must_use]
pub fn calculate_backoff(attempt: u32) -> Duration {
    backoff_from(
        Duration::from_millis(RETRY_BACKOFF_BASE_MS),
        Duration::from_millis(MAX_BACKOFF_MS),
        attempt,
    )
}

fn backoff_from(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let multiplier = BACKOFF_MULTIPLIER.saturating_pow(exponent);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}

// ============================================================================
// Fetch Retry Policy
// ============================================================================

/// How transient fetch failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries including the first. At least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(RETRY_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(MAX_BACKOFF_MS),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Delay before retry number `attempt` (1-indexed).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_from(self.base_delay, self.max_delay, attempt)
    }

    /// Run `op` until it succeeds, fails with an auth error, or the attempt
    /// budget is spent.
    ///
    /// On exhaustion the last transient error is returned together with the
    /// number of attempts made.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, (FetchError, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth() => return Err((e, attempt)),
                Err(e) if attempt >= self.max_attempts => {
                    warn!("{} failed after {} attempts: {}", what, attempt, e);
                    return Err((e, attempt));
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    debug!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        what, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_delays(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(calculate_backoff(1), Duration::from_millis(2000));
        assert_eq!(calculate_backoff(4), Duration::from_millis(16_000));
        assert_eq!(calculate_backoff(5), Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(calculate_backoff(40), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[test]
    fn test_attempt_zero_uses_base() {
        assert_eq!(calculate_backoff(0), Duration::from_millis(RETRY_BACKOFF_BASE_MS));
    }

    #[test]
    fn test_policy_never_below_one_attempt() {
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let result = fast(5)
            .run("fetch", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::transient("HTTP 502"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(3)
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::transient("connection reset"))
            })
            .await;
        let (err, attempts) = result.unwrap_err();
        assert_eq!(attempts, 3);
        assert!(!err.is_auth());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_auth_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(5)
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::auth("HTTP 401"))
            })
            .await;
        let (err, attempts) = result.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
