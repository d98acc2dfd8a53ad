//! Transient I/O retry
//!
//! Storage backends recover locally from transient failures before a
//! `StorageError` surfaces: up to three attempts with jittered exponential
//! backoff.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

/// Backoff settings for transient storage retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry (0-based retry index).
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let base = self.initial_backoff_ms.saturating_mul(1u64 << retry.min(16));
        let capped = base.min(self.max_backoff_ms);
        let with_jitter = if self.jitter {
            // Up to 25% extra so concurrent retries spread out
            capped + (capped as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            capped
        };
        Duration::from_millis(with_jitter)
    }
}

/// Run `f`, retrying transient failures per `policy`.
///
/// Non-transient errors (invalid key, oversized entry) surface immediately.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
) -> CacheResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CacheResult<T>>,
{
    let mut last_error = None;
    for attempt in 0..policy.max_attempts {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "storage operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient storage error, retrying"
                );
                tokio::time::sleep(delay).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    // Unreachable unless max_attempts is 0; treat as exhausted
    Err(last_error.unwrap_or_else(|| CacheError::Storage(format!("{operation} exhausted retries"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 300,
            jitter: false,
        };
        assert_eq!(policy.backoff_delay(0).as_millis(), 100);
        assert_eq!(policy.backoff_delay(1).as_millis(), 200);
        assert_eq!(policy.backoff_delay(2).as_millis(), 300); // capped
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result = retry_transient(&fast_policy(), "put_blob", move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CacheError::Storage("flaky".to_string()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: CacheResult<()> = retry_transient(&fast_policy(), "put_blob", move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::InvalidKey("a/b".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let result: CacheResult<()> = retry_transient(&fast_policy(), "get_blob", move || {
            let calls = Arc::clone(&calls_clone);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::Storage("down".to_string()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
