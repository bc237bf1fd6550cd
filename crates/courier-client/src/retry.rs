// Exponential backoff with jitter, for RPC retries and stream reconnects.
use courier_common::{Status, StatusCode};
use courier_transport::TransportResult;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{BackoffSettings, RetrySettings};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RetryError {
    /// Non-retryable status, returned on the attempt that produced it.
    Permanent(Status),
    /// The total budget ran out; carries the last retryable status seen.
    DeadlineExceeded { budget: Duration, last: Status },
}

/// Uniform in `[delay / 2, delay]`.
pub(crate) fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let low = delay / 2;
    rand::thread_rng().gen_range(low..=delay)
}

fn scale(duration: Duration, multiplier: f64, cap: Duration) -> Duration {
    duration.mul_f64(multiplier).min(cap)
}

/// Runs `call` until it succeeds, fails permanently, or `settings.total_timeout`
/// is spent. Each attempt is bounded by the current RPC timeout.
pub(crate) async fn call_with_retry<T, F, Fut>(
    settings: &RetrySettings,
    operation: &'static str,
    mut call: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    let deadline = Instant::now() + settings.total_timeout;
    let mut delay = settings.initial_retry_delay;
    let mut rpc_timeout = settings.initial_rpc_timeout;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt_timeout = rpc_timeout.min(remaining);
        let status = match tokio::time::timeout(attempt_timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(status)) => status,
            Err(_) => Status::new(
                StatusCode::DeadlineExceeded,
                format!("{operation} attempt {attempt} timed out after {attempt_timeout:?}"),
            ),
        };
        if !settings.is_retryable(status.code) {
            return Err(RetryError::Permanent(status));
        }
        let sleep = jittered(delay);
        if Instant::now() + sleep >= deadline {
            tracing::debug!(
                operation,
                attempt,
                error = %status,
                "retry budget exhausted"
            );
            return Err(RetryError::DeadlineExceeded {
                budget: settings.total_timeout,
                last: status,
            });
        }
        tracing::debug!(operation, attempt, error = %status, backoff = ?sleep, "retrying rpc");
        metrics::counter!("courier_rpc_retries_total", "operation" => operation).increment(1);
        tokio::time::sleep(sleep).await;
        delay = scale(delay, settings.retry_delay_multiplier, settings.max_retry_delay);
        rpc_timeout = scale(rpc_timeout, settings.rpc_timeout_multiplier, settings.max_rpc_timeout);
    }
}

/// Unbounded backoff used between reconnect attempts. Reset after a success.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    settings: BackoffSettings,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current: settings.initial,
        }
    }

    /// Backoff over the delay half of `settings`, for loops that retry per item.
    pub(crate) fn from_retry(settings: &RetrySettings) -> Self {
        Self::new(BackoffSettings {
            initial: settings.initial_retry_delay,
            multiplier: settings.retry_delay_multiplier,
            max: settings.max_retry_delay,
        })
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current);
        self.current = scale(self.current, self.settings.multiplier, self.settings.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.settings.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(total: Duration) -> RetrySettings {
        RetrySettings {
            total_timeout: total,
            ..RetrySettings::publish_defaults()
        }
    }

    #[test]
    fn jitter_stays_within_half_and_full_delay() {
        for _ in 0..100 {
            let value = jittered(Duration::from_millis(100));
            assert!(value >= Duration::from_millis(50));
            assert!(value <= Duration::from_millis(100));
        }
        assert_eq!(jittered(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn backoff_grows_caps_and_resets() {
        let mut backoff = Backoff::new(BackoffSettings {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(350),
        });
        assert!(backoff.next_delay() <= Duration::from_millis(100));
        assert!(backoff.next_delay() <= Duration::from_millis(200));
        assert!(backoff.next_delay() <= Duration::from_millis(350));
        assert!(backoff.next_delay() >= Duration::from_millis(175));
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let value = call_with_retry(&settings(Duration::from_secs(60)), "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Status::new(StatusCode::Unavailable, "blip"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .expect("eventually ok");
        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let err = call_with_retry(&settings(Duration::from_secs(60)), "test", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(Status::new(StatusCode::InvalidArgument, "bad")) }
        })
        .await
        .expect_err("permanent");
        assert!(matches!(err, RetryError::Permanent(status) if status.code == StatusCode::InvalidArgument));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn total_timeout_bounds_retries() {
        let started = Instant::now();
        let err = call_with_retry(&settings(Duration::from_secs(2)), "test", || async {
            Err::<(), _>(Status::new(StatusCode::Unavailable, "down"))
        })
        .await
        .expect_err("budget spent");
        assert!(matches!(err, RetryError::DeadlineExceeded { budget, .. } if budget == Duration::from_secs(2)));
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_and_retry() {
        let mut retry = settings(Duration::from_secs(30));
        retry.initial_rpc_timeout = Duration::from_millis(50);
        retry.rpc_timeout_multiplier = 1.0;
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let value = call_with_retry(&retry, "test", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok::<_, Status>("done")
            }
        })
        .await
        .expect("second attempt");
        assert_eq!(value, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
