//! Bounded retry with backoff, shared by sink probing, the connectivity
//! monitor and batch flushing.

// External crates
use std::{fmt::Display, future::Future, time::Duration};

/// Delay before the retry following a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `initial + step * n` before the n-th retry (0-based).
    Linear { initial: Duration, step: Duration },
    Constant(Duration),
}

impl Backoff {
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Linear { initial, step } => initial.saturating_add(step.saturating_mul(retry)),
            Self::Constant(delay) => delay,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` means a single attempt.
    pub retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Backoff) -> Self {
        Self { retries, backoff }
    }

    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Sum of every delay slept when all attempts fail.
    pub fn total_delay(&self) -> Duration {
        (0..self.retries).fold(Duration::ZERO, |total, n| {
            total.saturating_add(self.backoff.delay(n))
        })
    }
}

/// Run `op` until it succeeds or the policy is exhausted, returning the last error.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut retry = 0;
    loop {
        match op().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::info!(operation, attempt = retry + 1, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) if retry < policy.retries => {
                let wait = policy.backoff.delay(retry);
                tracing::warn!(
                    operation,
                    error = %e,
                    attempt = retry + 1,
                    attempts = policy.attempts(),
                    wait_ms = wait.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(wait).await;
                retry += 1;
            }
            Err(e) => {
                tracing::error!(
                    operation,
                    error = %e,
                    attempts = policy.attempts(),
                    "Giving up after exhausting retries"
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_backoff_delays() {
        let linear = Backoff::Linear {
            initial: Duration::from_secs(5),
            step: Duration::from_secs(1),
        };
        assert_eq!(linear.delay(0), Duration::from_secs(5));
        assert_eq!(linear.delay(3), Duration::from_secs(8));
        assert_eq!(
            Backoff::Constant(Duration::from_millis(250)).delay(7),
            Duration::from_millis(250)
        );

        let policy = RetryPolicy::new(3, linear);
        assert_eq!(policy.attempts(), 4);
        assert_eq!(policy.total_delay(), Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_waits_every_delay() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(
            2,
            Backoff::Linear {
                initial: Duration::from_secs(1),
                step: Duration::from_secs(2),
            },
        );
        let start = Instant::now();

        let result: Result<(), String> = retry(policy, "probe", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;

        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= policy.total_delay());
        assert!(elapsed < policy.total_delay() + Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Backoff::Constant(Duration::from_secs(1)));

        let result: Result<u32, String> = retry(policy, "probe", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(format!("attempt {n}"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_zero_retries_is_single_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Backoff::Constant(Duration::from_secs(60)));

        let result: Result<(), &str> = retry(policy, "flush", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope") }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
