//! Bounded retry with per-attempt backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How often, and how patiently, a downstream call is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Applied once per retry; `1.0` keeps the delay fixed.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Used right after launch, while the service may still be booting.
    pub fn startup_check() -> Self {
        Self {
            max_retries: 20,
            base_delay: Duration::from_millis(250),
            multiplier: 1.0,
        }
    }

    /// Liveness checks: one try, no retries.
    pub fn single_attempt() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(0.0).powi(retry.min(i32::MAX as u32) as i32);
        let nanos = (self.base_delay.as_nanos() as f64 * factor).round();
        if nanos >= u64::MAX as f64 {
            Duration::from_nanos(u64::MAX)
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }

    /// Sum of every delay the policy can incur before giving up.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|i| self.delay_for(i))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}

/// Run `op` until it succeeds or the policy is exhausted. Attempts are
/// strictly sequential; the last error is returned.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut retries = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retries < policy.max_retries => {
                let delay = policy.delay_for(retries);
                retries += 1;
                tracing::debug!(
                    op = label,
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if policy.max_retries > 0 {
                    tracing::warn!(op = label, attempts = retries + 1, error = %e, "retries exhausted");
                }
                return Err(e);
            }
        }
    }
}
