//! Exponential backoff with jitter for collaborator calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::BackoffConfig;
use crate::error::{ControllerError, Result};

/// Retry policy derived from [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    max_attempts: u32,
    call_timeout: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl Backoff {
    /// Builds the policy from configuration.
    #[must_use]
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            initial_delay: Duration::from_secs(config.initial_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            multiplier: config.multiplier,
            jitter: config.jitter,
            max_attempts: config.max_attempts.max(1),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }

    /// Overrides the delays. Mostly useful in tests.
    #[must_use]
    pub const fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Overrides the attempt limit.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Overrides the per-call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Attempts allowed, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(delay_millis).min(self.max_delay)
    }

    /// [`Self::delay_for_attempt`] spread by up to `jitter` in either direction.
    #[must_use]
    pub fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + spread).max(0.0))
    }

    /// Runs `call` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. Each attempt is bounded by the call timeout and
    /// the whole loop stops as soon as `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns the last error, [`ControllerError::Timeout`] when the final
    /// attempt timed out, or [`ControllerError::Cancelled`].
    pub async fn retry<F, Fut, T>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(ControllerError::Cancelled { operation: operation.to_string() });
                }
                res = timeout(self.call_timeout, call()) => res,
            };

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => ControllerError::Timeout {
                    operation: operation.to_string(),
                    after_secs: self.call_timeout.as_secs(),
                },
            };

            if !err.is_retryable() || attempt >= self.max_attempts {
                return Err(err);
            }

            let delay = self.jittered(attempt);
            warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(ControllerError::Cancelled { operation: operation.to_string() });
                }
                () = sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff::default()
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
            .with_call_timeout(Duration::from_millis(200))
    }

    fn transient() -> ControllerError {
        ProviderError::Transient {
            reason: "throttled".into(),
        }
        .into()
    }

    #[test]
    fn delay_grows_and_caps() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(60)); // capped
    }

    #[test]
    fn jitter_stays_in_range() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            let d = backoff.jittered(2);
            assert!(d >= Duration::from_millis(1600), "{d:?}");
            assert!(d <= Duration::from_millis(2400), "{d:?}");
        }
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result = fast()
            .retry("create", &CancellationToken::new(), || {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<()> = fast()
            .with_max_attempts(3)
            .retry("delete", &CancellationToken::new(), || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(transient()) }
            })
            .await;
        assert_eq!(result, Err(transient()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<()> = fast()
            .retry("create", &CancellationToken::new(), || {
                c.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::Rejected {
                        reason: "quota".into(),
                    }
                    .into())
                }
            })
            .await;
        assert!(matches!(result, Err(ControllerError::Provider(ProviderError::Rejected { .. }))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<()> = fast()
            .with_max_attempts(1)
            .retry("get", &CancellationToken::new(), || async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ControllerError::Timeout { .. })));
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = fast()
            .retry("list", &cancel, || async { Err(transient()) })
            .await;
        assert!(matches!(result, Err(ControllerError::Cancelled { .. })));
    }
}
