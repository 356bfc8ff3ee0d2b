//! Retry interval policies and a bounded retry driver for external calls.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How the interval between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(BackoffKind::Fixed),
            "exponential" => Ok(BackoffKind::Exponential),
            invalid => Err(Error::Validation(format!(
                "{invalid} is not a valid backoff kind"
            ))),
        }
    }
}

/// The policy used to compute how long a failed job waits before its next
/// attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub kind: BackoffKind,
    /// Coefficient applied per past attempt when exponential.
    pub backoff_coefficient: u32,
    /// The interval before the first retry.
    pub initial_interval: Duration,
    /// Upper bound on any computed interval.
    pub maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            backoff_coefficient: 1,
            initial_interval: interval,
            maximum_interval: None,
        }
    }

    pub fn exponential(initial_interval: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            backoff_coefficient: 2,
            initial_interval,
            maximum_interval: None,
        }
    }

    pub fn with_maximum_interval(mut self, maximum: Duration) -> Self {
        self.maximum_interval = Some(maximum);
        self
    }

    /// Time until the next retry after `attempt` attempts have run.
    ///
    /// A preferred interval (e.g. an upstream Retry-After) raises the
    /// computed interval but never past the configured maximum.
    pub fn time_until_next_retry(
        &self,
        attempt: u32,
        preferred_retry_interval: Option<Duration>,
    ) -> Duration {
        let candidate_interval = match self.kind {
            BackoffKind::Fixed => self.initial_interval,
            BackoffKind::Exponential => {
                let factor = self
                    .backoff_coefficient
                    .checked_pow(attempt)
                    .unwrap_or(u32::MAX);
                self.initial_interval.saturating_mul(factor)
            }
        };

        match (preferred_retry_interval, self.maximum_interval) {
            (Some(preferred), Some(max_interval)) => std::cmp::min(
                std::cmp::max(std::cmp::min(candidate_interval, max_interval), preferred),
                max_interval,
            ),
            (Some(preferred), None) => std::cmp::max(candidate_interval, preferred),
            (None, Some(max_interval)) => std::cmp::min(candidate_interval, max_interval),
            (None, None) => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::exponential(Duration::from_secs(1))
    }
}

/// Options for [`with_retry`]: bounded exponential backoff around a
/// single external call.
#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    /// Retries after the first attempt. Clamped to [0, 5].
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
    pub multiplier: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_millis(1000),
            max: Duration::from_millis(30_000),
            multiplier: 2,
        }
    }
}

impl RetryOptions {
    pub const MAX_RETRIES_CEILING: u32 = 5;

    fn clamped(self) -> Self {
        Self {
            max_retries: self.max_retries.min(Self::MAX_RETRIES_CEILING),
            ..self
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        std::cmp::min(self.base.saturating_mul(factor), self.max)
    }
}

/// Drive `attempt_fn` until it succeeds, fails non-retryably per
/// `should_retry`, or exhausts the retry budget. The attempt number
/// (0-based) is passed to each invocation.
pub async fn with_retry<T, F, Fut, P>(
    options: RetryOptions,
    should_retry: P,
    mut attempt_fn: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: Fn(&Error) -> bool,
{
    let options = options.clamped();
    let mut attempt = 0u32;
    loop {
        match attempt_fn(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < options.max_retries && should_retry(&error) => {
                let delay = options.delay_for(attempt);
                tracing::debug!(attempt, ?delay, %error, "retrying after transient failure");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_millis(500));
        assert_eq!(
            policy.time_until_next_retry(0, None),
            Duration::from_millis(500)
        );
        assert_eq!(
            policy.time_until_next_retry(7, None),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(0, None), Duration::from_secs(1));
        assert_eq!(policy.time_until_next_retry(1, None), Duration::from_secs(2));
        assert_eq!(policy.time_until_next_retry(3, None), Duration::from_secs(8));
    }

    #[test]
    fn maximum_interval_caps_the_backoff() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1))
            .with_maximum_interval(Duration::from_secs(5));
        assert_eq!(policy.time_until_next_retry(10, None), Duration::from_secs(5));
    }

    #[test]
    fn preferred_interval_raises_but_respects_maximum() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1))
            .with_maximum_interval(Duration::from_secs(10));
        // Upstream asked for more than we computed.
        assert_eq!(
            policy.time_until_next_retry(0, Some(Duration::from_secs(4))),
            Duration::from_secs(4)
        );
        // But never past the maximum.
        assert_eq!(
            policy.time_until_next_retry(0, Some(Duration::from_secs(60))),
            Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn with_retry_recovers_from_transient_failures() {
        let attempts = AtomicU32::new(0);
        let options = RetryOptions {
            base: Duration::from_millis(1),
            ..Default::default()
        };
        let result = with_retry(options, Error::is_retryable, |_attempt| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Transient("flaky".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_stops_on_terminal_errors() {
        let attempts = AtomicU32::new(0);
        let options = RetryOptions {
            base: Duration::from_millis(1),
            ..Default::default()
        };
        let result: Result<(), Error> = with_retry(options, Error::is_retryable, |_attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Terminal("403".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::Terminal(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_clamps_the_budget() {
        let attempts = AtomicU32::new(0);
        let options = RetryOptions {
            max_retries: 50,
            base: Duration::from_millis(1),
            ..Default::default()
        };
        let result: Result<(), Error> = with_retry(options, Error::is_retryable, |_attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Transient("still down".into())) }
        })
        .await;
        assert!(result.is_err());
        // Initial attempt plus the clamped 5 retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }
}
