//! Named circuit breakers.
//!
//! A breaker trips open after `failure_threshold` consecutive failures,
//! stays open for `reset_timeout`, then admits traffic half-open. Closing
//! again requires `half_open_max_attempts` consecutive successes; a single
//! failure while half-open re-opens the breaker and resets the streak.
//! Cancelled executions are not counted either way.
//!
//! Breakers are process-lifetime singletons looked up by name. They are
//! never cached with a TTL: evicting a live breaker (or anything holding
//! connections) on a timer is how the predecessor system orphaned its
//! Redis clients.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tracing::warn;

use crate::error::Error;

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker trips.
    pub failure_threshold: u32,
    /// How long a tripped breaker rejects before going half-open.
    pub reset_timeout: Duration,
    /// Consecutive successes required to close from half-open.
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct Counters {
    failures: u32,
    success_streak: u32,
    tripped: bool,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    counters: Mutex<Counters>,
}

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<CircuitBreaker>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Fetch or create the process-wide breaker registered under `name`.
    /// The config only applies on first creation; later callers share the
    /// existing instance.
    pub fn named(name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut registry = REGISTRY.lock().expect("breaker registry poisoned");
        registry
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Derived state: closed when the failure counter is clean, open while
    /// tripped and inside the reset window, half-open otherwise.
    pub fn state(&self) -> BreakerState {
        let counters = self.counters.lock().expect("breaker mutex poisoned");
        self.state_of(&counters)
    }

    fn state_of(&self, counters: &Counters) -> BreakerState {
        if counters.failures == 0 {
            return BreakerState::Closed;
        }
        if counters.tripped {
            let since_failure = counters
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX);
            if since_failure < self.config.reset_timeout {
                return BreakerState::Open;
            }
        }
        BreakerState::HalfOpen
    }

    /// Run `operation` under the breaker. Rejects immediately with
    /// [`Error::CircuitOpen`] while open. Cancellations pass through
    /// uncounted.
    pub async fn execute<T, F>(&self, operation: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        {
            let counters = self.counters.lock().expect("breaker mutex poisoned");
            if self.state_of(&counters) == BreakerState::Open {
                let elapsed = counters
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                let retry_after = self.config.reset_timeout.saturating_sub(elapsed);
                return Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    retry_after,
                });
            }
        }

        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    fn record_success(&self) {
        let mut counters = self.counters.lock().expect("breaker mutex poisoned");
        if counters.failures == 0 {
            return;
        }
        counters.success_streak += 1;
        if counters.success_streak >= self.config.half_open_max_attempts {
            *counters = Counters::default();
        }
    }

    fn record_failure(&self) {
        let mut counters = self.counters.lock().expect("breaker mutex poisoned");
        counters.failures += 1;
        counters.success_streak = 0;
        counters.last_failure = Some(Instant::now());
        if counters.failures >= self.config.failure_threshold && !counters.tripped {
            counters.tripped = true;
            warn!(breaker = %self.name, failures = counters.failures, "circuit breaker opened");
        } else if counters.tripped {
            // A half-open probe failed: back to fully open.
            warn!(breaker = %self.name, "circuit breaker re-opened from half-open");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(reset_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(reset_ms),
            half_open_max_attempts: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        breaker
            .execute(async { Err::<(), _>(Error::Transient("boom".into())) })
            .await
            .ok();
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), Error> {
        breaker.execute(async { Ok(()) }).await
    }

    #[tokio::test]
    async fn trips_open_after_threshold() {
        let breaker = CircuitBreaker::new("test-open", config(60_000));
        assert_eq!(breaker.state(), BreakerState::Closed);

        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let rejected = succeed(&breaker).await;
        assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn half_open_requires_consecutive_successes() {
        let breaker = CircuitBreaker::new("test-half-open", config(10));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // One success is not enough to close.
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_resets_streak() {
        let breaker = CircuitBreaker::new("test-reopen", config(10));
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        succeed(&breaker).await.unwrap();
        fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        // The earlier success no longer counts toward closing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn cancellation_is_not_a_failure() {
        let breaker = CircuitBreaker::new("test-cancel", config(60_000));
        for _ in 0..10 {
            let result = breaker
                .execute(async { Err::<(), _>(Error::Cancelled) })
                .await;
            assert!(matches!(result, Err(Error::Cancelled)));
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn registry_returns_the_same_instance() {
        let a = CircuitBreaker::named("registry-test", BreakerConfig::default());
        let b = CircuitBreaker::named("registry-test", config(1));
        assert!(Arc::ptr_eq(&a, &b));
    }
}
