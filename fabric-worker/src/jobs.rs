//! Job registration records, handler contracts, and payload validation.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use fabric_common::broker::Priority;
use fabric_common::error::Error;
use fabric_common::retry::{BackoffKind, RetryPolicy};

/// Serialized payloads are capped at 1 MiB.
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

pub const MAX_RETRIES_LIMIT: u32 = 10;
pub const MIN_BACKOFF_DELAY: Duration = Duration::from_millis(100);
pub const MAX_BACKOFF_DELAY: Duration = Duration::from_millis(3_600_000);
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1000);
pub const MAX_TIMEOUT: Duration = Duration::from_millis(3_600_000);
pub const MAX_RATE_LIMIT: u32 = 10_000;

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,100}$").expect("static regex"));

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub kind: BackoffKind,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Admissions allowed per window.
    pub max: u32,
    /// The window length.
    pub duration: Duration,
}

/// The registration record binding a named job to its queue and policies.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub name: String,
    pub queue: String,
    pub priority: Priority,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    pub timeout: Duration,
    pub rate_limit: Option<RateLimitConfig>,
}

impl JobConfig {
    pub fn new(name: &str, queue: &str) -> Self {
        Self {
            name: name.to_owned(),
            queue: queue.to_owned(),
            priority: Priority::Normal,
            max_retries: 3,
            backoff: BackoffConfig {
                kind: BackoffKind::Exponential,
                delay: Duration::from_millis(1000),
            },
            timeout: Duration::from_millis(30_000),
            rate_limit: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, kind: BackoffKind, delay: Duration) -> Self {
        self.backoff = BackoffConfig { kind, delay };
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn rate_limit(mut self, max: u32, duration: Duration) -> Self {
        self.rate_limit = Some(RateLimitConfig { max, duration });
        self
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !NAME_RE.is_match(&self.name) {
            return Err(Error::Validation(format!(
                "job name {:?} must match [a-zA-Z0-9_-]{{1,100}}",
                self.name
            )));
        }
        if !NAME_RE.is_match(&self.queue) {
            return Err(Error::Validation(format!(
                "queue name {:?} must match [a-zA-Z0-9_-]{{1,100}}",
                self.queue
            )));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(Error::Validation(format!(
                "max_retries {} exceeds {MAX_RETRIES_LIMIT}",
                self.max_retries
            )));
        }
        if self.backoff.delay < MIN_BACKOFF_DELAY || self.backoff.delay > MAX_BACKOFF_DELAY {
            return Err(Error::Validation(format!(
                "backoff delay {:?} outside [{MIN_BACKOFF_DELAY:?}, {MAX_BACKOFF_DELAY:?}]",
                self.backoff.delay
            )));
        }
        if self.timeout < MIN_TIMEOUT || self.timeout > MAX_TIMEOUT {
            return Err(Error::Validation(format!(
                "timeout {:?} outside [{MIN_TIMEOUT:?}, {MAX_TIMEOUT:?}]",
                self.timeout
            )));
        }
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.max < 1 || rate_limit.max > MAX_RATE_LIMIT {
                return Err(Error::Validation(format!(
                    "rate limit max {} outside [1, {MAX_RATE_LIMIT}]",
                    rate_limit.max
                )));
            }
            if rate_limit.duration < MIN_BACKOFF_DELAY || rate_limit.duration > MAX_BACKOFF_DELAY {
                return Err(Error::Validation(format!(
                    "rate limit duration {:?} outside [{MIN_BACKOFF_DELAY:?}, {MAX_BACKOFF_DELAY:?}]",
                    rate_limit.duration
                )));
            }
        }
        Ok(())
    }

    /// The retry policy the broker applies when this job fails with a
    /// retryable error.
    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = match self.backoff.kind {
            BackoffKind::Fixed => RetryPolicy::fixed(self.backoff.delay),
            BackoffKind::Exponential => RetryPolicy::exponential(self.backoff.delay),
        };
        policy.with_maximum_interval(MAX_BACKOFF_DELAY)
    }
}

/// The per-job request context bound for the duration of a handler run.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub request_id: String,
    pub trace_id: Option<String>,
    pub org_id: Option<String>,
    /// 1-based attempt number.
    pub attempt: i32,
    /// Handlers that respect this abort at their next suspension point.
    pub cancellation: CancellationToken,
}

/// A handler failure: the taxonomy error, plus the `no_retry` flag a
/// handler attaches when its side effects are not idempotent.
#[derive(Debug)]
pub struct HandlerError {
    pub error: Error,
    pub no_retry: bool,
}

impl HandlerError {
    pub fn no_retry(error: Error) -> Self {
        Self {
            error,
            no_retry: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !self.no_retry && self.error.is_retryable()
    }
}

impl From<Error> for HandlerError {
    fn from(error: Error) -> Self {
        Self {
            error,
            no_retry: false,
        }
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError>;

    /// Probed at schedule time. Stub handlers whose upstream is not wired
    /// return [`Error::NotImplemented`] here so their jobs are refused at
    /// admission instead of failing in a worker.
    fn ready(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// A typed validator for job payloads; violations fail the job
/// terminally, before the handler runs.
pub trait PayloadSchema: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

/// Schema requiring a set of top-level fields to be present and non-null.
pub struct RequiredFields {
    fields: Vec<&'static str>,
}

impl RequiredFields {
    pub fn new(fields: &[&'static str]) -> Self {
        Self {
            fields: fields.to_vec(),
        }
    }
}

impl PayloadSchema for RequiredFields {
    fn validate(&self, payload: &Value) -> Result<(), String> {
        let Some(object) = payload.as_object() else {
            return Err("payload must be a JSON object".to_owned());
        };
        for field in &self.fields {
            match object.get(*field) {
                None | Some(Value::Null) => {
                    return Err(format!("payload is missing required field {field:?}"))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config_is_valid() {
        assert!(JobConfig::new("domain-export", "exports").validate().is_ok());
    }

    #[test]
    fn names_are_validated() {
        assert!(JobConfig::new("", "exports").validate().is_err());
        assert!(JobConfig::new("bad name", "exports").validate().is_err());
        assert!(JobConfig::new("ok_name-1", "bad queue!").validate().is_err());
        let long = "x".repeat(101);
        assert!(JobConfig::new(&long, "exports").validate().is_err());
        let max = "x".repeat(100);
        assert!(JobConfig::new(&max, "exports").validate().is_ok());
    }

    #[test]
    fn retry_and_timing_bounds() {
        assert!(JobConfig::new("j", "q").max_retries(10).validate().is_ok());
        assert!(JobConfig::new("j", "q").max_retries(11).validate().is_err());

        assert!(JobConfig::new("j", "q")
            .backoff(BackoffKind::Fixed, Duration::from_millis(99))
            .validate()
            .is_err());
        assert!(JobConfig::new("j", "q")
            .backoff(BackoffKind::Fixed, Duration::from_millis(100))
            .validate()
            .is_ok());
        assert!(JobConfig::new("j", "q")
            .backoff(BackoffKind::Fixed, Duration::from_millis(3_600_001))
            .validate()
            .is_err());

        assert!(JobConfig::new("j", "q")
            .timeout(Duration::from_millis(999))
            .validate()
            .is_err());
        assert!(JobConfig::new("j", "q")
            .timeout(Duration::from_millis(3_600_000))
            .validate()
            .is_ok());
    }

    #[test]
    fn rate_limit_bounds() {
        assert!(JobConfig::new("j", "q")
            .rate_limit(0, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(JobConfig::new("j", "q")
            .rate_limit(10_000, Duration::from_secs(1))
            .validate()
            .is_ok());
        assert!(JobConfig::new("j", "q")
            .rate_limit(10_001, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(JobConfig::new("j", "q")
            .rate_limit(5, Duration::from_millis(99))
            .validate()
            .is_err());
    }

    #[test]
    fn required_fields_schema() {
        let schema = RequiredFields::new(&["domainId", "format"]);
        assert!(schema
            .validate(&json!({"domainId": "d-1", "format": "json"}))
            .is_ok());
        assert!(schema.validate(&json!({"domainId": "d-1"})).is_err());
        assert!(schema
            .validate(&json!({"domainId": null, "format": "json"}))
            .is_err());
        assert!(schema.validate(&json!([1, 2, 3])).is_err());
    }

    #[test]
    fn handler_error_retryability() {
        let retryable = HandlerError::from(Error::Transient("reset".into()));
        assert!(retryable.is_retryable());

        let pinned = HandlerError::no_retry(Error::Transient("non-idempotent".into()));
        assert!(!pinned.is_retryable());

        let terminal = HandlerError::from(Error::Validation("bad".into()));
        assert!(!terminal.is_retryable());
    }
}
