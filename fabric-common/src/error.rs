//! The error taxonomy shared by every layer of the fabric.
//!
//! Adapters and stores translate their raw failures into one of these
//! kinds before they reach a worker; workers decide retry-vs-terminal
//! from the kind alone (plus the per-handler `no_retry` flag carried by
//! the scheduler's handler error).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed payload, bad config, out-of-range parameter. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist.
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// Admission was refused: org capacity, queue backpressure, or a
    /// broker rate limit. Retryable after the supplied hint.
    #[error("rate limited ({reason}), retry after {retry_after:?}")]
    RateLimited {
        reason: String,
        retry_after: Duration,
    },

    /// The named circuit breaker is open; the hint is its remaining
    /// reset timeout.
    #[error("circuit breaker {name} is open, retry after {retry_after:?}")]
    CircuitOpen {
        name: String,
        retry_after: Duration,
    },

    /// A failure on the external-call retry allowlist: connection
    /// refused/reset, timeouts, rate limiting, 429/502/503. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A definitive upstream rejection (4xx other than 429). Never retried.
    #[error("terminal upstream failure: {0}")]
    Terminal(String),

    /// Unique-constraint conflict. For idempotent operations this means
    /// "already done"; otherwise it surfaces as a conflict.
    #[error("integrity conflict: {0}")]
    Integrity(String),

    /// A stub handler whose upstream is not wired yet. The scheduler
    /// refuses to enqueue jobs whose handler probes to this.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Database/broker connectivity and other operational failures.
    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    /// The execution was aborted by cancellation or shutdown. Not a
    /// failure for circuit-breaker accounting.
    #[error("cancelled")]
    Cancelled,

    /// A rollback (or other secondary cleanup) failed while handling
    /// `original`. Both errors are preserved; the original stays primary.
    #[error("{original} (rollback also failed: {rollback})")]
    RollbackFailed {
        original: Box<Error>,
        rollback: String,
    },
}

impl Error {
    pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            resource,
            id: id.into(),
        }
    }

    pub fn rate_limited(reason: impl Into<String>, retry_after: Duration) -> Self {
        Error::RateLimited {
            reason: reason.into(),
            retry_after,
        }
    }

    /// Whether a worker may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimited { .. }
            | Error::CircuitOpen { .. }
            | Error::Transient(_)
            | Error::Infrastructure(_) => true,
            Error::RollbackFailed { original, .. } => original.is_retryable(),
            Error::Validation(_)
            | Error::NotFound { .. }
            | Error::Terminal(_)
            | Error::Integrity(_)
            | Error::NotImplemented(_)
            | Error::Cancelled => false,
        }
    }

    /// Server-supplied retry hint, where one exists.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. } | Error::CircuitOpen { retry_after, .. } => {
                Some(*retry_after)
            }
            _ => None,
        }
    }

    /// The status an HTTP edge should map this error to. Everything not
    /// explicitly client-attributable is an opaque 500.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound { .. } => 404,
            Error::RateLimited { .. } => 429,
            Error::Integrity(_) => 409,
            _ => 500,
        }
    }

    /// Classify an upstream HTTP status against the external-call retry
    /// allowlist. Only 429, 502 and 503 are retryable; every other
    /// status — other 5xx included — is terminal, because the call sits
    /// in front of a non-idempotent publish.
    pub fn from_upstream_status(status: u16, context: &str) -> Self {
        match status {
            429 | 502 | 503 => Error::Transient(format!("{context}: status {status}")),
            s => Error::Terminal(format!("{context}: status {s}")),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_error) = &error {
            // Postgres unique_violation.
            if db_error.code().as_deref() == Some("23505") {
                return Error::Integrity(db_error.to_string());
            }
        }
        Error::Infrastructure(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Validation(format!("invalid JSON payload: {error}"))
    }
}

/// Messages from foreign error types that still indicate a retryable
/// condition. Mirrors the external-call retry allowlist.
pub fn is_retryable_message(message: &str) -> bool {
    const RETRYABLE_FRAGMENTS: &[&str] = &[
        "ECONNREFUSED",
        "ETIMEDOUT",
        "ECONNRESET",
        "timeout",
        "rate limit",
    ];
    let lowered = message.to_lowercase();
    RETRYABLE_FRAGMENTS
        .iter()
        .any(|fragment| lowered.contains(&fragment.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_the_taxonomy() {
        assert!(Error::Transient("connection reset".into()).is_retryable());
        assert!(Error::Infrastructure("pool exhausted".into()).is_retryable());
        assert!(Error::rate_limited("capacity", Duration::from_secs(60)).is_retryable());
        assert!(!Error::Validation("bad payload".into()).is_retryable());
        assert!(!Error::Terminal("403".into()).is_retryable());
        assert!(!Error::NotImplemented("feedback".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn rollback_failure_keeps_the_original_classification() {
        let wrapped = Error::RollbackFailed {
            original: Box::new(Error::Transient("reset".into())),
            rollback: "connection lost".into(),
        };
        assert!(wrapped.is_retryable());
        assert!(wrapped.to_string().contains("reset"));
        assert!(wrapped.to_string().contains("connection lost"));
    }

    #[test]
    fn http_mapping() {
        assert_eq!(Error::Validation("x".into()).http_status(), 400);
        assert_eq!(Error::not_found("intent", "abc").http_status(), 404);
        assert_eq!(
            Error::rate_limited("capacity", Duration::from_secs(60)).http_status(),
            429
        );
        assert_eq!(Error::Transient("x".into()).http_status(), 500);
    }

    #[test]
    fn upstream_status_classification() {
        assert!(Error::from_upstream_status(429, "publish").is_retryable());
        assert!(Error::from_upstream_status(502, "publish").is_retryable());
        assert!(Error::from_upstream_status(503, "publish").is_retryable());
        // Statuses off the allowlist are terminal, other 5xx included.
        assert!(!Error::from_upstream_status(500, "publish").is_retryable());
        assert!(!Error::from_upstream_status(504, "publish").is_retryable());
        assert!(!Error::from_upstream_status(403, "publish").is_retryable());
        assert!(!Error::from_upstream_status(404, "publish").is_retryable());
    }

    #[test]
    fn retryable_message_fragments() {
        assert!(is_retryable_message("connect ECONNREFUSED 10.0.0.1:443"));
        assert!(is_retryable_message("upstream rate limit exceeded"));
        assert!(is_retryable_message("request Timeout after 30s"));
        assert!(!is_retryable_message("invalid credentials"));
    }
}
