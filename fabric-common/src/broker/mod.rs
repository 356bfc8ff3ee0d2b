//! The durable-broker contract.
//!
//! The fabric does not implement a durable queue itself; it drives one
//! (Redis, Postgres, ...) through this trait. [`memory::MemoryBroker`]
//! is the in-process reference implementation used by tests, local
//! development and the default worker wiring; its observable semantics
//! are the contract any durable adapter must match.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::retry::BackoffKind;

pub mod memory;

pub use memory::MemoryBroker;

/// Queue priority. Lower rank wins; ties are FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 1,
            Priority::High => 25,
            Priority::Normal => 50,
            Priority::Low => 75,
            Priority::Background => 100,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            invalid => Err(format!("{invalid} is not a valid priority")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Priority::Critical => write!(f, "critical"),
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
            Priority::Background => write!(f, "background"),
        }
    }
}

/// Backoff settings attached to a job at enqueue time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base: Duration,
}

/// A job to be enqueued. Ownership is taken by `enqueue` so a given
/// NewJob can only be submitted once.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub queue: String,
    pub payload: Value,
    pub priority: Priority,
    /// Total attempts allowed (first run included).
    pub max_attempts: i32,
    pub backoff: Backoff,
    pub timeout: Duration,
    pub delay: Option<Duration>,
    /// Caller-chosen id; enqueueing an id already present is a no-op
    /// (at-most-once admission for producer retries).
    pub job_id: Option<String>,
    pub org_id: Option<String>,
}

/// A job leased to a worker. The lease is held until the worker reports
/// complete/retry/fail, or until the broker declares the job stalled.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub payload: Value,
    /// 1-based attempt number of this lease.
    pub attempt: i32,
    pub max_attempts: i32,
    pub backoff: Backoff,
    pub timeout: Duration,
    pub org_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Queue depth by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("job {0} has reached max attempts and cannot be retried further")]
    MaxAttemptsReached(String),
    #[error("unknown job {0}")]
    UnknownJob(String),
    #[error("{command} failed against the broker: {message}")]
    OperationError { command: String, message: String },
}

/// How long a leased job may go without completion before the broker
/// treats its worker as dead and re-queues it.
pub const STALLED_INTERVAL: Duration = Duration::from_secs(300);

/// Stall events tolerated before the job is failed permanently.
pub const MAX_STALLED_COUNT: i32 = 3;

/// Compose a rate-limit counter key. The bucket is wrapped in a literal
/// `{hash-tag}` so clustered key-value stores route every key of a bucket
/// to the same shard, keeping the INCR+EXPIRE script atomic.
pub fn rate_limit_key(bucket: Option<&str>, job_name: &str) -> String {
    let bucket = bucket.unwrap_or("global");
    format!("ratelimit:{{{bucket}}}:{job_name}")
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Admit a job. Returns the job id (caller-supplied or generated).
    async fn enqueue(&self, job: NewJob) -> Result<String, BrokerError>;

    /// Lease the next runnable job on `queue`, if any. Also the point at
    /// which due delayed jobs wake and stalled leases are recovered.
    async fn claim(&self, queue: &str) -> Result<Option<LeasedJob>, BrokerError>;

    async fn complete(&self, queue: &str, job_id: &str) -> Result<(), BrokerError>;

    /// Return a leased job to the queue for a later attempt. Fails with
    /// [`BrokerError::MaxAttemptsReached`] when the budget is exhausted;
    /// the job stays leased so the caller can `fail` it.
    async fn retry(
        &self,
        queue: &str,
        job_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    async fn fail(&self, queue: &str, job_id: &str, error: &str) -> Result<(), BrokerError>;

    /// Drop a waiting/delayed/leased job. Returns whether anything was removed.
    async fn remove(&self, queue: &str, job_id: &str) -> Result<bool, BrokerError>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError>;

    async fn pause(&self, queue: &str) -> Result<(), BrokerError>;

    async fn resume(&self, queue: &str) -> Result<(), BrokerError>;

    /// Drop finished job records older than `grace`. Returns how many
    /// were removed.
    async fn clean(&self, queue: &str, grace: Duration) -> Result<u64, BrokerError>;

    /// Atomically increment the windowed counter at `key`, arming the
    /// window's expiry on first increment. Returns the post-increment
    /// count within the current window.
    async fn rate_limit_incr(&self, key: &str, window: Duration) -> Result<u64, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ranks_are_strictly_ordered() {
        assert_eq!(Priority::Critical.rank(), 1);
        assert_eq!(Priority::High.rank(), 25);
        assert_eq!(Priority::Normal.rank(), 50);
        assert_eq!(Priority::Low.rank(), 75);
        assert_eq!(Priority::Background.rank(), 100);
    }

    #[test]
    fn priority_round_trips_through_strings() {
        for name in ["critical", "high", "normal", "low", "background"] {
            let parsed: Priority = name.parse().unwrap();
            assert_eq!(parsed.to_string(), name);
        }
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn rate_limit_keys_are_hash_tagged() {
        assert_eq!(
            rate_limit_key(Some("org-1"), "domain-export"),
            "ratelimit:{org-1}:domain-export"
        );
        assert_eq!(
            rate_limit_key(None, "domain-export"),
            "ratelimit:{global}:domain-export"
        );
    }
}
