//! In-process broker implementation.
//!
//! Single `std::sync::Mutex` over all queue state; nothing is held across
//! an await point. Priority is a strict ascending sort on (rank, admission
//! sequence), so equal priorities drain FIFO. Delayed jobs and stalled
//! leases are settled lazily at every claim/count, which keeps the
//! implementation timer-free.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use super::{
    Backoff, Broker, BrokerError, LeasedJob, NewJob, Priority, QueueCounts, MAX_STALLED_COUNT,
    STALLED_INTERVAL,
};
use crate::ids;

#[derive(Debug, Clone)]
struct JobRecord {
    id: String,
    name: String,
    payload: Value,
    priority: Priority,
    max_attempts: i32,
    attempt: i32,
    backoff: Backoff,
    timeout: Duration,
    org_id: Option<String>,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    stalls: i32,
    last_error: Option<String>,
}

struct ActiveJob {
    record: JobRecord,
    claimed_at: Instant,
}

struct FinishedJob {
    #[allow(dead_code)]
    id: String,
    success: bool,
    finished_at: Instant,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    paused: bool,
    waiting: BTreeMap<(u8, u64), JobRecord>,
    delayed: BTreeMap<(Instant, u64), JobRecord>,
    active: HashMap<String, ActiveJob>,
    finished: Vec<FinishedJob>,
}

struct RateWindow {
    count: u64,
    expires_at: Instant,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    rate_windows: HashMap<String, RateWindow>,
}

pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    stalled_interval: Duration,
    max_stalled: i32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(STALLED_INTERVAL, MAX_STALLED_COUNT)
    }
}

impl MemoryBroker {
    pub fn new(stalled_interval: Duration, max_stalled: i32) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            stalled_interval,
            max_stalled,
        }
    }

    /// Wake due delayed jobs and recover stalled leases. Called at every
    /// claim and count so state is settled before it is observed.
    fn settle(&self, queue: &mut QueueState) {
        let now = Instant::now();

        let due: Vec<(Instant, u64)> = queue
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            if let Some(record) = queue.delayed.remove(&key) {
                queue.waiting.insert((record.priority.rank(), record.seq), record);
            }
        }

        let stalled: Vec<String> = queue
            .active
            .iter()
            .filter(|(_, active)| now.duration_since(active.claimed_at) >= self.stalled_interval)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            if let Some(active) = queue.active.remove(&id) {
                let mut record = active.record;
                record.stalls += 1;
                if record.stalls >= self.max_stalled {
                    warn!(job = %record.id, stalls = record.stalls, "job exceeded stall budget, failing permanently");
                    queue.finished.push(FinishedJob {
                        id: record.id,
                        success: false,
                        finished_at: now,
                    });
                } else {
                    warn!(job = %record.id, stalls = record.stalls, "re-queueing stalled job");
                    queue
                        .waiting
                        .insert((record.priority.rank(), record.seq), record);
                }
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job: NewJob) -> Result<String, BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let queue = state.queues.entry(job.queue.clone()).or_default();

        let id = job
            .job_id
            .unwrap_or_else(|| ids::uuid_v4().to_string());

        // Producer-side dedupe on caller-supplied ids.
        let already_known = queue.active.contains_key(&id)
            || queue.waiting.values().any(|record| record.id == id)
            || queue.delayed.values().any(|record| record.id == id);
        if already_known {
            return Ok(id);
        }

        let seq = queue.next_seq;
        queue.next_seq += 1;

        let record = JobRecord {
            id: id.clone(),
            name: job.name,
            payload: job.payload,
            priority: job.priority,
            max_attempts: job.max_attempts,
            attempt: 0,
            backoff: job.backoff,
            timeout: job.timeout,
            org_id: job.org_id,
            enqueued_at: ids::now(),
            seq,
            stalls: 0,
            last_error: None,
        };

        match job.delay {
            Some(delay) if !delay.is_zero() => {
                queue.delayed.insert((Instant::now() + delay, seq), record);
            }
            _ => {
                queue.waiting.insert((record.priority.rank(), seq), record);
            }
        }

        Ok(id)
    }

    async fn claim(&self, queue_name: &str) -> Result<Option<LeasedJob>, BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Ok(None);
        };
        self.settle(queue);

        if queue.paused {
            return Ok(None);
        }

        let Some(key) = queue.waiting.keys().next().copied() else {
            return Ok(None);
        };
        let mut record = queue.waiting.remove(&key).expect("key read under lock");
        record.attempt += 1;

        let leased = LeasedJob {
            id: record.id.clone(),
            name: record.name.clone(),
            queue: queue_name.to_owned(),
            payload: record.payload.clone(),
            attempt: record.attempt,
            max_attempts: record.max_attempts,
            backoff: record.backoff,
            timeout: record.timeout,
            org_id: record.org_id.clone(),
            enqueued_at: record.enqueued_at,
        };
        queue.active.insert(
            record.id.clone(),
            ActiveJob {
                record,
                claimed_at: Instant::now(),
            },
        );
        Ok(Some(leased))
    }

    async fn complete(&self, queue_name: &str, job_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::UnknownJob(job_id.to_owned()))?;
        let active = queue
            .active
            .remove(job_id)
            .ok_or_else(|| BrokerError::UnknownJob(job_id.to_owned()))?;
        queue.finished.push(FinishedJob {
            id: active.record.id,
            success: true,
            finished_at: Instant::now(),
        });
        Ok(())
    }

    async fn retry(
        &self,
        queue_name: &str,
        job_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::UnknownJob(job_id.to_owned()))?;

        let attempts_exhausted = match queue.active.get(job_id) {
            Some(active) => active.record.attempt >= active.record.max_attempts,
            None => return Err(BrokerError::UnknownJob(job_id.to_owned())),
        };
        if attempts_exhausted {
            // The job stays leased so the caller can fail it.
            return Err(BrokerError::MaxAttemptsReached(job_id.to_owned()));
        }

        let active = queue.active.remove(job_id).expect("checked above");
        let mut record = active.record;
        record.last_error = Some(error.to_owned());
        let seq = record.seq;
        queue.delayed.insert((Instant::now() + delay, seq), record);
        Ok(())
    }

    async fn fail(&self, queue_name: &str, job_id: &str, error: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let queue = state
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| BrokerError::UnknownJob(job_id.to_owned()))?;
        let mut active = queue
            .active
            .remove(job_id)
            .ok_or_else(|| BrokerError::UnknownJob(job_id.to_owned()))?;
        active.record.last_error = Some(error.to_owned());
        queue.finished.push(FinishedJob {
            id: active.record.id,
            success: false,
            finished_at: Instant::now(),
        });
        Ok(())
    }

    async fn remove(&self, queue_name: &str, job_id: &str) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Ok(false);
        };

        if queue.active.remove(job_id).is_some() {
            return Ok(true);
        }
        if let Some(key) = queue
            .waiting
            .iter()
            .find(|(_, record)| record.id == job_id)
            .map(|(key, _)| *key)
        {
            queue.waiting.remove(&key);
            return Ok(true);
        }
        if let Some(key) = queue
            .delayed
            .iter()
            .find(|(_, record)| record.id == job_id)
            .map(|(key, _)| *key)
        {
            queue.delayed.remove(&key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn counts(&self, queue_name: &str) -> Result<QueueCounts, BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Ok(QueueCounts::default());
        };
        self.settle(queue);
        Ok(QueueCounts {
            waiting: queue.waiting.len() as u64,
            active: queue.active.len() as u64,
            completed: queue.finished.iter().filter(|job| job.success).count() as u64,
            failed: queue.finished.iter().filter(|job| !job.success).count() as u64,
            delayed: queue.delayed.len() as u64,
        })
    }

    async fn pause(&self, queue_name: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        state.queues.entry(queue_name.to_owned()).or_default().paused = true;
        Ok(())
    }

    async fn resume(&self, queue_name: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        state.queues.entry(queue_name.to_owned()).or_default().paused = false;
        Ok(())
    }

    async fn clean(&self, queue_name: &str, grace: Duration) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let Some(queue) = state.queues.get_mut(queue_name) else {
            return Ok(0);
        };
        let now = Instant::now();
        let before = queue.finished.len();
        queue
            .finished
            .retain(|job| now.duration_since(job.finished_at) < grace);
        Ok((before - queue.finished.len()) as u64)
    }

    async fn rate_limit_incr(&self, key: &str, window: Duration) -> Result<u64, BrokerError> {
        let mut state = self.state.lock().expect("broker mutex poisoned");
        let now = Instant::now();
        let entry = state
            .rate_windows
            .entry(key.to_owned())
            .or_insert(RateWindow {
                count: 0,
                expires_at: now + window,
            });
        if now >= entry.expires_at {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;
        Ok(entry.count)
    }
}
