//! The job scheduler: admission control, the per-queue worker pool, and
//! job lifecycle bookkeeping.
//!
//! One worker task per registered queue polls the broker and spawns a
//! processing task per claimed job, bounded by a semaphore. Every
//! in-flight job has its own cancellation token, stored under the job id
//! computed exactly once — the token is inserted and removed under the
//! same key, so a mismatch cannot leak controllers. A periodic sweep
//! aborts tokens whose jobs silently disappeared.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::error::WorkerError;
use crate::jobs::{HandlerError, JobConfig, JobContext, JobHandler, PayloadSchema, MAX_PAYLOAD_BYTES};
use fabric_common::broker::{
    rate_limit_key, Backoff, Broker, BrokerError, LeasedJob, NewJob, Priority, QueueCounts,
};
use fabric_common::error::Error;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// How often each queue worker polls for jobs.
    pub poll_interval: Duration,
    /// Admission rejects when a queue's waiting count exceeds this.
    pub backpressure_limit: u64,
    /// Cadence of the stale-cancellation sweep.
    pub stale_sweep_interval: Duration,
    /// Tokens older than this are aborted and dropped by the sweep.
    pub stale_token_age: Duration,
    /// Per-worker drain budget during stop.
    pub drain_deadline: Duration,
    /// Cadence of the recurring-job scheduler.
    pub cron_tick: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            backpressure_limit: 1000,
            stale_sweep_interval: Duration::from_secs(60),
            stale_token_age: Duration::from_secs(300),
            drain_deadline: Duration::from_secs(10),
            cron_tick: Duration::from_secs(60),
        }
    }
}

/// Options for a single `schedule` call.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub priority: Option<Priority>,
    pub delay: Option<Duration>,
    pub job_id: Option<String>,
    pub org_id: Option<String>,
}

/// Handle to an admitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub id: String,
    pub queue: String,
}

#[derive(Debug, Clone)]
pub enum JobEvent {
    Started {
        job_id: String,
        name: String,
        queue: String,
        attempt: i32,
    },
    Completed {
        job_id: String,
        name: String,
        queue: String,
        attempt: i32,
    },
    Retried {
        job_id: String,
        name: String,
        queue: String,
        attempt: i32,
        error: String,
    },
    Failed {
        job_id: String,
        name: String,
        queue: String,
        attempt: i32,
        error: String,
    },
}

#[derive(Clone)]
struct Registration {
    config: JobConfig,
    handler: Arc<dyn JobHandler>,
    schema: Option<Arc<dyn PayloadSchema>>,
}

struct CancelEntry {
    token: CancellationToken,
    created_at: Instant,
}

struct RecurringEntry {
    name: String,
    payload: Value,
    schedule: cron::Schedule,
    next: DateTime<Utc>,
}

struct SchedulerInner {
    broker: Arc<dyn Broker>,
    options: SchedulerOptions,
    registrations: RwLock<HashMap<String, Registration>>,
    recurring: Mutex<Vec<RecurringEntry>>,
    cancellations: Mutex<HashMap<String, CancelEntry>>,
    running: AtomicBool,
    shutdown: CancellationToken,
    events: broadcast::Sender<JobEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    internal_subscriber: Mutex<Option<JoinHandle<()>>>,
    liveness: Mutex<Option<health::HealthHandle>>,
}

#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_options(broker, SchedulerOptions::default())
    }

    pub fn with_options(broker: Arc<dyn Broker>, options: SchedulerOptions) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SchedulerInner {
                broker,
                options,
                registrations: RwLock::new(HashMap::new()),
                recurring: Mutex::new(Vec::new()),
                cancellations: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                events,
                tasks: Mutex::new(Vec::new()),
                internal_subscriber: Mutex::new(None),
                liveness: Mutex::new(None),
            }),
        }
    }

    /// Attach a liveness handle that queue workers ping on every poll.
    pub fn set_liveness(&self, handle: health::HealthHandle) {
        *self.inner.liveness.lock().expect("scheduler mutex poisoned") = Some(handle);
    }

    /// Bind a handler (and optional payload schema) to a job name.
    /// Re-registration overwrites the previous binding.
    pub fn register(
        &self,
        config: JobConfig,
        handler: Arc<dyn JobHandler>,
        schema: Option<Arc<dyn PayloadSchema>>,
    ) -> Result<(), Error> {
        config.validate()?;
        let name = config.name.clone();
        self.inner
            .registrations
            .write()
            .expect("scheduler lock poisoned")
            .insert(
                name,
                Registration {
                    config,
                    handler,
                    schema,
                },
            );
        Ok(())
    }

    /// Admit a job: registered handler, handler readiness, payload bound,
    /// queue backpressure, and the job's rate limit, in that order.
    pub async fn schedule(
        &self,
        name: &str,
        payload: Value,
        options: ScheduleOptions,
    ) -> Result<JobHandle, Error> {
        schedule_inner(&self.inner, name, payload, options).await
    }

    /// Register a cron entry for `name`. The expression is validated
    /// here; enqueueing happens on the scheduler's cron tick.
    pub fn schedule_recurring(
        &self,
        name: &str,
        payload: Value,
        cron_expr: &str,
    ) -> Result<(), Error> {
        let registered = self
            .inner
            .registrations
            .read()
            .expect("scheduler lock poisoned")
            .contains_key(name);
        if !registered {
            return Err(Error::not_found("job handler", name));
        }

        let schedule = cron::Schedule::from_str(cron_expr)
            .map_err(|error| Error::Validation(format!("invalid cron expression: {error}")))?;
        let next = schedule
            .upcoming(Utc)
            .next()
            .ok_or_else(|| Error::Validation(format!("cron expression {cron_expr:?} never fires")))?;

        self.inner
            .recurring
            .lock()
            .expect("scheduler mutex poisoned")
            .push(RecurringEntry {
                name: name.to_owned(),
                payload,
                schedule,
                next,
            });
        Ok(())
    }

    /// Start one worker per registered queue plus the sweep and cron
    /// loops. Double starts are refused.
    pub fn start_workers(&self, concurrency: usize) -> Result<(), Error> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Validation("workers are already running".into()));
        }

        let queues: HashSet<String> = self
            .inner
            .registrations
            .read()
            .expect("scheduler lock poisoned")
            .values()
            .map(|registration| registration.config.queue.clone())
            .collect();

        let mut tasks = self.inner.tasks.lock().expect("scheduler mutex poisoned");
        for queue in queues {
            info!(%queue, concurrency, "starting queue worker");
            tasks.push(tokio::spawn(worker_loop(
                self.inner.clone(),
                queue,
                concurrency,
            )));
        }
        tasks.push(tokio::spawn(sweep_loop(self.inner.clone())));
        tasks.push(tokio::spawn(cron_loop(self.inner.clone())));

        // The internal metrics subscriber is torn down by stop(); user
        // subscriptions are not ours to close.
        let receiver = self.inner.events.subscribe();
        *self
            .inner
            .internal_subscriber
            .lock()
            .expect("scheduler mutex poisoned") = Some(tokio::spawn(metrics_subscriber(receiver)));

        Ok(())
    }

    /// Cancel an in-flight or waiting job: fire its cancellation token
    /// and drop the broker entry.
    pub async fn cancel(&self, queue: &str, job_id: &str) -> Result<bool, Error> {
        if let Some(entry) = self
            .inner
            .cancellations
            .lock()
            .expect("scheduler mutex poisoned")
            .get(job_id)
        {
            entry.token.cancel();
        }
        self.inner
            .broker
            .remove(queue, job_id)
            .await
            .map_err(broker_error)
    }

    /// Queue depth by state. A failing broker yields zeros, not an error:
    /// metrics must never take a dashboard down.
    pub async fn get_metrics(&self, queue: &str) -> QueueCounts {
        match self.inner.broker.counts(queue).await {
            Ok(counts) => counts,
            Err(error) => {
                warn!(%queue, %error, "queue metrics unavailable, reporting zeros");
                QueueCounts::default()
            }
        }
    }

    pub async fn pause(&self, queue: &str) -> Result<(), Error> {
        self.inner.broker.pause(queue).await.map_err(broker_error)
    }

    pub async fn resume(&self, queue: &str) -> Result<(), Error> {
        self.inner.broker.resume(queue).await.map_err(broker_error)
    }

    pub async fn clean_queue(&self, queue: &str, grace: Duration) -> Result<u64, Error> {
        self.inner
            .broker
            .clean(queue, grace)
            .await
            .map_err(broker_error)
    }

    /// Graceful shutdown: stop claiming, abort in-flight cancel signals,
    /// pause queues, drain workers under the deadline, force-close on
    /// overrun.
    pub async fn stop(&self) -> Result<(), WorkerError> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("stopping job scheduler");
        self.inner.shutdown.cancel();

        {
            let cancellations = self
                .inner
                .cancellations
                .lock()
                .expect("scheduler mutex poisoned");
            for entry in cancellations.values() {
                entry.token.cancel();
            }
        }

        let queues: HashSet<String> = self
            .inner
            .registrations
            .read()
            .expect("scheduler lock poisoned")
            .values()
            .map(|registration| registration.config.queue.clone())
            .collect();
        for queue in &queues {
            if let Err(error) = self.inner.broker.pause(queue).await {
                warn!(%queue, %error, "failed to pause queue during shutdown");
            }
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().expect("scheduler mutex poisoned"));
        let mut timed_out = false;
        for mut task in tasks {
            match tokio::time::timeout(self.inner.options.drain_deadline, &mut task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("worker failed to drain before deadline, force closing");
                    task.abort();
                    timed_out = true;
                }
            }
        }

        if let Some(subscriber) = self
            .inner
            .internal_subscriber
            .lock()
            .expect("scheduler mutex poisoned")
            .take()
        {
            subscriber.abort();
        }

        self.inner
            .cancellations
            .lock()
            .expect("scheduler mutex poisoned")
            .clear();

        if timed_out {
            Err(WorkerError::ShutdownTimeout)
        } else {
            Ok(())
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn workers_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Number of live cancellation tokens. Zero whenever the pool is idle.
    pub fn cancellation_count(&self) -> usize {
        self.inner
            .cancellations
            .lock()
            .expect("scheduler mutex poisoned")
            .len()
    }
}

fn broker_error(error: BrokerError) -> Error {
    Error::Infrastructure(error.to_string())
}

async fn schedule_inner(
    inner: &Arc<SchedulerInner>,
    name: &str,
    payload: Value,
    options: ScheduleOptions,
) -> Result<JobHandle, Error> {
    let registration = inner
        .registrations
        .read()
        .expect("scheduler lock poisoned")
        .get(name)
        .cloned()
        .ok_or_else(|| Error::not_found("job handler", name))?;

    registration.handler.ready()?;

    let serialized_len = serde_json::to_vec(&payload)?.len();
    if serialized_len > MAX_PAYLOAD_BYTES {
        return Err(Error::Validation(format!(
            "payload serializes to {serialized_len} bytes, limit is {MAX_PAYLOAD_BYTES}"
        )));
    }

    let queue = registration.config.queue.clone();
    let waiting = inner
        .broker
        .counts(&queue)
        .await
        .map_err(broker_error)?
        .waiting;
    if waiting > inner.options.backpressure_limit {
        return Err(Error::rate_limited(
            format!("queue {queue} is backed up ({waiting} waiting)"),
            Duration::from_secs(5),
        ));
    }

    if let Some(rate_limit) = &registration.config.rate_limit {
        let key = rate_limit_key(options.org_id.as_deref(), name);
        let count = inner
            .broker
            .rate_limit_incr(&key, rate_limit.duration)
            .await
            .map_err(broker_error)?;
        if count > u64::from(rate_limit.max) {
            return Err(Error::rate_limited(
                format!("rate limit exceeded for {key}"),
                rate_limit.duration,
            ));
        }
    }

    let job_id = inner
        .broker
        .enqueue(NewJob {
            name: name.to_owned(),
            queue: queue.clone(),
            payload,
            priority: options.priority.unwrap_or(registration.config.priority),
            max_attempts: registration.config.max_retries as i32 + 1,
            backoff: Backoff {
                kind: registration.config.backoff.kind,
                base: registration.config.backoff.delay,
            },
            timeout: registration.config.timeout,
            delay: options.delay,
            job_id: options.job_id,
            org_id: options.org_id,
        })
        .await
        .map_err(broker_error)?;

    Ok(JobHandle { id: job_id, queue })
}

/// Race the handler against its timeout and cancellation signal. The
/// select settles exactly once; the losing branches are dropped with it.
pub async fn execute_with_timeout<F>(
    handler: F,
    timeout: Duration,
    cancellation: CancellationToken,
) -> Result<Value, HandlerError>
where
    F: std::future::Future<Output = Result<Value, HandlerError>>,
{
    tokio::select! {
        result = handler => result,
        _ = tokio::time::sleep(timeout) => Err(HandlerError::from(Error::Transient(format!(
            "job timed out after {timeout:?}"
        )))),
        _ = cancellation.cancelled() => Err(HandlerError::no_retry(Error::Cancelled)),
    }
}

async fn worker_loop(inner: Arc<SchedulerInner>, queue: String, concurrency: usize) {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut poll = tokio::time::interval(inner.options.poll_interval);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = poll.tick() => {}
        }

        let liveness = inner
            .liveness
            .lock()
            .expect("scheduler mutex poisoned")
            .clone();
        if let Some(liveness) = liveness {
            liveness.report_healthy();
        }

        metrics::gauge!("fabric_worker_saturation_percent", &[("queue", queue.clone())])
            .set(1f64 - semaphore.available_permits() as f64 / concurrency as f64);

        // Claim until the queue is dry or the pool is saturated.
        loop {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                break;
            };
            match inner.broker.claim(&queue).await {
                Ok(Some(job)) => {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        process_job(inner, job).await;
                        drop(permit);
                    });
                }
                Ok(None) => break,
                Err(error) => {
                    error!(%queue, %error, "failed to claim job");
                    break;
                }
            }
        }
    }

    // Drain in-flight jobs; stop() bounds this wait with its deadline.
    if let Ok(permit) = semaphore.acquire_many(concurrency as u32).await {
        drop(permit);
    };
}

async fn process_job(inner: Arc<SchedulerInner>, job: LeasedJob) {
    // Computed exactly once and reused for both the insert and the
    // removal below.
    let effective_job_id = job.id.clone();
    let labels = [("queue", job.queue.clone())];
    metrics::counter!("fabric_jobs_total", &labels).increment(1);

    let registration = inner
        .registrations
        .read()
        .expect("scheduler lock poisoned")
        .get(&job.name)
        .cloned();
    let Some(registration) = registration else {
        error!(job = %job.name, "no handler registered for claimed job");
        fail_job(&inner, &job, "no handler registered").await;
        return;
    };

    if let Some(schema) = &registration.schema {
        if let Err(reason) = schema.validate(&job.payload) {
            fail_job(&inner, &job, &format!("payload validation failed: {reason}")).await;
            return;
        }
    }

    let span = tracing::info_span!(
        "job",
        request_id = %effective_job_id,
        job = %job.name,
        queue = %job.queue,
        org_id = job.org_id.as_deref().unwrap_or("-"),
        attempt = job.attempt,
    );

    let token = CancellationToken::new();
    inner
        .cancellations
        .lock()
        .expect("scheduler mutex poisoned")
        .insert(
            effective_job_id.clone(),
            CancelEntry {
                token: token.clone(),
                created_at: Instant::now(),
            },
        );

    emit(
        &inner,
        JobEvent::Started {
            job_id: job.id.clone(),
            name: job.name.clone(),
            queue: job.queue.clone(),
            attempt: job.attempt,
        },
    );

    let ctx = JobContext {
        request_id: effective_job_id.clone(),
        trace_id: None,
        org_id: job.org_id.clone(),
        attempt: job.attempt,
        cancellation: token.clone(),
    };

    let started = Instant::now();
    let result = execute_with_timeout(
        registration.handler.run(job.payload.clone(), ctx),
        job.timeout,
        token,
    )
    .instrument(span)
    .await;
    let elapsed = started.elapsed().as_secs_f64();

    match result {
        Ok(_) => {
            if let Err(error) = inner.broker.complete(&job.queue, &job.id).await {
                error!(job = %job.id, %error, "failed to complete job");
            }
            metrics::counter!("fabric_jobs_completed", &labels).increment(1);
            metrics::histogram!("fabric_jobs_processing_duration_seconds", &labels).record(elapsed);
            emit(
                &inner,
                JobEvent::Completed {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    queue: job.queue.clone(),
                    attempt: job.attempt,
                },
            );
        }
        Err(handler_error) => handle_failure(&inner, &job, &registration, handler_error).await,
    }

    // Same key as the insert; a divergent key here would leak the token.
    inner
        .cancellations
        .lock()
        .expect("scheduler mutex poisoned")
        .remove(&effective_job_id);
}

async fn handle_failure(
    inner: &Arc<SchedulerInner>,
    job: &LeasedJob,
    registration: &Registration,
    handler_error: HandlerError,
) {
    let message = handler_error.to_string();
    let labels = [("queue", job.queue.clone())];

    if !handler_error.is_retryable() {
        fail_job(inner, job, &message).await;
        return;
    }

    let delay = registration
        .config
        .retry_policy()
        .time_until_next_retry(job.attempt as u32, handler_error.error.retry_after());

    match inner.broker.retry(&job.queue, &job.id, &message, delay).await {
        Ok(()) => {
            metrics::counter!("fabric_jobs_retried", &labels).increment(1);
            emit(
                inner,
                JobEvent::Retried {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    queue: job.queue.clone(),
                    attempt: job.attempt,
                    error: message,
                },
            );
        }
        Err(BrokerError::MaxAttemptsReached(_)) => {
            fail_job(inner, job, &message).await;
        }
        Err(error) => {
            error!(job = %job.id, %error, "failed to re-enqueue job for retry");
        }
    }
}

async fn fail_job(inner: &Arc<SchedulerInner>, job: &LeasedJob, message: &str) {
    if let Err(error) = inner.broker.fail(&job.queue, &job.id, message).await {
        error!(job = %job.id, %error, "failed to mark job failed");
    }
    metrics::counter!("fabric_jobs_failed", &[("queue", job.queue.clone())]).increment(1);
    emit(
        inner,
        JobEvent::Failed {
            job_id: job.id.clone(),
            name: job.name.clone(),
            queue: job.queue.clone(),
            attempt: job.attempt,
            error: message.to_owned(),
        },
    );
}

fn emit(inner: &Arc<SchedulerInner>, event: JobEvent) {
    // No receivers is fine; events are best-effort.
    inner.events.send(event).ok();
}

/// Abort and drop cancellation tokens whose jobs vanished without
/// reaching their cleanup (e.g. a panicked processing task).
async fn sweep_loop(inner: Arc<SchedulerInner>) {
    let mut ticker = tokio::time::interval(inner.options.stale_sweep_interval);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut cancellations = inner
            .cancellations
            .lock()
            .expect("scheduler mutex poisoned");
        let stale: Vec<String> = cancellations
            .iter()
            .filter(|(_, entry)| entry.created_at.elapsed() >= inner.options.stale_token_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(entry) = cancellations.remove(&id) {
                warn!(job = %id, "sweeping stale cancellation token");
                entry.token.cancel();
            }
        }
    }
}

/// Enqueue recurring jobs at their cron times.
async fn cron_loop(inner: Arc<SchedulerInner>) {
    let mut ticker = tokio::time::interval(inner.options.cron_tick);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let due: Vec<(String, Value)> = {
            let mut recurring = inner.recurring.lock().expect("scheduler mutex poisoned");
            let now = Utc::now();
            let mut due = Vec::new();
            for entry in recurring.iter_mut() {
                if entry.next <= now {
                    due.push((entry.name.clone(), entry.payload.clone()));
                    if let Some(next) = entry.schedule.after(&now).next() {
                        entry.next = next;
                    }
                }
            }
            due
        };

        for (name, payload) in due {
            if let Err(error) =
                schedule_inner(&inner, &name, payload, ScheduleOptions::default()).await
            {
                warn!(job = %name, %error, "failed to enqueue recurring job");
            }
        }
    }
}

async fn metrics_subscriber(mut receiver: broadcast::Receiver<JobEvent>) {
    loop {
        match receiver.recv().await {
            Ok(JobEvent::Started { queue, .. }) => {
                metrics::counter!("fabric_job_events_total", &[("queue", queue), ("kind", "started".to_owned())]).increment(1);
            }
            Ok(JobEvent::Completed { queue, .. }) => {
                metrics::counter!("fabric_job_events_total", &[("queue", queue), ("kind", "completed".to_owned())]).increment(1);
            }
            Ok(JobEvent::Retried { queue, .. }) => {
                metrics::counter!("fabric_job_events_total", &[("queue", queue), ("kind", "retried".to_owned())]).increment(1);
            }
            Ok(JobEvent::Failed { queue, .. }) => {
                metrics::counter!("fabric_job_events_total", &[("queue", queue), ("kind", "failed".to_owned())]).increment(1);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "metrics subscriber lagged behind job events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fabric_common::broker::MemoryBroker;
    use fabric_common::retry::BackoffKind;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn test_options() -> SchedulerOptions {
        SchedulerOptions {
            poll_interval: Duration::from_millis(10),
            backpressure_limit: 1000,
            stale_sweep_interval: Duration::from_millis(50),
            stale_token_age: Duration::from_secs(300),
            drain_deadline: Duration::from_secs(2),
            cron_tick: Duration::from_millis(50),
        }
    }

    fn scheduler() -> JobScheduler {
        JobScheduler::with_options(Arc::new(MemoryBroker::default()), test_options())
    }

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn run(&self, payload: Value, _ctx: JobContext) -> Result<Value, HandlerError> {
            Ok(payload)
        }
    }

    struct FailingHandler {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for FailingHandler {
        async fn run(&self, _payload: Value, _ctx: JobContext) -> Result<Value, HandlerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::from(Error::Transient("flaky downstream".into())))
        }
    }

    struct StubHandler;

    #[async_trait]
    impl JobHandler for StubHandler {
        async fn run(&self, _payload: Value, _ctx: JobContext) -> Result<Value, HandlerError> {
            Err(HandlerError::from(Error::NotImplemented("stub".into())))
        }

        fn ready(&self) -> Result<(), Error> {
            Err(Error::NotImplemented("upstream is stubbed".into()))
        }
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<JobEvent>, mut predicate: F) -> JobEvent
    where
        F: FnMut(&JobEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for job event")
                .expect("event channel closed");
            if predicate(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn schedule_requires_registration() {
        let scheduler = scheduler();
        let error = scheduler
            .schedule("unknown", json!({}), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn schedule_enforces_the_payload_bound() {
        let scheduler = scheduler();
        scheduler
            .register(
                JobConfig::new("export", "exports"),
                Arc::new(EchoHandler),
                None,
            )
            .unwrap();

        // {"d":"<s>"} serializes to s.len() + 8 bytes.
        let exactly_at_limit = "x".repeat(MAX_PAYLOAD_BYTES - 8);
        let payload = json!({ "d": exactly_at_limit });
        assert_eq!(serde_json::to_vec(&payload).unwrap().len(), MAX_PAYLOAD_BYTES);
        scheduler
            .schedule("export", payload, ScheduleOptions::default())
            .await
            .expect("payload exactly at the limit is accepted");

        let one_past = "x".repeat(MAX_PAYLOAD_BYTES - 7);
        let error = scheduler
            .schedule("export", json!({ "d": one_past }), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
    }

    #[tokio::test]
    async fn schedule_applies_backpressure() {
        let options = SchedulerOptions {
            backpressure_limit: 3,
            ..test_options()
        };
        let scheduler = JobScheduler::with_options(Arc::new(MemoryBroker::default()), options);
        scheduler
            .register(
                JobConfig::new("export", "exports"),
                Arc::new(EchoHandler),
                None,
            )
            .unwrap();

        // waiting == limit is still accepted; limit + 1 rejects.
        for _ in 0..4 {
            scheduler
                .schedule("export", json!({}), ScheduleOptions::default())
                .await
                .unwrap();
        }
        let error = scheduler
            .schedule("export", json!({}), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::RateLimited { .. }));
    }

    #[tokio::test]
    async fn schedule_enforces_rate_limits() {
        let scheduler = scheduler();
        scheduler
            .register(
                JobConfig::new("export", "exports").rate_limit(2, Duration::from_secs(60)),
                Arc::new(EchoHandler),
                None,
            )
            .unwrap();

        let options = ScheduleOptions {
            org_id: Some("org-9".into()),
            ..Default::default()
        };
        scheduler
            .schedule("export", json!({}), options.clone())
            .await
            .unwrap();
        scheduler
            .schedule("export", json!({}), options.clone())
            .await
            .unwrap();
        let error = scheduler
            .schedule("export", json!({}), options)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::RateLimited { .. }));

        // Other buckets are unaffected.
        scheduler
            .schedule(
                "export",
                json!({}),
                ScheduleOptions {
                    org_id: Some("org-10".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stub_handlers_are_refused_at_admission() {
        let scheduler = scheduler();
        scheduler
            .register(
                JobConfig::new("feedback-ingest", "feedback"),
                Arc::new(StubHandler),
                None,
            )
            .unwrap();

        let error = scheduler
            .schedule("feedback-ingest", json!({}), ScheduleOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::NotImplemented(_)));
    }

    #[tokio::test]
    async fn workers_run_jobs_to_completion() {
        let scheduler = scheduler();
        scheduler
            .register(
                JobConfig::new("export", "exports"),
                Arc::new(EchoHandler),
                None,
            )
            .unwrap();
        let mut events = scheduler.subscribe();

        scheduler.start_workers(2).unwrap();
        scheduler
            .schedule("export", json!({"n": 1}), ScheduleOptions::default())
            .await
            .unwrap();

        wait_for(&mut events, |event| {
            matches!(event, JobEvent::Completed { .. })
        })
        .await;

        let counts = scheduler.get_metrics("exports").await;
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 0);

        scheduler.stop().await.unwrap();
        assert!(!scheduler.workers_running());
        assert_eq!(scheduler.cancellation_count(), 0);
    }

    #[tokio::test]
    async fn failing_jobs_retry_then_fail() {
        let scheduler = scheduler();
        let handler = Arc::new(FailingHandler {
            runs: AtomicUsize::new(0),
        });
        scheduler
            .register(
                JobConfig::new("flaky", "exports")
                    .max_retries(1)
                    .backoff(BackoffKind::Fixed, Duration::from_millis(100)),
                handler.clone(),
                None,
            )
            .unwrap();
        let mut events = scheduler.subscribe();

        scheduler.start_workers(1).unwrap();
        scheduler
            .schedule("flaky", json!({}), ScheduleOptions::default())
            .await
            .unwrap();

        wait_for(&mut events, |event| matches!(event, JobEvent::Retried { .. })).await;
        wait_for(&mut events, |event| matches!(event, JobEvent::Failed { .. })).await;

        // max_retries = 1 means two attempts total.
        assert_eq!(handler.runs.load(Ordering::SeqCst), 2);
        let counts = scheduler.get_metrics("exports").await;
        assert_eq!(counts.failed, 1);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn schema_violations_fail_without_retry() {
        let scheduler = scheduler();
        let handler = Arc::new(FailingHandler {
            runs: AtomicUsize::new(0),
        });
        scheduler
            .register(
                JobConfig::new("typed", "exports"),
                handler.clone(),
                Some(Arc::new(crate::jobs::RequiredFields::new(&["domainId"]))),
            )
            .unwrap();
        let mut events = scheduler.subscribe();

        scheduler.start_workers(1).unwrap();
        scheduler
            .schedule("typed", json!({"other": 1}), ScheduleOptions::default())
            .await
            .unwrap();

        let failed = wait_for(&mut events, |event| matches!(event, JobEvent::Failed { .. })).await;
        if let JobEvent::Failed { error, .. } = failed {
            assert!(error.contains("validation"));
        }
        // The handler never ran.
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unregistered_claimed_jobs_fail_terminally() {
        let broker = Arc::new(MemoryBroker::default());
        let scheduler = JobScheduler::with_options(broker.clone(), test_options());
        scheduler
            .register(
                JobConfig::new("known", "exports"),
                Arc::new(EchoHandler),
                None,
            )
            .unwrap();
        let mut events = scheduler.subscribe();
        scheduler.start_workers(1).unwrap();

        // Enqueue a job the scheduler never registered, as a foreign
        // producer could.
        broker
            .enqueue(NewJob {
                name: "mystery".into(),
                queue: "exports".into(),
                payload: json!({}),
                priority: Priority::Normal,
                max_attempts: 3,
                backoff: Backoff {
                    kind: BackoffKind::Fixed,
                    base: Duration::from_millis(100),
                },
                timeout: Duration::from_secs(5),
                delay: None,
                job_id: None,
                org_id: None,
            })
            .await
            .unwrap();

        let failed = wait_for(&mut events, |event| matches!(event, JobEvent::Failed { .. })).await;
        if let JobEvent::Failed { error, .. } = failed {
            assert!(error.contains("no handler"));
        }

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_removes_pending_jobs() {
        let scheduler = scheduler();
        scheduler
            .register(
                JobConfig::new("export", "exports"),
                Arc::new(EchoHandler),
                None,
            )
            .unwrap();

        let handle = scheduler
            .schedule(
                "export",
                json!({}),
                ScheduleOptions {
                    delay: Some(Duration::from_secs(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(scheduler.cancel(&handle.queue, &handle.id).await.unwrap());
        let counts = scheduler.get_metrics("exports").await;
        assert_eq!(counts.waiting + counts.delayed, 0);
    }

    #[tokio::test]
    async fn recurring_jobs_fire_on_the_cron_tick() {
        let scheduler = scheduler();
        scheduler
            .register(
                JobConfig::new("tick", "exports"),
                Arc::new(EchoHandler),
                None,
            )
            .unwrap();
        // Every second; the cron loop ticks every 50ms in tests.
        scheduler
            .schedule_recurring("tick", json!({"recurring": true}), "* * * * * *")
            .unwrap();
        let mut events = scheduler.subscribe();

        scheduler.start_workers(1).unwrap();
        wait_for(&mut events, |event| {
            matches!(event, JobEvent::Completed { .. })
        })
        .await;

        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_cron_expressions_are_rejected() {
        let scheduler = scheduler();
        scheduler
            .register(
                JobConfig::new("tick", "exports"),
                Arc::new(EchoHandler),
                None,
            )
            .unwrap();
        let error = scheduler
            .schedule_recurring("tick", json!({}), "definitely not cron")
            .unwrap_err();
        assert!(matches!(error, Error::Validation(_)));
    }

    #[tokio::test]
    async fn double_start_is_refused() {
        let scheduler = scheduler();
        scheduler.start_workers(1).unwrap();
        assert!(scheduler.start_workers(1).is_err());
        scheduler.stop().await.unwrap();
    }

    #[tokio::test]
    async fn execute_with_timeout_times_out() {
        let token = CancellationToken::new();
        let result = execute_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!({}))
            },
            Duration::from_millis(20),
            token,
        )
        .await;
        let error = result.unwrap_err();
        assert!(error.is_retryable());
        assert!(error.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn execute_with_timeout_honors_cancellation() {
        let token = CancellationToken::new();
        let aborter = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            aborter.cancel();
        });

        let result = execute_with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!({}))
            },
            Duration::from_secs(5),
            token,
        )
        .await;
        let error = result.unwrap_err();
        assert!(matches!(error.error, Error::Cancelled));
        assert!(!error.is_retryable());
    }

    /// A broker whose counts always fail; metrics must degrade to zeros.
    struct BrokenBroker;

    #[async_trait]
    impl Broker for BrokenBroker {
        async fn enqueue(&self, _job: NewJob) -> Result<String, BrokerError> {
            Err(BrokerError::OperationError {
                command: "enqueue".into(),
                message: "down".into(),
            })
        }
        async fn claim(&self, _queue: &str) -> Result<Option<LeasedJob>, BrokerError> {
            Ok(None)
        }
        async fn complete(&self, _queue: &str, job_id: &str) -> Result<(), BrokerError> {
            Err(BrokerError::UnknownJob(job_id.into()))
        }
        async fn retry(
            &self,
            _queue: &str,
            job_id: &str,
            _error: &str,
            _delay: Duration,
        ) -> Result<(), BrokerError> {
            Err(BrokerError::UnknownJob(job_id.into()))
        }
        async fn fail(&self, _queue: &str, job_id: &str, _error: &str) -> Result<(), BrokerError> {
            Err(BrokerError::UnknownJob(job_id.into()))
        }
        async fn remove(&self, _queue: &str, _job_id: &str) -> Result<bool, BrokerError> {
            Ok(false)
        }
        async fn counts(&self, queue: &str) -> Result<QueueCounts, BrokerError> {
            Err(BrokerError::OperationError {
                command: "counts".into(),
                message: format!("queue {queue} unavailable"),
            })
        }
        async fn pause(&self, _queue: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn resume(&self, _queue: &str) -> Result<(), BrokerError> {
            Ok(())
        }
        async fn clean(&self, _queue: &str, _grace: Duration) -> Result<u64, BrokerError> {
            Ok(0)
        }
        async fn rate_limit_incr(&self, _key: &str, _window: Duration) -> Result<u64, BrokerError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn metrics_degrade_to_zeros_when_the_broker_fails() {
        let scheduler = JobScheduler::with_options(Arc::new(BrokenBroker), test_options());
        let counts = scheduler.get_metrics("exports").await;
        assert_eq!(counts, QueueCounts::default());
    }
}
