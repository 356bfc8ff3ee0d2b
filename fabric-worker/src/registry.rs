//! The platform job registry: named jobs, their queues and policies, and
//! the handlers behind them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::jobs::{HandlerError, JobConfig, JobContext, JobHandler, RequiredFields};
use crate::scheduler::JobScheduler;
use fabric_common::broker::{Broker, Priority};
use fabric_common::error::{is_retryable_message, Error};
use fabric_common::export::{resolve_export_path, to_csv};
use fabric_common::retry::BackoffKind;
use fabric_delivery::dispatcher::{DispatchOutcome, NotificationDispatcher};
use fabric_delivery::publish::{ExternalPublication, PublishAdapter, PublishOutcome, PublishRequest, PublishSaga};

/// Everything the registry needs to wire the platform's jobs. Delivery
/// services are optional so a worker without a database still runs the
/// export and maintenance jobs.
pub struct PlatformJobs {
    pub broker: Arc<dyn Broker>,
    pub export_base_dir: PathBuf,
    pub enable_feedback_ingest: bool,
    pub saga: Option<Arc<PublishSaga>>,
    pub dispatcher: Option<Arc<NotificationDispatcher>>,
}

impl PlatformJobs {
    /// Register every platform job and its recurring entries.
    pub fn register(&self, scheduler: &JobScheduler) -> Result<(), Error> {
        scheduler.register(
            JobConfig::new("domain-export", "exports")
                .max_retries(2)
                .timeout(Duration::from_secs(60)),
            Arc::new(DomainExportHandler {
                base_dir: self.export_base_dir.clone(),
            }),
            Some(Arc::new(RequiredFields::new(&["domainId", "format"]))),
        )?;

        if self.enable_feedback_ingest {
            // Registered behind the flag, and still refused at schedule
            // time by the readiness probe until the upstream exists.
            scheduler.register(
                JobConfig::new("feedback-ingest", "feedback").priority(Priority::Background),
                Arc::new(FeedbackIngestHandler),
                None,
            )?;
        }

        if let Some(saga) = &self.saga {
            scheduler.register(
                JobConfig::new("publish-intent", "publishing")
                    .priority(Priority::High)
                    .max_retries(3)
                    .backoff(BackoffKind::Exponential, Duration::from_secs(1))
                    .timeout(Duration::from_secs(120)),
                Arc::new(PublishIntentHandler { saga: saga.clone() }),
                Some(Arc::new(RequiredFields::new(&["intentId"]))),
            )?;
        }

        if let Some(dispatcher) = &self.dispatcher {
            scheduler.register(
                JobConfig::new("notification-deliver", "notifications")
                    .priority(Priority::High)
                    .max_retries(3)
                    .backoff(BackoffKind::Exponential, Duration::from_secs(2))
                    .timeout(Duration::from_secs(30)),
                Arc::new(NotificationDeliveryHandler {
                    dispatcher: dispatcher.clone(),
                }),
                Some(Arc::new(RequiredFields::new(&["notificationId"]))),
            )?;
        }

        scheduler.register(
            JobConfig::new("queue-clean", "maintenance")
                .priority(Priority::Background)
                .max_retries(0)
                .timeout(Duration::from_secs(30)),
            Arc::new(QueueCleanHandler {
                broker: self.broker.clone(),
                queues: vec![
                    "exports".to_owned(),
                    "publishing".to_owned(),
                    "notifications".to_owned(),
                    "maintenance".to_owned(),
                ],
            }),
            None,
        )?;
        // Hourly, offset from the top of the hour.
        scheduler.schedule_recurring("queue-clean", json!({}), "0 7 * * * *")?;

        Ok(())
    }
}

/// Export a domain's records as JSON or CSV, to a download data URL or a
/// file under the configured export directory.
pub struct DomainExportHandler {
    base_dir: PathBuf,
}

#[async_trait]
impl JobHandler for DomainExportHandler {
    async fn run(&self, payload: Value, ctx: JobContext) -> Result<Value, HandlerError> {
        if ctx.cancellation.is_cancelled() {
            return Err(HandlerError::no_retry(Error::Cancelled));
        }

        let format = payload
            .get("format")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("export format is required".into()))?;
        let records: Vec<Value> = payload
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let record_count = records.len();

        let (bytes, content_type) = match format {
            "json" => (
                serde_json::to_vec(&records).map_err(Error::from)?,
                "application/json",
            ),
            "csv" => (render_csv(&records).into_bytes(), "text/csv"),
            other => {
                return Err(HandlerError::from(Error::Validation(format!(
                    "{other} is not a supported export format"
                ))))
            }
        };

        let destination = payload
            .get("destination")
            .and_then(|destination| destination.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("download");

        match destination {
            "download" => {
                let url = format!("data:{content_type};base64,{}", BASE64.encode(&bytes));
                Ok(json!({ "downloadUrl": url, "recordCount": record_count }))
            }
            "file" => {
                let relative = payload
                    .get("destination")
                    .and_then(|destination| destination.get("path"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::Validation("file destination requires a path".into()))?;
                let resolved = resolve_export_path(&self.base_dir, relative)?;
                if let Some(parent) = resolved.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|error| Error::Infrastructure(error.to_string()))?;
                }
                tokio::fs::write(&resolved, &bytes)
                    .await
                    .map_err(|error| Error::Infrastructure(error.to_string()))?;
                info!(path = %resolved.display(), record_count, "wrote export file");
                Ok(json!({ "path": resolved.display().to_string(), "recordCount": record_count }))
            }
            other => Err(HandlerError::from(Error::Validation(format!(
                "{other} is not a supported export destination"
            )))),
        }
    }
}

/// Flatten records into CSV. Columns are the sorted union of top-level
/// keys; every cell goes through formula-injection escaping.
fn render_csv(records: &[Value]) -> String {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        if let Some(object) = record.as_object() {
            for key in object.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    columns.sort();

    let header: Vec<&str> = columns.iter().map(String::as_str).collect();
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            columns
                .iter()
                .map(|column| match record.get(column) {
                    None | Some(Value::Null) => String::new(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                })
                .collect()
        })
        .collect();
    to_csv(&header, &rows)
}

/// Stub: the feedback upstream is not wired. The readiness probe keeps
/// the scheduler from ever enqueueing this.
pub struct FeedbackIngestHandler;

#[async_trait]
impl JobHandler for FeedbackIngestHandler {
    async fn run(&self, _payload: Value, _ctx: JobContext) -> Result<Value, HandlerError> {
        Err(HandlerError::no_retry(Error::NotImplemented(
            "feedback ingest upstream is stubbed".into(),
        )))
    }

    fn ready(&self) -> Result<(), Error> {
        Err(Error::NotImplemented(
            "feedback ingest upstream is stubbed".into(),
        ))
    }
}

/// Drives the publish saga for one intent.
pub struct PublishIntentHandler {
    saga: Arc<PublishSaga>,
}

#[async_trait]
impl JobHandler for PublishIntentHandler {
    async fn run(&self, payload: Value, _ctx: JobContext) -> Result<Value, HandlerError> {
        let intent_id = parse_uuid(&payload, "intentId")?;
        let outcome = self.saga.publish(intent_id).await?;
        let value = match outcome {
            PublishOutcome::Published { external_id } => {
                json!({ "outcome": "published", "externalId": external_id })
            }
            PublishOutcome::Duplicate => json!({ "outcome": "duplicate" }),
            PublishOutcome::Recovered { external_id } => {
                json!({ "outcome": "recovered", "externalId": external_id })
            }
        };
        Ok(value)
    }
}

/// Drives one notification through the dispatcher.
pub struct NotificationDeliveryHandler {
    dispatcher: Arc<NotificationDispatcher>,
}

#[async_trait]
impl JobHandler for NotificationDeliveryHandler {
    async fn run(&self, payload: Value, _ctx: JobContext) -> Result<Value, HandlerError> {
        let notification_id = parse_uuid(&payload, "notificationId")?;
        match self.dispatcher.process(notification_id).await? {
            DispatchOutcome::Delivered => Ok(json!({ "delivered": true })),
            DispatchOutcome::Skipped => Ok(json!({ "delivered": false, "skipped": true })),
            DispatchOutcome::Failed { reason } => {
                // Let the broker's retry policy drive redelivery; the
                // dispatcher's own budget dead-letters on exhaustion.
                Err(HandlerError::from(Error::Transient(reason)))
            }
        }
    }
}

/// Drops finished broker records older than a day.
pub struct QueueCleanHandler {
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
}

#[async_trait]
impl JobHandler for QueueCleanHandler {
    async fn run(&self, _payload: Value, _ctx: JobContext) -> Result<Value, HandlerError> {
        let mut removed = 0u64;
        for queue in &self.queues {
            removed += self
                .broker
                .clean(queue, Duration::from_secs(24 * 60 * 60))
                .await
                .map_err(|error| Error::Infrastructure(error.to_string()))?;
        }
        Ok(json!({ "removed": removed }))
    }
}

fn parse_uuid(payload: &Value, field: &str) -> Result<Uuid, HandlerError> {
    let raw = payload
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Validation(format!("payload field {field} is required")))?;
    Uuid::parse_str(raw)
        .map_err(|_| HandlerError::from(Error::Validation(format!("{field} is not a UUID"))))
}

/// Publishes intents to a configured HTTP endpoint. The concrete social
/// platform adapters live outside this process; this one covers plain
/// HTTP targets and local development.
pub struct HttpPublishAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPublishAdapter {
    pub fn new(endpoint: String, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("Fabric Publish Worker")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for publish adapter");
        Self { client, endpoint }
    }
}

/// Classify a transport-level publish failure against the retry
/// allowlist: timeouts and the ECONNREFUSED/ETIMEDOUT/ECONNRESET/
/// "timeout"/"rate limit" message fragments are transient; everything
/// else (DNS, TLS, malformed requests) is terminal — the call guards a
/// non-idempotent publish.
fn classify_publish_transport_error(timed_out: bool, message: &str) -> Error {
    if timed_out || is_retryable_message(message) {
        Error::Transient(message.to_owned())
    } else {
        Error::Terminal(message.to_owned())
    }
}

#[async_trait]
impl PublishAdapter for HttpPublishAdapter {
    async fn publish(&self, request: &PublishRequest) -> Result<ExternalPublication, Error> {
        let body = json!({
            "intentId": request.intent_id,
            "orgId": request.org_id,
            "payload": request.payload,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                classify_publish_transport_error(error.is_timeout(), &error.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_upstream_status(
                status.as_u16(),
                "publish endpoint",
            ));
        }

        // A response we cannot read is not on the allowlist, and the
        // publish may already have happened upstream; never retry it.
        let body: Value = response
            .json()
            .await
            .map_err(|error| Error::Terminal(format!("malformed publish response: {error}")))?;
        let external_id = body
            .get("externalId")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Terminal("publish response has no externalId".into()))?
            .to_owned();

        Ok(ExternalPublication {
            external_id,
            external_url: body.get("url").and_then(Value::as_str).map(str::to_owned),
            metadata: body.get("metadata").cloned(),
        })
    }
}
