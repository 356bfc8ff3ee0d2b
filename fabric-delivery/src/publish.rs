//! The two-phase-commit publish saga.
//!
//! Three transactions bracket one external call:
//!
//! 1. **Lock & record** — row-lock the intent, consult the idempotent
//!    execution record, insert/refresh it as started.
//! 2. **External call** — outside any transaction, under the publish
//!    circuit breaker and a bounded exponential retry.
//! 3. **Finalize** — idempotent success insert (partial unique index),
//!    execution completed, intent published.
//!
//! A distributed lock `publish:{intent_id}` is held across phases 2–3;
//! losing the acquisition race is a retryable error surfaced to the
//! broker. Release failures are logged, never propagated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::capacity::{assert_org_capacity, DEFAULT_MAX_ACTIVE_JOBS_PER_ORG};
use crate::executions::{
    find_execution, insert_started_execution, mark_execution, next_attempt_number, record_attempt,
    ExecutionStatus, JobExecution,
};
use fabric_common::breaker::{BreakerConfig, CircuitBreaker};
use fabric_common::error::Error;
use fabric_common::idempotency::deterministic_key;
use fabric_common::locks::{Lock, LockService};
use fabric_common::retry::{with_retry, RetryOptions};

pub const PUBLISH_JOB_TYPE: &str = "publish";
pub const PUBLISH_LOCK_TTL: Duration = Duration::from_secs(30);

const STATEMENT_TIMEOUT: &str = "SET LOCAL statement_timeout = '30s'";

#[derive(Debug, Clone, FromRow)]
pub struct PublishIntent {
    pub id: Uuid,
    pub org_id: String,
    pub status: String,
    pub payload: Value,
    pub external_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// What the saga asks an adapter to publish.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub intent_id: Uuid,
    pub org_id: String,
    pub payload: Value,
}

/// A committed external publication.
#[derive(Debug, Clone)]
pub struct ExternalPublication {
    pub external_id: String,
    pub external_url: Option<String>,
    pub metadata: Option<Value>,
}

#[async_trait]
pub trait PublishAdapter: Send + Sync {
    async fn publish(&self, request: &PublishRequest) -> Result<ExternalPublication, Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// This invocation performed the external publish.
    Published { external_id: String },
    /// A previous invocation already completed; nothing to do.
    Duplicate,
    /// The external call had committed but finalization was interrupted;
    /// this invocation finished the saga without re-publishing.
    Recovered { external_id: String },
}

/// The committed success row, as read during recovery.
#[derive(Debug, Clone)]
pub(crate) struct CommittedExecution {
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Phase1Plan {
    Duplicate,
    Recover,
    CallExternal,
}

/// Decide what phase 2 should do, from the execution record and any
/// committed success row. Pure so the branch table is testable.
pub(crate) fn plan_phase_one(
    execution: Option<&JobExecution>,
    committed: Option<&CommittedExecution>,
) -> Phase1Plan {
    match execution {
        Some(execution) if execution.status == ExecutionStatus::Completed => Phase1Plan::Duplicate,
        Some(execution)
            if committed.is_some()
                && matches!(
                    execution.status,
                    ExecutionStatus::Started | ExecutionStatus::Retrying
                ) =>
        {
            Phase1Plan::Recover
        }
        _ => Phase1Plan::CallExternal,
    }
}

/// Parse the metadata column of a committed execution. A corrupted value
/// must not block recovery forever, so it degrades to None with a warning.
pub(crate) fn parse_committed_metadata(intent_id: Uuid, raw: Option<String>) -> Option<Value> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(error) => {
            warn!(%intent_id, %error, "committed publish metadata is malformed; continuing recovery without it");
            None
        }
    }
}

pub struct PublishSaga {
    pool: PgPool,
    locks: Arc<dyn LockService>,
    adapter: Arc<dyn PublishAdapter>,
    retry: RetryOptions,
    breaker: Arc<CircuitBreaker>,
    max_active_jobs_per_org: u32,
}

struct Phase1 {
    intent: PublishIntent,
    execution: JobExecution,
    plan: Phase1Plan,
    committed: Option<CommittedExecution>,
}

impl PublishSaga {
    pub fn new(pool: PgPool, locks: Arc<dyn LockService>, adapter: Arc<dyn PublishAdapter>) -> Self {
        Self {
            pool,
            locks,
            adapter,
            retry: RetryOptions::default(),
            breaker: CircuitBreaker::named("publish-external", BreakerConfig::default()),
            max_active_jobs_per_org: DEFAULT_MAX_ACTIVE_JOBS_PER_ORG,
        }
    }

    pub fn with_retry_options(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_org_capacity(mut self, max_active_jobs_per_org: u32) -> Self {
        self.max_active_jobs_per_org = max_active_jobs_per_org;
        self
    }

    /// Run the saga for one intent.
    pub async fn publish(&self, intent_id: Uuid) -> Result<PublishOutcome, Error> {
        let phase1 = match self.lock_and_record(intent_id).await? {
            Some(phase1) => phase1,
            None => return Ok(PublishOutcome::Duplicate),
        };

        let lock = self
            .locks
            .acquire(&format!("publish:{intent_id}"), PUBLISH_LOCK_TTL)
            .await?
            .ok_or_else(|| Error::Transient("publish job already in progress".into()))?;

        let result = self.run_locked(phase1).await;
        self.release_lock(intent_id, &lock).await;
        result
    }

    async fn release_lock(&self, intent_id: Uuid, lock: &Lock) {
        match self.locks.release(lock).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%intent_id, "publish lock expired before release; a duplicate publish is possible")
            }
            Err(error) => warn!(%intent_id, %error, "failed to release publish lock"),
        }
    }

    async fn run_locked(&self, phase1: Phase1) -> Result<PublishOutcome, Error> {
        let Phase1 {
            intent,
            execution,
            plan,
            committed,
        } = phase1;

        match plan {
            Phase1Plan::Duplicate => Ok(PublishOutcome::Duplicate),
            Phase1Plan::Recover => {
                let committed = committed
                    .ok_or_else(|| Error::Infrastructure("recovery without a committed row".into()))?;
                let external_id = committed.external_id.clone().ok_or_else(|| {
                    Error::Infrastructure(format!(
                        "committed publish for intent {} has no external id",
                        intent.id
                    ))
                })?;
                let publication = ExternalPublication {
                    external_id: external_id.clone(),
                    external_url: committed.external_url,
                    metadata: committed.metadata,
                };
                self.finalize(&intent, &execution, &publication).await?;
                Ok(PublishOutcome::Recovered { external_id })
            }
            Phase1Plan::CallExternal => {
                let publication = match self.call_external(&intent).await {
                    Ok(publication) => publication,
                    Err(error) => {
                        self.record_terminal_failure(&intent, &execution, &error).await?;
                        return Err(error);
                    }
                };
                self.finalize(&intent, &execution, &publication).await?;
                Ok(PublishOutcome::Published {
                    external_id: publication.external_id,
                })
            }
        }
    }

    /// Phase 1: row-lock the intent and settle the execution record.
    /// Returns None for a duplicate (already completed) invocation.
    async fn lock_and_record(&self, intent_id: Uuid) -> Result<Option<Phase1>, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(STATEMENT_TIMEOUT).execute(&mut *tx).await?;

        let intent = sqlx::query_as::<_, PublishIntent>(
            "SELECT id, org_id, status, payload, external_id, published_at FROM publish_intents WHERE id = $1 FOR UPDATE",
        )
        .bind(intent_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::not_found("publish intent", intent_id.to_string()))?;

        let idempotency_key = deterministic_key(&[PUBLISH_JOB_TYPE, &intent_id.to_string()])?;
        let execution = find_execution(&mut *tx, PUBLISH_JOB_TYPE, &idempotency_key).await?;
        let committed = find_committed_execution(&mut tx, intent_id).await?;

        let plan = plan_phase_one(execution.as_ref(), committed.as_ref());
        if plan == Phase1Plan::Duplicate {
            tx.commit().await?;
            return Ok(None);
        }

        let execution = match execution {
            Some(existing) => {
                match existing.status {
                    // An interrupted run left the row started; it stays
                    // started through recovery or the re-attempt.
                    ExecutionStatus::Started => {}
                    // The legal path back from failed goes through
                    // retrying.
                    ExecutionStatus::Failed => {
                        mark_execution(&mut *tx, existing.id, ExecutionStatus::Retrying, None)
                            .await?;
                        mark_execution(&mut *tx, existing.id, ExecutionStatus::Started, None)
                            .await?;
                    }
                    _ => {
                        mark_execution(&mut *tx, existing.id, ExecutionStatus::Started, None)
                            .await?;
                    }
                }
                existing
            }
            None => {
                // Admission: the org capacity check and the insert it
                // admits run under the same advisory lock.
                assert_org_capacity(&mut tx, &intent.org_id, self.max_active_jobs_per_org).await?;
                insert_started_execution(
                    &mut *tx,
                    PUBLISH_JOB_TYPE,
                    &intent.org_id,
                    &idempotency_key,
                )
                .await?
            }
        };

        tx.commit().await?;
        Ok(Some(Phase1 {
            intent,
            execution,
            plan,
            committed,
        }))
    }

    /// Phase 2: the external call. No transaction is open; each attempt
    /// runs under the breaker, with transient failures retried on a
    /// bounded exponential backoff.
    async fn call_external(&self, intent: &PublishIntent) -> Result<ExternalPublication, Error> {
        let request = PublishRequest {
            intent_id: intent.id,
            org_id: intent.org_id.clone(),
            payload: intent.payload.clone(),
        };

        with_retry(self.retry, Error::is_retryable, |attempt| {
            let request = request.clone();
            async move {
                let result = self
                    .breaker
                    .execute(self.adapter.publish(&request))
                    .await;
                self.record_attempt_row(request.intent_id, attempt as i32 + 1, &result)
                    .await;
                result
            }
        })
        .await
    }

    /// Append a publish_attempts row. Attempt bookkeeping must never mask
    /// the call's own outcome, so failures here only warn.
    async fn record_attempt_row(
        &self,
        intent_id: Uuid,
        attempt_number: i32,
        result: &Result<ExternalPublication, Error>,
    ) {
        let (status, error) = match result {
            Ok(_) => ("success", None),
            Err(error) => ("failure", Some(error.to_string())),
        };
        let written = sqlx::query(
            "INSERT INTO publish_attempts (intent_id, attempt_number, status, error) VALUES ($1, $2, $3, $4)",
        )
        .bind(intent_id)
        .bind(attempt_number)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await;
        if let Err(error) = written {
            warn!(%intent_id, %error, "failed to record publish attempt");
        }
    }

    /// Terminal phase-2 failure: record it in a fresh transaction, then
    /// the original error is rethrown by the caller.
    async fn record_terminal_failure(
        &self,
        intent: &PublishIntent,
        execution: &JobExecution,
        error: &Error,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(STATEMENT_TIMEOUT).execute(&mut *tx).await?;

        sqlx::query(
            r#"
INSERT INTO publish_executions (intent_id, status, error, failed_at)
VALUES ($1, 'failed'::publish_status, $2, NOW())
            "#,
        )
        .bind(intent.id)
        .bind(error.to_string())
        .execute(&mut *tx)
        .await?;
        mark_execution(
            &mut *tx,
            execution.id,
            ExecutionStatus::Failed,
            Some(&error.to_string()),
        )
        .await?;
        let attempt_number = next_attempt_number(&mut *tx, execution.id).await?;
        record_attempt(
            &mut *tx,
            execution.id,
            attempt_number,
            false,
            Some(&error.to_string()),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Phase 3: idempotent finalize.
    async fn finalize(
        &self,
        intent: &PublishIntent,
        execution: &JobExecution,
        publication: &ExternalPublication,
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(STATEMENT_TIMEOUT).execute(&mut *tx).await?;

        // The partial unique index makes this a no-op when a success row
        // already committed.
        sqlx::query(
            r#"
INSERT INTO publish_executions (intent_id, status, external_id, external_url, metadata, completed_at)
VALUES ($1, 'success'::publish_status, $2, $3, $4, NOW())
ON CONFLICT (intent_id) WHERE status = 'success' DO NOTHING
            "#,
        )
        .bind(intent.id)
        .bind(&publication.external_id)
        .bind(&publication.external_url)
        .bind(&publication.metadata)
        .execute(&mut *tx)
        .await?;

        mark_execution(&mut *tx, execution.id, ExecutionStatus::Completed, None).await?;
        let attempt_number = next_attempt_number(&mut *tx, execution.id).await?;
        record_attempt(&mut *tx, execution.id, attempt_number, true, None).await?;

        sqlx::query(
            "UPDATE publish_intents SET status = 'published', external_id = $2, published_at = NOW() WHERE id = $1",
        )
        .bind(intent.id)
        .bind(&publication.external_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn find_committed_execution(
    tx: &mut Transaction<'_, Postgres>,
    intent_id: Uuid,
) -> Result<Option<CommittedExecution>, Error> {
    #[derive(FromRow)]
    struct Row {
        external_id: Option<String>,
        external_url: Option<String>,
        metadata: Option<String>,
    }

    // metadata is read as text and parsed leniently: a corrupted value
    // degrades to None instead of wedging recovery.
    let row = sqlx::query_as::<_, Row>(
        r#"
SELECT external_id, external_url, metadata::text AS metadata
FROM publish_executions
WHERE intent_id = $1 AND status = 'success'::publish_status
        "#,
    )
    .bind(intent_id)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(row.map(|row| CommittedExecution {
        external_id: row.external_id,
        external_url: row.external_url,
        metadata: parse_committed_metadata(intent_id, row.metadata),
    }))
}
