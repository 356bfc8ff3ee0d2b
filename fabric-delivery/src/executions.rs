//! The job_executions / job_attempts store.
//!
//! One row per logical execution, unique on (job_type, idempotency_key),
//! so at-least-once job delivery collapses to at-most-one execution.
//! Attempts are append-only and ordered per execution.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use fabric_common::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_execution_status", rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Started,
    Completed,
    Failed,
    Retrying,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 5] = [
        ExecutionStatus::Pending,
        ExecutionStatus::Started,
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Retrying,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Started => "started",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Retrying => "retrying",
        }
    }

    /// Status transitions move monotonically forward, with the single
    /// exception of failed → retrying.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus as S;
        matches!(
            (self, next),
            (S::Pending, S::Started)
                | (S::Pending, S::Failed)
                | (S::Started, S::Completed)
                | (S::Started, S::Failed)
                | (S::Failed, S::Retrying)
                | (S::Retrying, S::Started)
                | (S::Retrying, S::Completed)
                | (S::Retrying, S::Failed)
        )
    }

    /// The states the capacity gate counts as in-flight. Pending rows
    /// prevent bursting past the cap before work starts; retrying rows
    /// are about to consume resources again.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Pending | ExecutionStatus::Started | ExecutionStatus::Retrying
        )
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobExecution {
    pub id: Uuid,
    pub job_type: String,
    pub entity_id: String,
    pub org_id: String,
    pub idempotency_key: String,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

const EXECUTION_COLUMNS: &str =
    "id, job_type, entity_id, org_id, idempotency_key, status, started_at, completed_at, error";

pub async fn find_execution<'c, E>(
    executor: E,
    job_type: &str,
    idempotency_key: &str,
) -> Result<Option<JobExecution>, Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!(
        "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE job_type = $1 AND idempotency_key = $2"
    );
    let row = sqlx::query_as::<_, JobExecution>(&query)
        .bind(job_type)
        .bind(idempotency_key)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Insert an execution in `started`. A duplicate (job_type, key) surfaces
/// as [`Error::Integrity`], which callers of idempotent operations treat
/// as "already running".
pub async fn insert_started_execution<'c, E>(
    executor: E,
    job_type: &str,
    org_id: &str,
    idempotency_key: &str,
) -> Result<JobExecution, Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!(
        r#"
INSERT INTO job_executions (job_type, entity_id, org_id, idempotency_key, status, started_at)
VALUES ($1, $2, $3, $4, 'started'::job_execution_status, NOW())
RETURNING {EXECUTION_COLUMNS}
        "#
    );
    let row = sqlx::query_as::<_, JobExecution>(&query)
        .bind(job_type)
        .bind(org_id)
        .bind(org_id)
        .bind(idempotency_key)
        .fetch_one(executor)
        .await?;
    Ok(row)
}

/// Move an execution to a new status, stamping completed_at on terminal
/// states. The transition rule (monotonic forward, failed → retrying
/// excepted) is enforced in the UPDATE predicate itself, so a concurrent
/// writer cannot slip an illegal move between a read and a write; zero
/// rows affected is an integrity conflict.
pub async fn mark_execution<'c, E>(
    executor: E,
    execution_id: Uuid,
    status: ExecutionStatus,
    error: Option<&str>,
) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let allowed_from: Vec<String> = ExecutionStatus::ALL
        .iter()
        .filter(|from| from.can_transition_to(status))
        .map(|from| format!("'{}'", from.as_str()))
        .collect();
    if allowed_from.is_empty() {
        return Err(Error::Integrity(format!(
            "no state may transition to {status:?}"
        )));
    }

    let terminal = matches!(
        status,
        ExecutionStatus::Completed | ExecutionStatus::Failed
    );
    let completed_at = if terminal { ", completed_at = NOW()" } else { "" };
    let query = format!(
        "UPDATE job_executions SET status = $2, error = $3{completed_at} WHERE id = $1 AND status IN ({})",
        allowed_from.join(", ")
    );
    let updated = sqlx::query(&query)
        .bind(execution_id)
        .bind(status)
        .bind(error)
        .execute(executor)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(Error::Integrity(format!(
            "execution {execution_id} is missing or cannot transition to {status:?}"
        )));
    }
    Ok(())
}

/// Count in-flight executions for an entity. Used under the capacity
/// gate's advisory lock.
pub async fn count_in_flight<'c, E>(executor: E, entity_id: &str) -> Result<i64, Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let count: i64 = sqlx::query_scalar(
        r#"
SELECT COUNT(*) FROM job_executions
WHERE entity_id = $1
  AND status IN ('pending'::job_execution_status, 'started'::job_execution_status, 'retrying'::job_execution_status)
        "#,
    )
    .bind(entity_id)
    .fetch_one(executor)
    .await?;
    Ok(count)
}

/// The attempt number the next job_attempts row for this execution
/// should carry. Attempts are 1-based and strictly ordered per execution.
pub async fn next_attempt_number<'c, E>(executor: E, execution_id: Uuid) -> Result<i32, Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let max: Option<i32> = sqlx::query_scalar(
        "SELECT MAX(attempt_number) FROM job_attempts WHERE execution_id = $1",
    )
    .bind(execution_id)
    .fetch_one(executor)
    .await?;
    Ok(max.unwrap_or(0) + 1)
}

pub async fn record_attempt<'c, E>(
    executor: E,
    execution_id: Uuid,
    attempt_number: i32,
    success: bool,
    error: Option<&str>,
) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO job_attempts (execution_id, attempt_number, status, error)
VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(execution_id)
    .bind(attempt_number)
    .bind(if success { "success" } else { "failure" })
    .bind(error)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_monotonic_forward() {
        use ExecutionStatus as S;
        assert!(S::Pending.can_transition_to(S::Started));
        assert!(S::Started.can_transition_to(S::Completed));
        assert!(S::Started.can_transition_to(S::Failed));
        assert!(S::Retrying.can_transition_to(S::Started));

        assert!(!S::Completed.can_transition_to(S::Started));
        assert!(!S::Completed.can_transition_to(S::Failed));
        assert!(!S::Started.can_transition_to(S::Pending));
        assert!(!S::Failed.can_transition_to(S::Started));
    }

    #[test]
    fn failed_to_retrying_is_the_only_backward_edge() {
        use ExecutionStatus as S;
        assert!(S::Failed.can_transition_to(S::Retrying));
        assert!(!S::Failed.can_transition_to(S::Pending));
        assert!(!S::Failed.can_transition_to(S::Completed));
    }

    #[test]
    fn in_flight_states_match_the_capacity_gate() {
        use ExecutionStatus as S;
        assert!(S::Pending.is_in_flight());
        assert!(S::Started.is_in_flight());
        assert!(S::Retrying.is_in_flight());
        assert!(!S::Completed.is_in_flight());
        assert!(!S::Failed.is_in_flight());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn mark_execution_enforces_the_transition_rule(pool: sqlx::PgPool) {
        let execution = insert_started_execution(&pool, "domain-export", "org-1", "key-1")
            .await
            .unwrap();

        mark_execution(&pool, execution.id, ExecutionStatus::Completed, None)
            .await
            .unwrap();

        // Completed is terminal; nothing moves it again.
        let error = mark_execution(&pool, execution.id, ExecutionStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Integrity(_)));
        let error = mark_execution(&pool, execution.id, ExecutionStatus::Started, None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Integrity(_)));
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn failed_executions_resume_through_retrying(pool: sqlx::PgPool) {
        let execution = insert_started_execution(&pool, "publish", "org-1", "key-2")
            .await
            .unwrap();

        mark_execution(&pool, execution.id, ExecutionStatus::Failed, Some("boom"))
            .await
            .unwrap();

        // failed → started must go through retrying.
        let error = mark_execution(&pool, execution.id, ExecutionStatus::Started, None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Integrity(_)));

        mark_execution(&pool, execution.id, ExecutionStatus::Retrying, None)
            .await
            .unwrap();
        mark_execution(&pool, execution.id, ExecutionStatus::Started, None)
            .await
            .unwrap();

        let reloaded = find_execution(&pool, "publish", "key-2").await.unwrap().unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Started);
    }
}
