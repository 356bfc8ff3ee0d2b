//! Durable idempotency records for handlers that deduplicate whole
//! request/response exchanges (as opposed to the per-entity witnesses the
//! saga and dispatcher carry on their own rows).
//!
//! A record is claimed once per key; replays of a completed record return
//! the stored response without re-running the operation, and a replay
//! whose payload hash differs from the original is a conflict, never a
//! silent overwrite. Expired records are reclaimed in place.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::FromRow;

use fabric_common::error::Error;
use fabric_common::idempotency::payloads_equal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

impl IdempotencyStatus {
    fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::Pending => "pending",
            IdempotencyStatus::Completed => "completed",
            IdempotencyStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self, Error> {
        match raw {
            "pending" => Ok(IdempotencyStatus::Pending),
            "completed" => Ok(IdempotencyStatus::Completed),
            "failed" => Ok(IdempotencyStatus::Failed),
            other => Err(Error::Infrastructure(format!(
                "{other} is not a valid idempotency status"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub payload_hash: String,
    pub response: Option<Value>,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct RawRecord {
    key: String,
    payload_hash: String,
    response: Option<Value>,
    status: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl RawRecord {
    fn into_record(self) -> Result<IdempotencyRecord, Error> {
        Ok(IdempotencyRecord {
            status: IdempotencyStatus::parse(&self.status)?,
            key: self.key,
            payload_hash: self.payload_hash,
            response: self.response,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

/// Outcome of claiming a key.
#[derive(Debug)]
pub enum IdempotencyStart {
    /// This caller owns the key; run the operation and complete or fail it.
    Fresh,
    /// The operation already ran to a terminal state; reuse its record.
    Replay(IdempotencyRecord),
    /// Another caller holds the key and has not finished.
    InProgress,
}

/// Claim `key` for an operation whose canonical payload hash is
/// `payload_hash`. Reusing a key with a different payload is an
/// [`Error::Integrity`] conflict.
pub async fn begin<'c, E>(
    executor: E,
    key: &str,
    payload_hash: &str,
    ttl: Duration,
) -> Result<IdempotencyStart, Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres> + Copy,
{
    let expires_at = Utc::now() + ttl;

    // One statement claims fresh keys and reclaims expired ones; losing
    // the race means someone else owns the key.
    let claimed = sqlx::query(
        r#"
INSERT INTO idempotency_records (key, payload_hash, status, expires_at)
VALUES ($1, $2, 'pending', $3)
ON CONFLICT (key) DO UPDATE
SET payload_hash = EXCLUDED.payload_hash,
    response = NULL,
    status = 'pending',
    created_at = NOW(),
    expires_at = EXCLUDED.expires_at
WHERE idempotency_records.expires_at <= NOW()
        "#,
    )
    .bind(key)
    .bind(payload_hash)
    .bind(expires_at)
    .execute(executor)
    .await?;
    if claimed.rows_affected() > 0 {
        return Ok(IdempotencyStart::Fresh);
    }

    let existing = sqlx::query_as::<_, RawRecord>(
        "SELECT key, payload_hash, response, status, created_at, expires_at FROM idempotency_records WHERE key = $1",
    )
    .bind(key)
    .fetch_one(executor)
    .await?
    .into_record()?;

    if !payloads_equal(&existing.payload_hash, payload_hash) {
        return Err(Error::Integrity(format!(
            "idempotency key {key} was already used with a different payload"
        )));
    }

    match existing.status {
        IdempotencyStatus::Pending => Ok(IdempotencyStart::InProgress),
        IdempotencyStatus::Completed | IdempotencyStatus::Failed => {
            Ok(IdempotencyStart::Replay(existing))
        }
    }
}

pub async fn complete<'c, E>(executor: E, key: &str, response: &Value) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    settle(executor, key, IdempotencyStatus::Completed, Some(response)).await
}

pub async fn fail<'c, E>(executor: E, key: &str, error: &str) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let response = serde_json::json!({ "error": error });
    settle(executor, key, IdempotencyStatus::Failed, Some(&response)).await
}

async fn settle<'c, E>(
    executor: E,
    key: &str,
    status: IdempotencyStatus,
    response: Option<&Value>,
) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let updated = sqlx::query(
        "UPDATE idempotency_records SET status = $2, response = $3 WHERE key = $1 AND status = 'pending'",
    )
    .bind(key)
    .bind(status.as_str())
    .bind(response)
    .execute(executor)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(Error::Integrity(format!(
            "idempotency key {key} is not pending"
        )));
    }
    Ok(())
}
