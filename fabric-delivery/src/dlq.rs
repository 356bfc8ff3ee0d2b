//! Dead-letter storage for notifications that exhausted their retries.
//!
//! Every row carries the owning org and every read is scoped by it; a
//! listing that omits org_id would leak across tenants.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::notification::Channel;
use fabric_common::error::Error;

/// DLQ reasons are truncated so one pathological error string cannot
/// bloat the table.
pub const MAX_REASON_LEN: usize = 1000;

/// Offset pagination is bounded; past this, callers must switch to a
/// cursor.
pub const MAX_LIST_OFFSET: i64 = 10_000;

#[derive(Debug, Clone, FromRow)]
pub struct DeadLetter {
    pub id: Uuid,
    pub notification_id: Uuid,
    pub org_id: String,
    pub channel: Channel,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Truncate a reason on a char boundary.
pub fn truncate_reason(reason: &str) -> String {
    if reason.chars().count() <= MAX_REASON_LEN {
        return reason.to_owned();
    }
    reason.chars().take(MAX_REASON_LEN).collect()
}

pub async fn insert_dead_letter<'c, E>(
    executor: E,
    notification_id: Uuid,
    org_id: &str,
    channel: Channel,
    reason: &str,
) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO notification_dlq (notification_id, org_id, channel, reason)
VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(notification_id)
    .bind(org_id)
    .bind(channel)
    .bind(truncate_reason(reason))
    .execute(executor)
    .await?;
    Ok(())
}

/// List an org's dead letters, newest first.
pub async fn list_for_org(
    pool: &PgPool,
    org_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<DeadLetter>, Error> {
    if offset > MAX_LIST_OFFSET {
        return Err(Error::Validation(format!(
            "offset {offset} exceeds {MAX_LIST_OFFSET}; use cursor pagination"
        )));
    }
    let limit = limit.clamp(1, 100);

    let rows = sqlx::query_as::<_, DeadLetter>(
        r#"
SELECT id, notification_id, org_id, channel, reason, created_at
FROM notification_dlq
WHERE org_id = $1
ORDER BY created_at DESC
LIMIT $2 OFFSET $3
        "#,
    )
    .bind(org_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
