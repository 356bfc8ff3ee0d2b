//! Notification rows and their delivery state machine.
//!
//! The entity owns the domain transitions pending → sending →
//! delivered | failed. The retry reset failed → pending is deliberately
//! NOT a method here: it is not a domain transition, it is bookkeeping the
//! dispatcher performs with a plain SQL UPDATE before re-entering the
//! machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use fabric_common::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "notification_status", rename_all = "lowercase")]
pub enum NotificationStatus {
    Pending,
    Sending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "notification_channel", rename_all = "lowercase")]
pub enum Channel {
    Email,
    Webhook,
    Push,
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Channel::Email),
            "webhook" => Ok(Channel::Webhook),
            "push" => Ok(Channel::Push),
            invalid => Err(Error::Validation(format!(
                "{invalid} is not a valid notification channel"
            ))),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Channel::Email => write!(f, "email"),
            Channel::Webhook => write!(f, "webhook"),
            Channel::Push => write!(f, "push"),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub org_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub template: String,
    pub payload: Value,
    pub status: NotificationStatus,
    /// Claimed by exactly one worker per delivery attempt.
    pub delivery_token: Option<Uuid>,
    /// The idempotency witness: once set, external delivery committed and
    /// must never run again.
    pub delivery_committed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// pending → sending.
    pub fn start(&mut self) -> Result<(), Error> {
        match self.status {
            NotificationStatus::Pending => {
                self.status = NotificationStatus::Sending;
                Ok(())
            }
            other => Err(Error::Validation(format!(
                "cannot start delivery of a {other:?} notification"
            ))),
        }
    }

    /// sending → delivered, or pending → delivered when delivery is
    /// skipped (preference gating) without an external send.
    pub fn succeed(&mut self) -> Result<(), Error> {
        match self.status {
            NotificationStatus::Sending | NotificationStatus::Pending => {
                self.status = NotificationStatus::Delivered;
                Ok(())
            }
            other => Err(Error::Validation(format!(
                "cannot mark a {other:?} notification delivered"
            ))),
        }
    }

    /// sending → failed.
    pub fn fail(&mut self) -> Result<(), Error> {
        match self.status {
            NotificationStatus::Sending => {
                self.status = NotificationStatus::Failed;
                Ok(())
            }
            other => Err(Error::Validation(format!(
                "cannot fail a {other:?} notification"
            ))),
        }
    }
}

const NOTIFICATION_COLUMNS: &str = "id, org_id, user_id, channel, template, payload, status, delivery_token, delivery_committed_at, updated_at";

pub async fn load_notification<'c, E>(executor: E, id: Uuid) -> Result<Option<Notification>, Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = $1");
    let row = sqlx::query_as::<_, Notification>(&query)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

pub async fn save_status<'c, E>(
    executor: E,
    id: Uuid,
    status: NotificationStatus,
) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("UPDATE notifications SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(executor)
        .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Immediate,
    Daily,
    Weekly,
}

impl Frequency {
    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Immediate => "immediate",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct NotificationPreference {
    pub user_id: String,
    pub channel: Channel,
    pub enabled: bool,
    pub frequency: String,
}

pub async fn load_preference<'c, E>(
    executor: E,
    user_id: &str,
    channel: Channel,
) -> Result<Option<NotificationPreference>, Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let row = sqlx::query_as::<_, NotificationPreference>(
        "SELECT user_id, channel, enabled, frequency FROM notification_preferences WHERE user_id = $1 AND channel = $2",
    )
    .bind(user_id)
    .bind(channel)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Upsert a preference. The conflict target is the (user_id, channel)
/// unique pair — the surrogate id is never part of upsert identity.
pub async fn upsert_preference<'c, E>(
    executor: E,
    user_id: &str,
    channel: Channel,
    enabled: bool,
    frequency: Frequency,
) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO notification_preferences (user_id, channel, enabled, frequency)
VALUES ($1, $2, $3, $4)
ON CONFLICT (user_id, channel)
DO UPDATE SET enabled = EXCLUDED.enabled, frequency = EXCLUDED.frequency
        "#,
    )
    .bind(user_id)
    .bind(channel)
    .bind(enabled)
    .bind(frequency.as_str())
    .execute(executor)
    .await?;
    Ok(())
}
