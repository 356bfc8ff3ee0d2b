//! Notification delivery: claim in one transaction, send with no client
//! held, finalize in a second transaction.
//!
//! Key invariants, in order of importance:
//! - no database connection is held across `adapter.send()`;
//! - a single `delivery_token` claim serializes workers per notification;
//! - `delivery_committed_at` is the idempotency witness — once set, the
//!   adapter is never called again for that notification.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{SendAdapter, SendMessage, SendOutcome};
use crate::dlq::{insert_dead_letter, truncate_reason};
use crate::notification::{
    load_notification, load_preference, save_status, Notification, NotificationStatus,
};
use crate::outbox::{write_to_outbox, EventEnvelope, EventMeta};
use fabric_common::error::Error;
use fabric_common::ids;

/// Delivery attempts allowed per notification before dead-lettering.
pub const MAX_RETRIES: i32 = 3;

/// Upper bound on one batch; larger inputs are truncated.
pub const MAX_BATCH_SIZE: usize = 100;

/// Notifications processed concurrently within a batch.
pub const BATCH_CONCURRENCY: usize = 5;

const STATEMENT_TIMEOUT: &str = "SET LOCAL statement_timeout = '10s'";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Delivery committed (now, previously, or by another worker).
    Delivered,
    /// Skipped because the user disabled this channel.
    Skipped,
    Failed {
        reason: String,
    },
}

enum PreDelivery {
    AlreadyDelivered,
    SkippedByPreference,
    Exhausted,
    Claimed {
        notification: Notification,
        attempt_number: i32,
    },
}

pub struct NotificationDispatcher {
    pool: PgPool,
    adapters: HashMap<crate::notification::Channel, Arc<dyn SendAdapter>>,
}

impl NotificationDispatcher {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            adapters: HashMap::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SendAdapter>) -> Self {
        self.adapters.insert(adapter.channel(), adapter);
        self
    }

    /// Drive one notification through claim → send → finalize.
    pub async fn process(&self, id: Uuid) -> Result<DispatchOutcome, Error> {
        let (notification, attempt_number) = match self.pre_delivery(id).await? {
            PreDelivery::AlreadyDelivered => return Ok(DispatchOutcome::Delivered),
            PreDelivery::SkippedByPreference => return Ok(DispatchOutcome::Skipped),
            PreDelivery::Exhausted => {
                return Ok(DispatchOutcome::Failed {
                    reason: "Max retries exceeded".to_owned(),
                })
            }
            PreDelivery::Claimed {
                notification,
                attempt_number,
            } => (notification, attempt_number),
        };

        // Validated during pre-delivery; absence here would be a
        // registration change mid-flight.
        let adapter = self
            .adapters
            .get(&notification.channel)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "no adapter registered for channel {}",
                    notification.channel
                ))
            })?
            .clone();

        // External send. No database client is held here.
        let message = SendMessage::from_notification(&notification);
        let outcome = adapter.send(&message).await;

        self.post_delivery(&notification, attempt_number, outcome)
            .await
    }

    /// Process a batch of notification ids, each through its own
    /// independent transaction pair.
    pub async fn process_batch(
        &self,
        mut ids: Vec<Uuid>,
    ) -> Vec<(Uuid, Result<DispatchOutcome, Error>)> {
        if ids.len() > MAX_BATCH_SIZE {
            warn!(
                requested = ids.len(),
                cap = MAX_BATCH_SIZE,
                "truncating notification batch"
            );
            ids.truncate(MAX_BATCH_SIZE);
        }

        stream::iter(ids)
            .map(|id| async move { (id, self.process(id).await) })
            .buffer_unordered(BATCH_CONCURRENCY)
            .collect()
            .await
    }

    async fn pre_delivery(&self, id: Uuid) -> Result<PreDelivery, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(STATEMENT_TIMEOUT).execute(&mut *tx).await?;

        let mut notification = load_notification(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::not_found("notification", id.to_string()))?;

        // Retry budget first: an exhausted notification dead-letters
        // without touching the adapter.
        let attempts = count_attempts(&mut tx, id).await?;
        let attempt_number = attempts + 1;
        if attempt_number > MAX_RETRIES {
            insert_dead_letter(
                &mut *tx,
                id,
                &notification.org_id,
                notification.channel,
                "Max retries exceeded",
            )
            .await?;
            save_status(&mut *tx, id, NotificationStatus::Failed).await?;
            tx.commit().await?;
            return Ok(PreDelivery::Exhausted);
        }

        // Preference gating: a disabled channel counts as handled, with
        // an audit event rather than an external send.
        let preference = load_preference(&mut *tx, &notification.user_id, notification.channel)
            .await?;
        if preference.is_some_and(|preference| !preference.enabled) {
            if notification.status == NotificationStatus::Failed {
                save_status(&mut *tx, id, NotificationStatus::Pending).await?;
                notification.status = NotificationStatus::Pending;
            }
            notification.succeed()?;
            save_status(&mut *tx, id, notification.status).await?;
            write_to_outbox(
                &mut *tx,
                &skip_envelope(&notification),
            )
            .await?;
            tx.commit().await?;
            return Ok(PreDelivery::SkippedByPreference);
        }

        // Idempotency witness: a committed delivery never re-sends.
        if notification.delivery_committed_at.is_some() {
            tx.commit().await?;
            return Ok(PreDelivery::AlreadyDelivered);
        }

        // Claim. Exactly one worker wins; the loser reads this as the
        // winner being responsible and reports delivered optimistically.
        let token = ids::uuid_v4();
        let claimed = sqlx::query(
            "UPDATE notifications SET delivery_token = $2, updated_at = NOW() WHERE id = $1 AND delivery_token IS NULL",
        )
        .bind(id)
        .bind(token)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.commit().await?;
            return Ok(PreDelivery::AlreadyDelivered);
        }
        notification.delivery_token = Some(token);

        // Adapter presence is validated before any state transition so a
        // misconfigured channel rolls back instead of sticking in
        // 'sending'.
        if !self.adapters.contains_key(&notification.channel) {
            tx.rollback().await?;
            return Err(Error::Validation(format!(
                "no adapter registered for channel {}",
                notification.channel
            )));
        }

        // Automatic retry path: the entity rejects failed → sending, so
        // reset the row to pending first. Bookkeeping, not a domain
        // transition.
        if notification.status == NotificationStatus::Failed {
            save_status(&mut *tx, id, NotificationStatus::Pending).await?;
            notification.status = NotificationStatus::Pending;
        }

        notification.start()?;
        save_status(&mut *tx, id, notification.status).await?;
        tx.commit().await?;

        Ok(PreDelivery::Claimed {
            notification,
            attempt_number,
        })
    }

    async fn post_delivery(
        &self,
        notification: &Notification,
        attempt_number: i32,
        outcome: SendOutcome,
    ) -> Result<DispatchOutcome, Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(STATEMENT_TIMEOUT).execute(&mut *tx).await?;

        let labels = [("channel", notification.channel.to_string())];

        match outcome {
            SendOutcome::Sent { provider_id } => {
                record_attempt(&mut tx, notification.id, attempt_number, true, None).await?;

                let mut delivered = notification.clone();
                delivered.succeed()?;
                save_status(&mut *tx, notification.id, delivered.status).await?;
                sqlx::query(
                    "UPDATE notifications SET delivery_committed_at = NOW() WHERE id = $1 AND delivery_committed_at IS NULL",
                )
                .bind(notification.id)
                .execute(&mut *tx)
                .await?;

                write_to_outbox(&mut *tx, &sent_envelope(notification, provider_id)).await?;
                tx.commit().await?;

                metrics::counter!("fabric_notifications_delivered", &labels).increment(1);
                Ok(DispatchOutcome::Delivered)
            }
            SendOutcome::Failed { reason, .. } => {
                let reason = truncate_reason(&reason);
                record_attempt(
                    &mut tx,
                    notification.id,
                    attempt_number,
                    false,
                    Some(&reason),
                )
                .await?;

                let mut failed = notification.clone();
                failed.fail()?;
                save_status(&mut *tx, notification.id, failed.status).await?;
                // Release the claim so the automatic retry can re-claim;
                // delivery_committed_at stays the only idempotency witness.
                sqlx::query(
                    "UPDATE notifications SET delivery_token = NULL, updated_at = NOW() WHERE id = $1",
                )
                .bind(notification.id)
                .execute(&mut *tx)
                .await?;

                insert_dead_letter(
                    &mut *tx,
                    notification.id,
                    &notification.org_id,
                    notification.channel,
                    &reason,
                )
                .await?;
                write_to_outbox(&mut *tx, &failed_envelope(notification, &reason)).await?;
                tx.commit().await?;

                metrics::counter!("fabric_notifications_failed", &labels).increment(1);
                Ok(DispatchOutcome::Failed { reason })
            }
        }
    }
}

async fn count_attempts(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<i32, Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM notification_attempts WHERE notification_id = $1")
            .bind(id)
            .fetch_one(&mut **tx)
            .await?;
    Ok(count as i32)
}

async fn record_attempt(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    attempt_number: i32,
    success: bool,
    error: Option<&str>,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO notification_attempts (notification_id, attempt_number, status, error) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(attempt_number)
    .bind(if success { "success" } else { "failure" })
    .bind(error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn envelope_meta(notification: &Notification) -> EventMeta {
    EventMeta {
        correlation_id: None,
        source: "notification-dispatcher".to_owned(),
        domain_id: Some(notification.id.to_string()),
    }
}

fn sent_envelope(notification: &Notification, provider_id: Option<String>) -> EventEnvelope {
    EventEnvelope::new(
        "notification.sent",
        1,
        serde_json::json!({
            "notificationId": notification.id,
            "orgId": notification.org_id,
            "channel": notification.channel,
            "providerId": provider_id,
        }),
        envelope_meta(notification),
    )
}

fn failed_envelope(notification: &Notification, reason: &str) -> EventEnvelope {
    EventEnvelope::new(
        "notification.failed",
        1,
        serde_json::json!({
            "notificationId": notification.id,
            "orgId": notification.org_id,
            "channel": notification.channel,
            "error": reason,
        }),
        envelope_meta(notification),
    )
}

fn skip_envelope(notification: &Notification) -> EventEnvelope {
    EventEnvelope::new(
        "notification.skipped",
        1,
        serde_json::json!({
            "notificationId": notification.id,
            "orgId": notification.org_id,
            "channel": notification.channel,
            "reason": "delivery skipped by preference",
        }),
        envelope_meta(notification),
    )
}
