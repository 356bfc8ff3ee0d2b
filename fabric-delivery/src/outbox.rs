//! Transactional outbox.
//!
//! Domain events are written in the same transaction that records the
//! state they describe; a separate relayer (outside this crate) drains
//! them to the event bus in occurred_at order. "Publish after commit" is
//! never used — an event either commits with its state change or not at
//! all.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use fabric_common::error::Error;
use fabric_common::ids;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
    pub meta: EventMeta,
}

impl EventEnvelope {
    pub fn new(name: &str, version: i32, payload: Value, meta: EventMeta) -> Self {
        Self {
            id: ids::uuid_v4(),
            name: name.to_owned(),
            version,
            occurred_at: ids::now(),
            payload,
            meta,
        }
    }
}

/// Write an envelope inside the caller's transaction.
pub async fn write_to_outbox<'c, E>(executor: E, envelope: &EventEnvelope) -> Result<(), Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let meta = serde_json::to_value(&envelope.meta)?;
    sqlx::query(
        r#"
INSERT INTO outbox_events (id, name, version, occurred_at, payload, meta)
VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(envelope.id)
    .bind(&envelope.name)
    .bind(envelope.version)
    .bind(envelope.occurred_at)
    .bind(&envelope.payload)
    .bind(meta)
    .execute(executor)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelopes_carry_fresh_ids_and_timestamps() {
        let meta = EventMeta {
            correlation_id: Some("req-1".into()),
            source: "fabric-worker".into(),
            domain_id: None,
        };
        let a = EventEnvelope::new("notification.sent", 1, json!({"id": "n-1"}), meta.clone());
        let b = EventEnvelope::new("notification.sent", 1, json!({"id": "n-1"}), meta);
        assert_ne!(a.id, b.id);
        assert_eq!(a.name, "notification.sent");
        assert_eq!(a.version, 1);
    }

    #[test]
    fn meta_omits_absent_fields() {
        let meta = EventMeta {
            correlation_id: None,
            source: "fabric-worker".into(),
            domain_id: None,
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value, json!({"source": "fabric-worker"}));
    }
}
