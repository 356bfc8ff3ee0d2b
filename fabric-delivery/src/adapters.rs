//! Delivery adapters.
//!
//! Adapters return a discriminated [`SendOutcome`] rather than raising:
//! the dispatcher's control flow never depends on exceptions from
//! external calls. Email and push providers are external collaborators;
//! the webhook adapter ships in-tree because it is plain HTTP.

use std::time;

use async_trait::async_trait;
use http::StatusCode;
use reqwest::header;
use serde_json::Value;
use uuid::Uuid;

use crate::notification::{Channel, Notification};

/// What an adapter is asked to deliver.
#[derive(Debug, Clone)]
pub struct SendMessage {
    pub notification_id: Uuid,
    pub org_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub template: String,
    pub payload: Value,
}

impl SendMessage {
    pub fn from_notification(notification: &Notification) -> Self {
        Self {
            notification_id: notification.id,
            org_id: notification.org_id.clone(),
            user_id: notification.user_id.clone(),
            channel: notification.channel,
            template: notification.template.clone(),
            payload: notification.payload.clone(),
        }
    }
}

/// Discriminated delivery result.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent {
        /// Provider-side id, when the provider returns one.
        provider_id: Option<String>,
    },
    Failed {
        reason: String,
        /// Whether a later attempt could plausibly succeed.
        retryable: bool,
        /// Upstream Retry-After, when supplied.
        retry_after: Option<time::Duration>,
    },
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

#[async_trait]
pub trait SendAdapter: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, message: &SendMessage) -> SendOutcome;
}

/// Webhook delivery over HTTP POST. The target URL comes from the
/// notification payload (`url` field).
pub struct WebhookAdapter {
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(request_timeout: time::Duration) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Fabric Notification Worker")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for webhook adapter");

        Self { client }
    }
}

#[async_trait]
impl SendAdapter for WebhookAdapter {
    fn channel(&self) -> Channel {
        Channel::Webhook
    }

    async fn send(&self, message: &SendMessage) -> SendOutcome {
        let Some(url) = message.payload.get("url").and_then(Value::as_str) else {
            return SendOutcome::Failed {
                reason: "webhook notification payload has no url".to_owned(),
                retryable: false,
                retry_after: None,
            };
        };

        let body = serde_json::json!({
            "notificationId": message.notification_id,
            "template": message.template,
            "payload": message.payload,
        });

        let response = match self.client.post(url).json(&body).send().await {
            Ok(response) => response,
            Err(error) => {
                // Connection-level failures are worth retrying; anything
                // reqwest rejects before sending (bad URL etc.) is not.
                let retryable = error.is_timeout() || error.is_connect() || error.is_request();
                return SendOutcome::Failed {
                    reason: error.to_string(),
                    retryable,
                    retry_after: None,
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            let provider_id = response
                .headers()
                .get("x-delivery-id")
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);
            return SendOutcome::Sent { provider_id };
        }

        let retry_after = parse_retry_after_header(response.headers());
        SendOutcome::Failed {
            reason: format!("webhook endpoint returned {status}"),
            retryable: is_retryable_status(status),
            retry_after,
        }
    }
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Attempt to parse a duration from a Retry-After header. The header can
/// hold either seconds or an RFC2822 date; dates in the past yield None.
pub fn parse_retry_after_header(header_map: &header::HeaderMap) -> Option<time::Duration> {
    let retry_after = header_map
        .get(header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())?;

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(time::Duration::from_secs(seconds));
    }

    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let until = chrono::DateTime::<chrono::Utc>::from(date) - chrono::Utc::now();
        return until.to_std().ok();
    }

    None
}

/// A sink adapter for channels whose provider is not wired in this
/// process; it refuses every send non-retryably so misconfiguration is
/// visible instead of silently queueing forever.
pub struct UnroutedAdapter {
    channel: Channel,
}

impl UnroutedAdapter {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl SendAdapter for UnroutedAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &SendMessage) -> SendOutcome {
        SendOutcome::Failed {
            reason: format!(
                "no {} provider is configured for notification {}",
                self.channel, message.notification_id
            ),
            retryable: false,
            retry_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(!is_retryable_status(StatusCode::FORBIDDEN));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::RETRY_AFTER, "120".parse().unwrap());
        assert_eq!(
            parse_retry_after_header(&headers),
            Some(time::Duration::from_secs(120))
        );
    }

    #[test]
    fn retry_after_absent_or_stale() {
        let headers = header::HeaderMap::new();
        assert_eq!(parse_retry_after_header(&headers), None);

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::RETRY_AFTER,
            "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after_header(&headers), None);
    }

    #[tokio::test]
    async fn webhook_without_url_fails_non_retryably() {
        let adapter = WebhookAdapter::new(time::Duration::from_secs(5));
        let message = SendMessage {
            notification_id: Uuid::new_v4(),
            org_id: "org-1".into(),
            user_id: "user-1".into(),
            channel: Channel::Webhook,
            template: "digest".into(),
            payload: serde_json::json!({}),
        };
        match adapter.send(&message).await {
            SendOutcome::Failed { retryable, .. } => assert!(!retryable),
            SendOutcome::Sent { .. } => panic!("send without url must fail"),
        }
    }

    #[tokio::test]
    async fn unrouted_channels_fail_terminally() {
        let adapter = UnroutedAdapter::new(Channel::Push);
        let message = SendMessage {
            notification_id: Uuid::new_v4(),
            org_id: "org-1".into(),
            user_id: "user-1".into(),
            channel: Channel::Push,
            template: "digest".into(),
            payload: serde_json::json!({}),
        };
        match adapter.send(&message).await {
            SendOutcome::Failed {
                retryable, reason, ..
            } => {
                assert!(!retryable);
                assert!(reason.contains("push"));
            }
            SendOutcome::Sent { .. } => panic!("unrouted adapter must fail"),
        }
    }
}
