//! Webhook Notifier
//!
//! Best-effort delivery of job and batch events to registered HTTP
//! listeners.
//!
//! Each delivery POSTs a JSON body
//!
//! ```text
//! { "event": "batch.completed", "timestamp": "<RFC 3339>", "data": { ... } }
//! ```
//!
//! When the listener registered a secret, the body is signed with
//! HMAC-SHA256 and the hex digest sent in `X-Webhook-Signature`. A status
//! below 400 is success. Failed deliveries are retried with exponential
//! backoff (`base_delay * 2^attempt`) and then logged. Nothing here ever
//! fails a job or a batch.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::backend::http_client;
use crate::clock::SharedClock;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC-SHA256 of the body
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the event name
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Event names fired by the batch scheduler
pub mod events {
    /// A job finished with a result
    pub const JOB_COMPLETED: &str = "job.completed";
    /// A job exhausted every backend
    pub const JOB_FAILED: &str = "job.failed";
    /// Every job in a batch completed
    pub const BATCH_COMPLETED: &str = "batch.completed";
    /// A batch finished with at least one failed job
    pub const BATCH_PARTIAL: &str = "batch.partial";
    /// Listener pattern matching every event
    pub const ANY: &str = "*";
}

/// Delivery settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Attempts per listener per event
    pub max_attempts: u32,
    /// Delay before the first retry; doubles after each
    pub base_delay: Duration,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Rejected registration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WebhookError {
    /// URL did not parse or is not http(s)
    #[error("invalid webhook url '{0}'")]
    InvalidUrl(String),
    /// Event name was empty
    #[error("webhook event name must not be empty")]
    EmptyEvent,
}

/// A registered listener
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRegistration {
    /// Registration identifier
    pub id: String,
    /// Event name, or `*` for all
    pub event: String,
    /// Target URL
    pub url: String,
    /// Signing secret
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// When the listener was registered
    pub created_at: DateTime<Utc>,
}

impl WebhookRegistration {
    fn matches(&self, event: &str) -> bool {
        self.event == events::ANY || self.event == event
    }
}

/// Registration acknowledgement
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookAck {
    /// Registration identifier
    pub id: String,
    /// Event name
    pub event: String,
    /// Target URL
    pub url: String,
    /// Whether deliveries are signed
    pub signed: bool,
}

/// Body sent to listeners
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Event name
    pub event: String,
    /// RFC 3339 time the event fired
    pub timestamp: String,
    /// Event data
    pub data: serde_json::Value,
}

/// Outcome of one `trigger`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Listeners matching the event
    pub listeners: usize,
    /// Listeners that acknowledged
    pub delivered: usize,
}

/// Hex HMAC-SHA256 of `body` under `secret`
#[must_use]
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Check a hex signature against `body` in constant time
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Webhook registry and sender
pub struct Notifier {
    config: WebhookConfig,
    clock: SharedClock,
    http_client: reqwest::Client,
    listeners: RwLock<Vec<WebhookRegistration>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("config", &self.config)
            .field("listeners", &self.listeners.read().len())
            .finish_non_exhaustive()
    }
}

impl Notifier {
    /// Create a notifier with no listeners
    pub fn new(config: WebhookConfig, clock: SharedClock) -> Self {
        let http_client = http_client(config.timeout);
        Self {
            config,
            clock,
            http_client,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Delivery settings
    #[must_use]
    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Register a listener for `event` (or `*`)
    pub fn register(
        &self,
        event: &str,
        url: &str,
        secret: Option<&str>,
    ) -> Result<WebhookAck, WebhookError> {
        let event = event.trim();
        if event.is_empty() {
            return Err(WebhookError::EmptyEvent);
        }
        let parsed = reqwest::Url::parse(url).map_err(|_| WebhookError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(WebhookError::InvalidUrl(url.to_string()));
        }

        let registration = WebhookRegistration {
            id: format!("wh_{}", uuid::Uuid::new_v4().simple()),
            event: event.to_string(),
            url: url.to_string(),
            secret: secret.filter(|s| !s.is_empty()).map(str::to_string),
            created_at: self.clock.now(),
        };
        let ack = WebhookAck {
            id: registration.id.clone(),
            event: registration.event.clone(),
            url: registration.url.clone(),
            signed: registration.secret.is_some(),
        };

        tracing::info!(webhook_id = %ack.id, event = %ack.event, url = %ack.url, "Webhook registered");
        self.listeners.write().push(registration);
        Ok(ack)
    }

    /// Remove a listener
    pub fn unregister(&self, id: &str) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Registered listeners
    #[must_use]
    pub fn listeners(&self) -> Vec<WebhookRegistration> {
        self.listeners.read().clone()
    }

    /// Deliver an event to every matching listener
    pub async fn trigger(&self, event: &str, data: serde_json::Value) -> DeliveryReport {
        let targets: Vec<WebhookRegistration> = self
            .listeners
            .read()
            .iter()
            .filter(|l| l.matches(event))
            .cloned()
            .collect();
        if targets.is_empty() {
            return DeliveryReport::default();
        }

        let payload = WebhookPayload {
            event: event.to_string(),
            timestamp: self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        };
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(event = %event, error = %e, "Failed to encode webhook payload");
                return DeliveryReport {
                    listeners: targets.len(),
                    delivered: 0,
                };
            }
        };

        let results = join_all(targets.iter().map(|l| self.deliver(l, event, &body))).await;
        DeliveryReport {
            listeners: targets.len(),
            delivered: results.into_iter().filter(|ok| *ok).count(),
        }
    }

    async fn deliver(&self, listener: &WebhookRegistration, event: &str, body: &[u8]) -> bool {
        let signature = listener.secret.as_deref().map(|s| sign_payload(s, body));
        let attempts = self.config.max_attempts.max(1);

        for attempt in 0..attempts {
            let mut request = self
                .http_client
                .post(&listener.url)
                .timeout(self.config.timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(EVENT_HEADER, event)
                .body(body.to_vec());
            if let Some(ref sig) = signature {
                request = request.header(SIGNATURE_HEADER, sig);
            }

            match request.send().await {
                Ok(response) if response.status().as_u16() < 400 => {
                    tracing::debug!(webhook_id = %listener.id, event = %event, attempt, "Webhook delivered");
                    return true;
                }
                Ok(response) => {
                    tracing::warn!(
                        webhook_id = %listener.id,
                        event = %event,
                        attempt,
                        status = %response.status(),
                        "Webhook rejected"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        webhook_id = %listener.id,
                        event = %event,
                        attempt,
                        error = %e,
                        "Webhook delivery failed"
                    );
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.base_delay * 2u32.saturating_pow(attempt)).await;
            }
        }

        tracing::error!(
            webhook_id = %listener.id,
            event = %event,
            url = %listener.url,
            attempts,
            "Webhook delivery gave up"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notifier() -> Notifier {
        Notifier::new(
            WebhookConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                timeout: Duration::from_secs(2),
            },
            Arc::new(ManualClock::starting_now()),
        )
    }

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"event":"job.completed"}"#;
        let sig = sign_payload("s", body);
        assert_eq!(sig.len(), 64);
        assert!(verify_signature("s", body, &sig));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("s", b"tampered", &sig));
        assert!(!verify_signature("s", body, "not-hex"));
    }

    #[test]
    fn test_register_validates() {
        let n = notifier();
        assert_eq!(
            n.register("job.completed", "ftp://example.com", None),
            Err(WebhookError::InvalidUrl("ftp://example.com".to_string()))
        );
        assert_eq!(n.register("  ", "http://example.com", None), Err(WebhookError::EmptyEvent));

        let ack = n.register("job.completed", "http://example.com/hook", Some("s")).unwrap();
        assert!(ack.signed);
        assert_eq!(n.listeners().len(), 1);
        assert!(n.unregister(&ack.id));
        assert!(n.listeners().is_empty());
    }

    #[tokio::test]
    async fn test_signed_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let n = notifier();
        n.register("batch.completed", &format!("{}/hook", server.uri()), Some("s"))
            .unwrap();
        let report = n
            .trigger("batch.completed", serde_json::json!({"batch_id": "b1"}))
            .await;
        assert_eq!(report, DeliveryReport { listeners: 1, delivered: 1 });

        let received = server.received_requests().await.unwrap();
        let request = &received[0];
        let signature = request
            .headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(verify_signature("s", &request.body, signature));

        let payload: WebhookPayload = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(payload.event, "batch.completed");
        assert_eq!(payload.data["batch_id"], "b1");
        assert!(DateTime::parse_from_rfc3339(&payload.timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let n = notifier();
        n.register("*", &server.uri(), None).unwrap();
        let report = n.trigger("job.failed", serde_json::json!({})).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let n = notifier();
        n.register("job.completed", &server.uri(), None).unwrap();
        let report = n.trigger("job.completed", serde_json::json!({})).await;
        assert_eq!(report, DeliveryReport { listeners: 1, delivered: 0 });
    }

    #[tokio::test]
    async fn test_slow_receiver_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let n = Notifier::new(
            WebhookConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                timeout: Duration::from_millis(50),
            },
            Arc::new(ManualClock::starting_now()),
        );
        n.register("job.completed", &server.uri(), None).unwrap();
        let report = n.trigger("job.completed", serde_json::json!({})).await;
        assert_eq!(report, DeliveryReport { listeners: 1, delivered: 0 });
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unmatched_event_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let n = notifier();
        n.register("batch.partial", &server.uri(), None).unwrap();
        let report = n.trigger("job.completed", serde_json::json!({})).await;
        assert_eq!(report.listeners, 0);
    }
}
