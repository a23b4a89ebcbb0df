//! Webhook delivery to the subscribers registered for a policy.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use octopolicy_core::{PolicyChangeEvent, Subscriber};
use octopolicy_storage::DynStorage;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::NotificationError;
use crate::transport::NotificationTransport;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature-256";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared secret for the `X-Signature-256` header. Unsigned when absent.
    pub secret: Option<String>,
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            timeout_ms: 5000,
        }
    }
}

impl WebhookConfig {
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// Body posted to a subscriber's webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(flatten)]
    pub event: PolicyChangeEvent,
    pub subscriber: String,
}

pub struct WebhookTransport {
    http_client: Client,
    storage: DynStorage,
    secret: Option<String>,
}

impl WebhookTransport {
    pub fn new(storage: DynStorage, config: WebhookConfig) -> Result<Self, NotificationError> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NotificationError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            http_client,
            storage,
            secret: config.secret,
        })
    }

    async fn deliver(
        &self,
        subscriber: &Subscriber,
        event: &PolicyChangeEvent,
    ) -> Result<(), NotificationError> {
        let payload = serde_json::to_string(&WebhookPayload {
            event: event.clone(),
            subscriber: subscriber.name.clone(),
        })?;

        let mut request = self
            .http_client
            .post(&subscriber.webhook_url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            let signature = sign_payload(&payload, secret)?;
            request = request.header(SIGNATURE_HEADER, format!("sha256={signature}"));
        }

        let response = request
            .body(payload)
            .send()
            .await
            .map_err(|e| NotificationError::send_failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NotificationError::Rejected {
                url: subscriber.webhook_url.clone(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign_payload(payload: &str, secret: &str) -> Result<String, NotificationError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| NotificationError::InvalidConfig(e.to_string()))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[async_trait]
impl NotificationTransport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    /// Posts to every subscriber of the policy. One failed delivery does not
    /// skip the rest; the call fails if any delivery failed.
    async fn send(&self, event: &PolicyChangeEvent) -> Result<(), NotificationError> {
        let subscribers = self.storage.get_subscribers(&event.policy).await?;
        let mut failed = 0;

        for subscriber in &subscribers {
            match self.deliver(subscriber, event).await {
                Ok(()) => debug!(
                    policy = %event.policy,
                    subscriber = %subscriber.name,
                    url = %subscriber.webhook_url,
                    "Delivered change notification"
                ),
                Err(e) => {
                    failed += 1;
                    warn!(
                        policy = %event.policy,
                        subscriber = %subscriber.name,
                        url = %subscriber.webhook_url,
                        error = %e,
                        "Webhook delivery failed"
                    );
                }
            }
        }

        if failed > 0 {
            return Err(NotificationError::send_failed(format!(
                "{failed} of {} webhook deliveries failed",
                subscribers.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_and_keyed() {
        let a = sign_payload(r#"{"test": "data"}"#, "secret123").unwrap();
        let b = sign_payload(r#"{"test": "data"}"#, "secret123").unwrap();
        let c = sign_payload(r#"{"test": "data"}"#, "other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_payload_carries_identity_and_subscriber() {
        let event = PolicyChangeEvent::lock(octopolicy_core::PolicyId::new("r", "g", "n", "1"));
        let json = serde_json::to_value(WebhookPayload {
            event,
            subscriber: "audit".into(),
        })
        .unwrap();
        assert_eq!(json["repository"], "r");
        assert_eq!(json["kind"], "lock");
        assert_eq!(json["subscriber"], "audit");
    }
}
