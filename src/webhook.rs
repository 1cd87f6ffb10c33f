//! Order-lifecycle webhook fan-out.
//!
//! Every delivery is best effort: bounded by a timeout, never retried, and
//! never allowed to affect the transition that triggered it. Failures are
//! logged only when diagnostics are enabled.

use crate::{crypto::CryptoService, model::OrderSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRegistration {
    pub url: String,
    pub events: Vec<String>,
    pub registered_at: DateTime<Utc>,
}

/// Process-wide webhook registrations, keyed by subscriber. Registering
/// again under the same subscriber replaces the previous entry.
#[derive(Default)]
pub struct WebhookRegistry {
    inner: RwLock<HashMap<String, WebhookRegistration>>,
}

impl WebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, subscriber_id: &str, registration: WebhookRegistration) {
        self.inner.write().insert(subscriber_id.to_string(), registration);
    }

    pub fn get(&self, subscriber_id: &str) -> Option<WebhookRegistration> {
        self.inner.read().get(subscriber_id).cloned()
    }

    pub fn all(&self) -> Vec<(String, WebhookRegistration)> {
        self.inner.read().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Stable subscriber key derived from the agent's platform profile URL.
pub fn subscriber_id(platform_profile: Option<&str>) -> String {
    match platform_profile {
        Some(profile) if !profile.is_empty() => hex::encode(Sha256::digest(profile.as_bytes())),
        _ => "default".to_string(),
    }
}

/// Matches an event name against the closed pattern grammar:
/// `*`, `<prefix>.*`, or an exact event name.
pub fn matches_event(pattern: &str, event: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event.starts_with(prefix)
            && event[prefix.len()..].starts_with('.');
    }
    pattern == event
}

/// Maps a platform order status to the protocol event vocabulary.
pub fn event_for_status(to_status: &str) -> &'static str {
    match to_status {
        "processing" => "order.confirmed",
        "on-hold" => "order.on_hold",
        "completed" => "order.delivered",
        "cancelled" => "order.cancelled",
        "refunded" => "order.refunded",
        "failed" => "order.failed",
        _ => "order.status_changed",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundNotice {
    pub id: String,
    pub amount: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct WebhookDispatcher {
    registry: Arc<WebhookRegistry>,
    crypto: Arc<CryptoService>,
    client: reqwest::Client,
    delivery_timeout: Duration,
    debug: bool,
}

impl WebhookDispatcher {
    pub fn new(
        registry: Arc<WebhookRegistry>,
        crypto: Arc<CryptoService>,
        delivery_timeout: Duration,
        debug: bool,
    ) -> Self {
        Self {
            registry,
            crypto,
            client: reqwest::Client::new(),
            delivery_timeout,
            debug,
        }
    }

    pub async fn order_status_changed(&self, order: &OrderSnapshot, _from: &str, to: &str) {
        let event = event_for_status(to);
        self.dispatch(event, order, Map::new()).await;
    }

    pub async fn order_refunded(&self, order: &OrderSnapshot, refund: &RefundNotice) {
        let mut extra = Map::new();
        if let Ok(value) = serde_json::to_value(refund) {
            extra.insert("refund".to_string(), value);
        }
        self.dispatch("order.refunded", order, extra).await;
    }

    pub async fn tracking_added(
        &self,
        order: &OrderSnapshot,
        tracking_number: &str,
        tracking_url: &str,
    ) {
        let mut extra = Map::new();
        extra.insert(
            "tracking".to_string(),
            serde_json::json!({
                "tracking_number": tracking_number,
                "tracking_url": tracking_url,
            }),
        );
        self.dispatch("order.shipped", order, extra).await;
    }

    /// Signs the payload and posts it to every registration whose pattern
    /// set matches the event. Delivery failures are swallowed.
    pub async fn dispatch(&self, event: &str, order: &OrderSnapshot, extra: Map<String, Value>) {
        if self.registry.is_empty() {
            return;
        }

        let mut payload = Map::new();
        payload.insert("event".to_string(), Value::String(event.to_string()));
        payload.insert("occurred_at".to_string(), Value::String(Utc::now().to_rfc3339()));
        let Ok(order_value) = serde_json::to_value(order) else {
            return;
        };
        payload.insert("order".to_string(), order_value);
        payload.extend(extra);

        let Ok(body) = serde_json::to_vec(&Value::Object(payload)) else {
            return;
        };
        let signature = self.crypto.sign(&body).unwrap_or_default();

        for (subscriber, registration) in self.registry.all() {
            if !registration.events.iter().any(|p| matches_event(p, event)) {
                continue;
            }

            let result = self
                .client
                .post(&registration.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header("X-UCP-Event", event)
                .header("X-UCP-Signature", signature.as_str())
                .header("X-UCP-Key-ID", self.crypto.key_id())
                .timeout(self.delivery_timeout)
                .body(body.clone())
                .send()
                .await;

            match result {
                Err(err) if self.debug => {
                    tracing::warn!(subscriber = %subscriber, url = %registration.url, "webhook delivery error: {err}");
                }
                Ok(response) if !response.status().is_success() && self.debug => {
                    tracing::warn!(
                        subscriber = %subscriber,
                        url = %registration.url,
                        status = %response.status(),
                        "webhook delivery failed"
                    );
                }
                _ => {}
            }
        }
    }
}
