//! Campaign status notifications
//!
//! Lifecycle events (finished, auto-paused, cancelled) are always logged,
//! fanned out to in-process subscribers, and optionally POSTed to a
//! configured webhook with an HMAC-SHA256 payload signature. Notification
//! failures never propagate into the engine.

use hmac::{Hmac, Mac};
use listmill_common::config::NotificationConfig;
use serde::Serialize;
use sha2::Sha256;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Signature header on webhook deliveries
pub const SIGNATURE_HEADER: &str = "X-Listmill-Signature";

/// A campaign lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CampaignEvent {
    Finished {
        campaign_id: i64,
        name: String,
    },
    Paused {
        campaign_id: i64,
        name: String,
        reason: String,
    },
    Cancelled {
        campaign_id: i64,
        name: String,
        reason: String,
    },
}

/// Event fan-out: log line + in-process subscribers + optional webhook
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<CampaignEvent>>>,
}

impl Notifier {
    /// Create a notifier from configuration
    pub fn new(config: &NotificationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            webhook_url: config.webhook_url.clone(),
            webhook_secret: config.webhook_secret.clone(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Receive a copy of every future event
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CampaignEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Emit one event
    pub async fn notify(&self, event: CampaignEvent) {
        match &event {
            CampaignEvent::Finished { campaign_id, name } => {
                info!(campaign_id, name = %name, "Campaign finished");
            }
            CampaignEvent::Paused {
                campaign_id,
                name,
                reason,
            } => {
                info!(campaign_id, name = %name, reason = %reason, "Campaign paused");
            }
            CampaignEvent::Cancelled {
                campaign_id,
                name,
                reason,
            } => {
                info!(campaign_id, name = %name, reason = %reason, "Campaign cancelled");
            }
        }

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }

        if let Some(url) = &self.webhook_url {
            self.post_webhook(url, &event).await;
        }
    }

    async fn post_webhook(&self, url: &str, event: &CampaignEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to serialize notification: {}", e);
                return;
            }
        };

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.webhook_secret {
            request = request.header(SIGNATURE_HEADER, sign_payload(secret, &payload));
        }

        match request.body(payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "Notification webhook rejected"),
            Err(e) => warn!("Notification webhook failed: {}", e),
        }
    }
}

/// Hex HMAC-SHA256 of the payload under the shared secret
fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
