//! Alert sender implementations.

use async_trait::async_trait;
use quarry_core::materialize::RefreshAlert;
use quarry_core::ports::AlertSink;
use quarry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

/// Generic JSON webhook alerter (operations channels, incident intake).
pub struct WebhookAlerter {
    url: String,
    client: reqwest::Client,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlerter {
    async fn alert(&self, alert: &RefreshAlert) -> Result<()> {
        debug!(url = %self.url, node = %alert.node, "delivering refresh alert");
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| Error::AlertDelivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::AlertDelivery(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_icon")]
    pub icon_emoji: String,
}

fn default_username() -> String {
    "quarry-refresher".to_string()
}

fn default_icon() -> String {
    ":warning:".to_string()
}

/// Slack incoming-webhook alerter.
pub struct SlackAlerter {
    config: SlackConfig,
    client: reqwest::Client,
}

impl SlackAlerter {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_message(&self, alert: &RefreshAlert) -> serde_json::Value {
        let mut fields = vec![
            serde_json::json!({"title": "Node", "value": alert.node, "short": true}),
            serde_json::json!({"title": "Run", "value": alert.run_id.to_string(), "short": true}),
        ];
        if let Some(ref validation) = alert.validation {
            fields.push(serde_json::json!({
                "title": "Rows (expected / actual)",
                "value": format!("{} / {}", validation.expected_rows, validation.actual_rows),
                "short": true
            }));
        }

        serde_json::json!({
            "username": self.config.username,
            "icon_emoji": self.config.icon_emoji,
            "attachments": [{
                "color": "#dc3545",
                "title": format!("Refresh failed: {}", alert.node),
                "text": alert.detail,
                "fields": fields,
                "ts": alert.occurred_at.timestamp()
            }]
        })
    }
}

#[async_trait]
impl AlertSink for SlackAlerter {
    async fn alert(&self, alert: &RefreshAlert) -> Result<()> {
        debug!(node = %alert.node, "delivering refresh alert to Slack");
        let message = self.build_message(alert);
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&message)
            .send()
            .await
            .map_err(|e| Error::AlertDelivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::AlertDelivery(format!(
                "slack returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Fallback sink when no channel is configured: the alert still reaches
/// the structured log at error level.
#[derive(Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn alert(&self, alert: &RefreshAlert) -> Result<()> {
        error!(
            node = %alert.node,
            run_id = %alert.run_id,
            detail = %alert.detail,
            "refresh cascade failure"
        );
        Ok(())
    }
}
