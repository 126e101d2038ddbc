//! Chat webhook channel (Slack-compatible incoming webhooks).

use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;

use tally_common::error::AppError;
use tally_engine::notifications::NotificationContent;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookMessage {
    /// Plain-text fallback, also used for chat notifications.
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks: Option<serde_json::Value>,
}

impl WebhookMessage {
    /// Title in bold followed by the body.
    pub fn from_content(content: &NotificationContent) -> Self {
        let text = format!("*{}*\n{}", content.title, content.body);
        let mut blocks = vec![json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": text },
        })];
        if let Some(url) = content
            .data
            .as_ref()
            .and_then(|d| d.get("url"))
            .and_then(|u| u.as_str())
        {
            blocks.push(json!({
                "type": "context",
                "elements": [{ "type": "mrkdwn", "text": url }],
            }));
        }

        Self {
            text,
            blocks: Some(serde_json::Value::Array(blocks)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WebhookReport {
    pub sent_count: usize,
    pub failed_count: usize,
}

#[derive(Clone)]
pub struct WebhookChannel {
    client: Client,
}

impl WebhookChannel {
    pub fn new() -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(format!("webhook client init failed: {}", e)))?;
        Ok(Self { client })
    }

    /// POST `message` to `url`. Returns whether the target accepted it.
    pub async fn send(&self, url: &str, message: &WebhookMessage) -> bool {
        let url = url.trim();
        if url.is_empty() {
            return false;
        }

        match self.client.post(url).json(message).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "Webhook rejected message");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Webhook request failed");
                false
            }
        }
    }

    /// Send to every target concurrently; one failure does not affect others.
    pub async fn send_to_many(&self, urls: &[String], message: &WebhookMessage) -> WebhookReport {
        let results = join_all(urls.iter().map(|url| self.send(url, message))).await;

        let sent_count = results.iter().filter(|ok| **ok).count();
        WebhookReport {
            sent_count,
            failed_count: results.len() - sent_count,
        }
    }
}
