use core::time::Duration;

use async_trait::async_trait;
use feectl::node::{ClientError, Notifier};
use feectl::SendSync;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::*;
use url::Url;

use crate::convert::status_error;

/// Where alerts are posted
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// The webhook URL, e.g. a Slack incoming webhook
    pub url: String,
    /// Request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// Posts alerts as `{"text": ...}` to a webhook
#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    http: Client,
    url: Url,
    timeout_secs: u64,
}

impl SendSync for WebhookNotifier {}

impl WebhookNotifier {
    /// Create a notifier
    pub fn new(config: &WebhookConfig) -> Result<Self, ClientError> {
        let url = Url::parse(&config.url)
            .map_err(|e| ClientError::Rejected(format!("invalid webhook url: {}", e)))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        Ok(WebhookNotifier { http, url, timeout_secs: config.timeout_secs })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_alert(&self, message: &str) -> Result<(), ClientError> {
        let res = self
            .http
            .post(self.url.clone())
            .json(&json!({ "text": message }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout(self.timeout_secs)
                } else {
                    ClientError::Transport(e.to_string())
                }
            })?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!("webhook refused alert: {}", status);
            return Err(status_error(status, &body));
        }
        Ok(())
    }
}
