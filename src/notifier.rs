//! Alerting for platforms that exhausted their connection retries

use serde::Serialize;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::Result;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Alert channel for operators
#[cfg_attr(test, mockall::automock)]
pub trait Notifier: Send + Sync {
    /// Report that a platform gave up after `limit` retries spaced `delay_secs` apart
    fn send_connection_failure_alert(&self, platform: &str, limit: u32, delay_secs: u64);
}

/// Notifier writing alerts to the log only
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_connection_failure_alert(&self, platform: &str, limit: u32, delay_secs: u64) {
        error!(
            platform = %platform,
            retry_limit = limit,
            retry_delay_secs = delay_secs,
            "Connection retries exhausted, platform marked failed"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionFailureAlert {
    platform: String,
    retry_limit: u32,
    retry_delay_secs: u64,
    message: String,
    timestamp: String,
}

/// Notifier POSTing a JSON alert to a webhook
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }
}

impl Notifier for WebhookNotifier {
    fn send_connection_failure_alert(&self, platform: &str, limit: u32, delay_secs: u64) {
        error!(platform = %platform, retry_limit = limit, "Connection retries exhausted, sending alert");

        let alert = ConnectionFailureAlert {
            platform: platform.to_string(),
            retry_limit: limit,
            retry_delay_secs: delay_secs,
            message: format!(
                "Could not connect to {} after {} retries at {}s intervals",
                platform, limit, delay_secs
            ),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let client = self.client.clone();
        let url = self.url.clone();

        tokio::spawn(async move {
            match client.post(&url).json(&alert).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(platform = %alert.platform, "Connection failure alert delivered");
                }
                Ok(response) => {
                    warn!(platform = %alert.platform, status = %response.status(), "Alert webhook rejected alert");
                }
                Err(e) => {
                    warn!(platform = %alert.platform, error = %e, "Failed to deliver alert");
                }
            }
        });
    }
}
