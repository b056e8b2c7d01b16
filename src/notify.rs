//! # Operator Notifications
//!
//! Sent when a run is paused by a critical failure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use crate::config::NotifyConfig;

const MAX_ATTEMPTS: u32 = 3;

/// What the operator is told about a paused run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorAlert {
    pub subject: String,
    pub run_id: String,
    pub error: String,
    /// Entities of the run still waiting to be synchronized
    pub affected: u64,
}

impl OperatorAlert {
    pub fn run_paused(run_id: &str, error: &str, affected: u64) -> Self {
        Self {
            subject: format!("Sync run {run_id} paused"),
            run_id: run_id.to_string(),
            error: error.to_string(),
            affected,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid operator webhook URL: {0}")]
    InvalidUrl(String),
    #[error("operator webhook failed after {attempts} attempts: {reason}")]
    Delivery { attempts: u32, reason: String },
    #[error("HTTP client setup failed: {0}")]
    ClientSetup(String),
}

/// Delivery channel for operator alerts.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &OperatorAlert) -> Result<(), NotifyError>;
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &OperatorAlert) -> Result<(), NotifyError> {
        error!(
            run_id = %alert.run_id,
            affected = alert.affected,
            error = %alert.error,
            "{}",
            alert.subject
        );
        Ok(())
    }
}

/// Posts alerts as JSON to an HTTPS endpoint, retrying with backoff.
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    initial_delay: Duration,
}

impl WebhookNotifier {
    pub fn new(webhook_url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        if webhook_url.len() > 2048 {
            return Err(NotifyError::InvalidUrl("URL exceeds 2048 characters".into()));
        }
        let url = Url::parse(webhook_url).map_err(|e| NotifyError::InvalidUrl(e.to_string()))?;
        if url.scheme() != "https" && !is_loopback(&url) {
            return Err(NotifyError::InvalidUrl(format!(
                "{} must use https",
                redacted_target(&url)
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::ClientSetup(e.to_string()))?;

        Ok(Self {
            client,
            url,
            initial_delay: Duration::from_secs(1),
        })
    }

    /// Overrides the first backoff step.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    fn build_payload(alert: &OperatorAlert) -> serde_json::Value {
        json!({
            "subject": alert.subject,
            "run_id": alert.run_id,
            "error": alert.error,
            "affected_entities": alert.affected,
            "service": "printsync",
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &OperatorAlert) -> Result<(), NotifyError> {
        let payload = Self::build_payload(alert);
        let target = redacted_target(&self.url);
        let mut delay = self.initial_delay;
        let mut last_failure = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.post(self.url.clone()).json(&payload).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(
                        run_id = %alert.run_id,
                        target = %target,
                        attempt,
                        "Operator notified"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    warn!(
                        run_id = %alert.run_id,
                        target = %target,
                        attempt,
                        status = %response.status(),
                        "Operator webhook rejected alert"
                    );
                    last_failure = format!("status {}", response.status());
                }
                Err(e) => {
                    warn!(
                        run_id = %alert.run_id,
                        target = %target,
                        attempt,
                        error = %e,
                        "Operator webhook unreachable"
                    );
                    last_failure = e.to_string();
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(NotifyError::Delivery {
            attempts: MAX_ATTEMPTS,
            reason: last_failure,
        })
    }
}

/// Builds the configured channel: webhook when a URL is set, log otherwise.
pub fn from_config(
    config: &NotifyConfig,
    timeout: Duration,
) -> Result<std::sync::Arc<dyn Notifier>, NotifyError> {
    match &config.operator_webhook_url {
        Some(url) => Ok(std::sync::Arc::new(WebhookNotifier::new(url, timeout)?)),
        None => Ok(std::sync::Arc::new(LogNotifier)),
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(url.host_str(), Some("127.0.0.1") | Some("localhost"))
}

fn redacted_target(url: &Url) -> String {
    format!("{}://{}", url.scheme(), url.host_str().unwrap_or("unknown"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_payload_carries_run_and_count() {
        let alert = OperatorAlert::run_paused("run_1", "401 from vendor", 7);
        let payload = WebhookNotifier::build_payload(&alert);

        assert_eq!(payload["subject"], "Sync run run_1 paused");
        assert_eq!(payload["run_id"], "run_1");
        assert_eq!(payload["error"], "401 from vendor");
        assert_eq!(payload["affected_entities"], 7);
    }

    #[test]
    fn plain_http_targets_are_rejected() {
        let result = WebhookNotifier::new("http://hooks.example.com/x", Duration::from_secs(1));
        assert!(matches!(result, Err(NotifyError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        let alert = OperatorAlert::run_paused("run_2", "db down", 0);
        assert!(LogNotifier.notify(&alert).await.is_ok());
    }
}
