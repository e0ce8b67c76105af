// src/alerts.rs
//! Webhook alert sink. Best-effort by contract: the control loop never
//! blocks on or branches over delivery outcome, so every failure is logged
//! and swallowed here.

use tracing::{debug, error, warn};

/// Cheap to clone; the inner `reqwest::Client` is reference-counted.
#[derive(Debug, Clone)]
pub struct AlertSink {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl AlertSink {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }

    /// Posts `{"content": "Chamber <id> <status>"}` to the webhook. Returns
    /// whether delivery succeeded (204-equivalent response). With no webhook
    /// configured this is a no-op returning false.
    pub async fn notify(&self, chamber: &str, new_status: &str) -> bool {
        let Some(url) = &self.webhook_url else {
            debug!("No alert webhook configured, dropping alert for chamber {}", chamber);
            return false;
        };

        let payload = serde_json::json!({
            "content": format!("Chamber {} {}", chamber, new_status),
        });

        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(
                    "Alert webhook returned {} for chamber {}",
                    response.status(),
                    chamber
                );
                false
            }
            Err(e) => {
                error!("Error sending alert webhook: {}", e);
                false
            }
        }
    }

    /// Fire-and-forget variant for callers that must not await delivery.
    pub fn notify_detached(&self, chamber: impl Into<String>, new_status: impl Into<String>) {
        let sink = self.clone();
        let chamber = chamber.into();
        let new_status = new_status.into();
        tokio::spawn(async move {
            if !sink.notify(&chamber, &new_status).await {
                debug!("Alert for chamber {} was not delivered", chamber);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_sink_reports_failure_without_sending() {
        let sink = AlertSink::new(None);
        assert!(!sink.notify("chamber1", "DISABLED").await);
    }

    #[tokio::test]
    async fn unreachable_webhook_is_swallowed() {
        // Nothing listens here; delivery fails but never panics or errors out.
        let sink = AlertSink::new(Some("http://127.0.0.1:9/webhook".to_string()));
        assert!(!sink.notify("chamber1", "DISABLED").await);
    }
}
