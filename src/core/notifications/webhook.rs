use super::{Notifier, RunNotification, collect_failures};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

/// Posts a JSON document per recipient to an HTTP endpoint (for example a
/// mail relay or chat bridge that fans messages out).
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, recipient: &str, notification: &RunNotification) -> serde_json::Value {
        json!({
            "to": recipient,
            "subject": notification.subject(),
            "text": notification.body(),
            "job": notification.job_name,
            "success": notification.success,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &RunNotification) -> Result<()> {
        let mut failures = Vec::new();

        for recipient in &notification.recipients {
            let payload = self.format_message(recipient, notification);
            let sent = self
                .client
                .post(&self.url)
                .json(&payload)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match sent {
                Ok(_) => debug!(to = %recipient, "Webhook notification sent"),
                Err(e) => {
                    warn!(to = %recipient, error = %e, "Webhook notification failed");
                    failures.push(format!("{}: {}", recipient, e));
                }
            }
        }

        collect_failures(failures)
    }
}
