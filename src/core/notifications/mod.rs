mod email;
mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};

pub use email::EmailNotifier;
pub use webhook::WebhookNotifier;

/// Outcome of a finished run, addressed to the job's recipients.
#[derive(Debug, Clone)]
pub struct RunNotification {
    pub job_name: String,
    pub recipients: Vec<String>,
    pub success: bool,
    pub detail: String,
}

impl RunNotification {
    pub fn subject(&self) -> &'static str {
        if self.success {
            "Backup Completed"
        } else {
            "Backup Failed"
        }
    }

    pub fn body(&self) -> String {
        let summary = if self.success {
            "Your backup has completed successfully."
        } else {
            "Your backup has failed."
        };
        format!("{}\n\nJob: {}\n{}", summary, self.job_name, self.detail)
    }
}

/// Trait for notification channel implementations (email, webhook, ...)
///
/// Implementations attempt every recipient even when an earlier one fails,
/// and return an error summarising the failures. Callers log it; a failed
/// notification never affects the run.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &RunNotification) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn Notifier>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Email => {
            let host = config.smtp_host.as_ref().filter(|h| !h.is_empty())?;
            let from = config.from_address.as_ref().filter(|f| !f.is_empty())?;
            Some(Arc::new(EmailNotifier::new(
                host.clone(),
                config.smtp_port,
                config.smtp_username.clone(),
                config.smtp_password.clone(),
                from.clone(),
            )))
        }
        NotificationChannelType::Webhook => {
            let url = config.webhook_url.as_ref().filter(|u| !u.is_empty())?;
            Some(Arc::new(WebhookNotifier::new(url.clone())))
        }
    }
}

/// Join per-recipient failures into one error, if there were any.
fn collect_failures(failures: Vec<String>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    anyhow::bail!(
        "{} notification(s) failed:\n{}",
        failures.len(),
        failures
            .iter()
            .map(|f| format!("  - {}", f))
            .collect::<Vec<_>>()
            .join("\n")
    )
}
