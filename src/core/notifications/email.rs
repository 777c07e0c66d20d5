use super::{Notifier, RunNotification, collect_failures};
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, warn};

/// Sends one plain-text mail per recipient through an SMTP relay (implicit TLS).
pub struct EmailNotifier {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    from: String,
}

impl EmailNotifier {
    pub fn new(
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        from: String,
    ) -> Self {
        let credentials = username.map(|user| Credentials::new(user, password.unwrap_or_default()));
        Self {
            host,
            port,
            credentials,
            from,
        }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.host)
            .with_context(|| format!("SMTP relay error for {}", self.host))?
            .port(self.port);
        if let Some(credentials) = &self.credentials {
            builder = builder.credentials(credentials.clone());
        }
        Ok(builder.build())
    }

    fn build_message(&self, to: &str, notification: &RunNotification) -> Result<Message> {
        Message::builder()
            .from(self.from.parse::<Mailbox>().context("Bad from address")?)
            .to(to.parse::<Mailbox>().with_context(|| format!("Bad to address {:?}", to))?)
            .subject(notification.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(notification.body())
            .context("Failed to build message")
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, notification: &RunNotification) -> Result<()> {
        let transport = self.transport()?;
        let mut failures = Vec::new();

        for recipient in &notification.recipients {
            let recipient = recipient.trim();
            let sent = match self.build_message(recipient, notification) {
                Ok(message) => transport.send(message).await.map_err(anyhow::Error::from),
                Err(e) => Err(e),
            };

            match sent {
                Ok(_) => debug!(to = %recipient, "Notification email sent"),
                Err(e) => {
                    warn!(to = %recipient, error = %e, "Failed to send notification email");
                    failures.push(format!("{}: {:#}", recipient, e));
                }
            }
        }

        collect_failures(failures)
    }
}
