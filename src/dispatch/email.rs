/// Email over SMTP with STARTTLS (port 587 by default).
///
/// `lettre`'s blocking transport runs inside `spawn_blocking`; a new
/// connection is opened per message, which is fine at escalation volumes.
use super::{Dispatcher, Notification, RecipientDirectory};
use crate::{config::EmailCredentials, error::DeliveryError};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use std::sync::Arc;
use std::time::Duration;

pub struct EmailTransport {
    creds:     EmailCredentials,
    timeout:   Duration,
    directory: Arc<RecipientDirectory>,
}

impl EmailTransport {
    pub fn new(creds: EmailCredentials, timeout: Duration, directory: Arc<RecipientDirectory>) -> Self {
        Self { creds, timeout, directory }
    }
}

pub(crate) fn build_email(sender: &str, recipient: &str, n: &Notification<'_>) -> Result<Message, DeliveryError> {
    let from: Mailbox = sender
        .parse()
        .map_err(|e| DeliveryError::Smtp(format!("invalid sender address {:?}: {}", sender, e)))?;
    let to: Mailbox = recipient
        .parse()
        .map_err(|e| DeliveryError::Smtp(format!("invalid recipient address {:?}: {}", recipient, e)))?;

    Message::builder()
        .from(from)
        .to(to)
        .subject(n.subject())
        .header(ContentType::TEXT_PLAIN)
        .body(n.message())
        .map_err(|e| DeliveryError::Smtp(format!("failed to build email: {}", e)))
}

#[async_trait]
impl Dispatcher for EmailTransport {
    async fn dispatch(&self, n: &Notification<'_>) -> Result<(), DeliveryError> {
        let recipient = self.directory.require(&n.path.recipient, n.issue)?;
        let email     = build_email(&self.creds.sender, &recipient, n)?;
        let creds     = self.creds.clone();
        let timeout   = self.timeout;
        let key       = n.issue.key.clone();

        tokio::task::spawn_blocking(move || {
            let mailer = SmtpTransport::starttls_relay(&creds.smtp_server)
                .map_err(|e| DeliveryError::Smtp(format!("invalid SMTP server: {}", e)))?
                .port(creds.smtp_port)
                .credentials(Credentials::new(creds.sender.clone(), creds.password.clone()))
                .timeout(Some(timeout))
                .build();

            mailer
                .send(&email)
                .map_err(|e| DeliveryError::Smtp(e.to_string()))?;

            tracing::info!("Sent email to {} about {}", recipient, key);
            Ok::<(), DeliveryError>(())
        })
        .await
        .map_err(|e| DeliveryError::Task(e.to_string()))?
    }
}
