/// Comment on the escalated issue itself. A resolved recipient is mentioned
/// with Jira wiki markup (`[~username]`) so they get notified.
use super::{Dispatcher, Notification, RecipientDirectory};
use crate::{error::DeliveryError, jira::JiraClient};
use async_trait::async_trait;
use std::sync::Arc;

pub struct JiraCommentTransport {
    client:    JiraClient,
    directory: Arc<RecipientDirectory>,
}

impl JiraCommentTransport {
    pub fn new(client: JiraClient, directory: Arc<RecipientDirectory>) -> Self {
        Self { client, directory }
    }
}

pub(crate) fn comment_body(mention: Option<&str>, message: &str) -> String {
    match mention {
        Some(user) => format!("[~{}] {}", user, message),
        None       => message.to_owned(),
    }
}

#[async_trait]
impl Dispatcher for JiraCommentTransport {
    async fn dispatch(&self, n: &Notification<'_>) -> Result<(), DeliveryError> {
        let mention = self.directory.resolve(&n.path.recipient, n.issue)?;
        let body    = comment_body(mention.as_deref(), &n.message());
        let client  = self.client.clone();
        let key     = n.issue.key.clone();

        tokio::task::spawn_blocking(move || {
            client.add_comment_blocking(&key, &body)?;
            tracing::info!("Added escalation comment to {}", key);
            Ok::<(), DeliveryError>(())
        })
        .await
        .map_err(|e| DeliveryError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions_resolved_recipient() {
        assert_eq!(comment_body(Some("jdoe"), "Stuck in review"), "[~jdoe] Stuck in review");
        assert_eq!(comment_body(None, "Stuck in review"), "Stuck in review");
    }
}
