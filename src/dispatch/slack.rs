/// Slack direct message: open (or reuse) the IM channel with the recipient,
/// then post the message into it.
///
/// Slack answers HTTP 200 even on failure; the `ok` / `error` fields in the
/// body are what count.
use super::{Dispatcher, Notification, RecipientDirectory};
use crate::{error::DeliveryError, http};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

const SLACK_API: &str = "https://slack.com/api";

pub struct SlackTransport {
    agent:     ureq::Agent,
    token:     String,
    directory: Arc<RecipientDirectory>,
}

impl SlackTransport {
    pub fn new(agent: ureq::Agent, token: String, directory: Arc<RecipientDirectory>) -> Self {
        Self { agent, token, directory }
    }

    fn call(agent: &ureq::Agent, url: &str, auth: &str, body: &Value) -> Result<Value, DeliveryError> {
        let raw = http::post_json(agent, url, Some(auth), body).map_err(DeliveryError::Http)?;
        parse_response(&raw)
    }
}

/// Decode a Slack Web API response, turning `ok: false` into an error.
fn parse_response(raw: &str) -> Result<Value, DeliveryError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| DeliveryError::Http(format!("invalid Slack response: {}", e)))?;
    if value["ok"].as_bool() == Some(true) {
        Ok(value)
    } else {
        let reason = value["error"].as_str().unwrap_or("unknown error");
        Err(DeliveryError::Rejected(format!("slack: {}", reason)))
    }
}

fn channel_id(open_response: &Value) -> Result<String, DeliveryError> {
    open_response["channel"]["id"]
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| DeliveryError::Rejected("slack: conversations.open returned no channel".to_owned()))
}

#[async_trait]
impl Dispatcher for SlackTransport {
    async fn dispatch(&self, n: &Notification<'_>) -> Result<(), DeliveryError> {
        let user  = self.directory.require(&n.path.recipient, n.issue)?;
        let text  = n.message();
        let agent = self.agent.clone();
        let auth  = http::bearer(&self.token);
        let key   = n.issue.key.clone();

        tokio::task::spawn_blocking(move || {
            let opened = Self::call(
                &agent,
                &format!("{}/conversations.open", SLACK_API),
                &auth,
                &json!({ "users": user }),
            )?;
            let channel = channel_id(&opened)?;
            Self::call(
                &agent,
                &format!("{}/chat.postMessage", SLACK_API),
                &auth,
                &json!({ "channel": channel, "text": text }),
            )?;
            tracing::info!("Sent Slack DM to {} about {}", user, key);
            Ok::<(), DeliveryError>(())
        })
        .await
        .map_err(|e| DeliveryError::Task(e.to_string()))?
    }
}
