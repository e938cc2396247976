/// PagerDuty Events API v2. Triggers an alert on the service behind the
/// routing key.
///
/// The dedup key is per issue, so repeated escalations of the same issue (any
/// level) update one open incident instead of paging afresh. The configured
/// recipient travels in `custom_details.escalate_to`. When REST API
/// credentials are available the triggered incident is then assigned to that
/// recipient; assignment is best effort and never fails the path.
use super::{Dispatcher, Notification, RecipientDirectory};
use crate::{config::PagerDutyApiCredentials, error::DeliveryError, http};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

const EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";
const REST_API: &str = "https://api.pagerduty.com";
const REST_ACCEPT: &str = "application/vnd.pagerduty+json;version=2";

pub struct PagerDutyTransport {
    agent:       ureq::Agent,
    routing_key: String,
    directory:   Arc<RecipientDirectory>,
    assigner:    Option<Assigner>,
}

impl PagerDutyTransport {
    pub fn new(agent: ureq::Agent, routing_key: String, directory: Arc<RecipientDirectory>) -> Self {
        Self { agent, routing_key, directory, assigner: None }
    }

    /// Assign each triggered incident to the path's recipient.
    pub fn with_assignment(mut self, creds: PagerDutyApiCredentials) -> Self {
        self.assigner = Some(Assigner { agent: self.agent.clone(), creds });
        self
    }
}

fn dedup_key(issue_key: &str) -> String {
    format!("escalate-{}", issue_key)
}

// ---------------------------------------------------------------------------
// Incident assignment (REST API v2)
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Assigner {
    agent: ureq::Agent,
    creds: PagerDutyApiCredentials,
}

pub(crate) fn assignment_body(user_id: &str) -> Value {
    json!({
        "incident": {
            "type": "incident_reference",
            "assignments": [
                { "assignee": { "id": user_id, "type": "user_reference" } }
            ]
        }
    })
}

/// `id` (and `email`, for users) of the first entry of a list response.
fn first_entry(response: &Value, collection: &str) -> Option<(String, Option<String>)> {
    let entry = response[collection].as_array()?.first()?;
    let id    = entry["id"].as_str()?.to_owned();
    Some((id, entry["email"].as_str().map(str::to_owned)))
}

impl Assigner {
    fn auth(&self) -> String {
        format!("Token token={}", self.creds.api_key)
    }

    fn list(&self, collection: &str, query: &[(&str, &str)]) -> Result<Value, String> {
        let mut request = self
            .agent
            .get(&format!("{}/{}", REST_API, collection))
            .set("Authorization", &self.auth())
            .set("Accept", REST_ACCEPT);
        for (key, value) in query {
            request = request.query(key, value);
        }
        let raw = request
            .call()
            .map_err(http::describe)?
            .into_string()
            .map_err(|e| e.to_string())?;
        serde_json::from_str(&raw).map_err(|e| format!("invalid {} response: {}", collection, e))
    }

    /// Find the open incident for `issue_key` and the user matching
    /// `recipient`, then assign one to the other.
    fn assign(&self, issue_key: &str, recipient: &str) -> Result<(), String> {
        let incident_key = dedup_key(issue_key);
        let incidents = self.list(
            "incidents",
            &[
                ("incident_key", incident_key.as_str()),
                ("service_ids[]", self.creds.service_id.as_str()),
                ("statuses[]", "triggered"),
                ("statuses[]", "acknowledged"),
            ],
        )?;
        let (incident_id, _) = first_entry(&incidents, "incidents")
            .ok_or_else(|| format!("no open incident for {}", issue_key))?;

        let users = self.list("users", &[("query", recipient)])?;
        let (user_id, email) = first_entry(&users, "users")
            .ok_or_else(|| format!("no PagerDuty user matches {:?}", recipient))?;

        let mut request = self
            .agent
            .put(&format!("{}/incidents/{}", REST_API, incident_id))
            .set("Authorization", &self.auth())
            .set("Accept", REST_ACCEPT)
            .set("Content-Type", "application/json");
        if let Some(from) = email.as_deref() {
            request = request.set("From", from);
        }
        request
            .send_string(&assignment_body(&user_id).to_string())
            .map_err(http::describe)?;
        Ok(())
    }
}

/// Higher chain levels page louder.
fn severity(level: u32) -> &'static str {
    match level {
        0 | 1 => "warning",
        2     => "error",
        _     => "critical",
    }
}

pub(crate) fn build_event(routing_key: &str, n: &Notification<'_>, recipient: Option<&str>) -> Value {
    json!({
        "routing_key":  routing_key,
        "event_action": "trigger",
        "dedup_key":    dedup_key(&n.issue.key),
        "payload": {
            "summary":   format!("Escalation for {}: {}", n.issue.key, n.issue.summary),
            "source":    "escalate",
            "severity":  severity(n.rule.level),
            "component": "jira",
            "group":     "Issue Escalation",
            "class":     "issue",
            "custom_details": {
                "issue_key":              n.issue.key,
                "issue_summary":          n.issue.summary,
                "status":                 n.issue.status,
                "time_in_status_minutes": n.issue.time_in_status_minutes,
                "max_time_allowed":       n.rule.max_time_in_status_minutes,
                "rule_name":              n.rule.name,
                "level":                  n.rule.level,
                "jql":                    n.rule.query,
                "escalate_to":            recipient,
                "message":                n.message(),
            }
        }
    })
}

#[async_trait]
impl Dispatcher for PagerDutyTransport {
    async fn dispatch(&self, n: &Notification<'_>) -> Result<(), DeliveryError> {
        let recipient = self.directory.resolve(&n.path.recipient, n.issue)?;
        let event     = build_event(&self.routing_key, n, recipient.as_deref());
        let agent     = self.agent.clone();
        let assigner  = self.assigner.clone();
        let key       = n.issue.key.clone();

        tokio::task::spawn_blocking(move || {
            let raw = http::post_json(&agent, EVENTS_URL, None, &event).map_err(DeliveryError::Http)?;
            let response: Value = serde_json::from_str(&raw).unwrap_or(Value::Null);
            if response["status"].as_str() != Some("success") {
                return Err(DeliveryError::Rejected(format!("pagerduty: {}", raw.trim())));
            }
            tracing::info!("Triggered PagerDuty alert for {}", key);

            if let (Some(assigner), Some(recipient)) = (assigner, recipient) {
                match assigner.assign(&key, &recipient) {
                    Ok(()) => tracing::info!("Assigned PagerDuty incident for {} to {}", key, recipient),
                    Err(e) => tracing::error!("Failed to assign PagerDuty incident for {}: {}", key, e),
                }
            }
            Ok::<(), DeliveryError>(())
        })
        .await
        .map_err(|e| DeliveryError::Task(e.to_string()))?
    }
}
