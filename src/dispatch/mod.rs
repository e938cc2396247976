pub mod email;
pub mod jira_comment;
pub mod pagerduty;
pub mod slack;

/// Notification dispatch, the boundary between "decided to escalate" and
/// "actually told someone".
///
/// The engine hands one `Notification` per escalation path to a `Dispatcher`
/// and only cares whether it returned `Ok`. `Router` is the production
/// dispatcher: it forwards to the transport registered for the path kind.
/// Kinds whose credentials are missing are simply not registered and fail
/// with `DeliveryError::NotConfigured`.
use crate::{
    config::{AppConfig, Credentials},
    error::DeliveryError,
    jira::{Issue, JiraClient},
    rules::{
        template::{self, TemplateFields},
        EscalationPath, PathKind, Recipient, RecipientToken, Rule,
    },
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// One escalation path's worth of work, as handed to a transport.
#[derive(Debug, Clone)]
pub struct Notification<'a> {
    pub rule:  &'a Rule,
    pub path:  &'a EscalationPath,
    pub issue: &'a Issue,
    /// Rendered `message_template`; `None` when the path has none.
    pub body:  Option<String>,
}

impl<'a> Notification<'a> {
    pub fn fields(&self) -> TemplateFields<'a> {
        template_fields(self.rule, self.issue)
    }

    /// The rendered body, or the default rendering when the path has no
    /// template of its own.
    pub fn message(&self) -> String {
        match &self.body {
            Some(body) => body.clone(),
            None       => template::default_message(&self.fields()),
        }
    }

    pub fn subject(&self) -> String {
        format!("Issue Escalation: {} - {}", self.issue.key, self.issue.summary)
    }
}

pub fn template_fields<'a>(rule: &'a Rule, issue: &'a Issue) -> TemplateFields<'a> {
    TemplateFields {
        issue_key:                  &issue.key,
        issue_summary:              &issue.summary,
        issue_assignee:             issue.assignee.as_deref(),
        status:                     &issue.status,
        time_in_status_minutes:     issue.time_in_status_minutes,
        max_time_in_status_minutes: rule.max_time_in_status_minutes,
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, notification: &Notification<'_>) -> Result<(), DeliveryError>;
}

// ---------------------------------------------------------------------------
// Recipient resolution
// ---------------------------------------------------------------------------

/// Maps semantic tokens (and assignee display names) to transport addresses.
#[derive(Debug, Clone, Default)]
pub struct RecipientDirectory {
    entries: HashMap<String, String>,
}

impl RecipientDirectory {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// `Ok(None)` only for `Recipient::None`.
    pub fn resolve(&self, recipient: &Recipient, issue: &Issue) -> Result<Option<String>, DeliveryError> {
        match recipient {
            Recipient::None       => Ok(None),
            Recipient::Address(a) => Ok(Some(a.clone())),
            Recipient::Token(RecipientToken::Assignee) => {
                let assignee = issue
                    .assignee
                    .as_deref()
                    .ok_or_else(|| DeliveryError::UnresolvedRecipient(format!("assignee of {}", issue.key)))?;
                Ok(Some(
                    self.entries
                        .get(assignee)
                        .cloned()
                        .unwrap_or_else(|| assignee.to_owned()),
                ))
            }
            Recipient::Token(token) => self
                .entries
                .get(token.as_str())
                .cloned()
                .map(Some)
                .ok_or_else(|| DeliveryError::UnresolvedRecipient(token.as_str().to_owned())),
        }
    }

    /// Like `resolve`, for transports that cannot deliver to nobody.
    pub fn require(&self, recipient: &Recipient, issue: &Issue) -> Result<String, DeliveryError> {
        self.resolve(recipient, issue)?
            .ok_or_else(|| DeliveryError::UnresolvedRecipient("(none)".to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Default, Clone)]
pub struct Router {
    transports: HashMap<PathKind, Arc<dyn Dispatcher>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: PathKind, transport: Arc<dyn Dispatcher>) {
        self.transports.insert(kind, transport);
    }

    pub fn is_configured(&self, kind: PathKind) -> bool {
        self.transports.contains_key(&kind)
    }

    /// Register every transport whose credentials are present.
    pub fn from_credentials(cfg: &AppConfig, creds: &Credentials, jira: Option<&JiraClient>) -> Self {
        let directory = Arc::new(RecipientDirectory::new(cfg.recipients.clone()));
        let agent     = crate::http::agent(cfg.http_timeout());
        let mut router = Router::new();

        if let Some(client) = jira {
            router.register(
                PathKind::JiraComment,
                Arc::new(jira_comment::JiraCommentTransport::new(client.clone(), directory.clone())),
            );
        }
        if let Some(token) = &creds.slack_token {
            router.register(
                PathKind::SlackDm,
                Arc::new(slack::SlackTransport::new(agent.clone(), token.clone(), directory.clone())),
            );
        }
        if let Some(key) = &creds.pagerduty_routing_key {
            let mut transport = pagerduty::PagerDutyTransport::new(agent.clone(), key.clone(), directory.clone());
            if let Some(api) = &creds.pagerduty_api {
                transport = transport.with_assignment(api.clone());
            }
            router.register(PathKind::Pagerduty, Arc::new(transport));
        }
        if let Some(email) = &creds.email {
            router.register(
                PathKind::Email,
                Arc::new(email::EmailTransport::new(email.clone(), cfg.http_timeout(), directory.clone())),
            );
        }

        for kind in PathKind::ALL {
            if !router.is_configured(kind) {
                tracing::info!("Escalation path {} is not configured; its deliveries will fail", kind);
            }
        }
        router
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn dispatch(&self, notification: &Notification<'_>) -> Result<(), DeliveryError> {
        let kind = notification.path.kind;
        match self.transports.get(&kind) {
            Some(transport) => transport.dispatch(notification).await,
            None            => Err(DeliveryError::NotConfigured(kind)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    pub(crate) fn issue(assignee: Option<&str>) -> Issue {
        Issue {
            key:                    "OPS-42".to_owned(),
            summary:                "Deploy pipeline flaky".to_owned(),
            status:                 "In Review".to_owned(),
            assignee:               assignee.map(str::to_owned),
            time_in_status_minutes: 95.0,
        }
    }

    pub(crate) fn rule(kind: PathKind, recipient: &str) -> Rule {
        Rule {
            name:                       "Stale review".to_owned(),
            query:                      "status = 'In Review'".to_owned(),
            max_time_in_status_minutes: 60.0,
            level:                      1,
            days_to_activate:           0,
            description:                String::new(),
            escalation_paths:           vec![EscalationPath {
                kind,
                recipient:        Recipient::parse(recipient),
                message_template: None,
            }],
        }
    }

    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl Dispatcher for Recording {
        async fn dispatch(&self, n: &Notification<'_>) -> Result<(), DeliveryError> {
            self.0.lock().unwrap().push(n.message());
            Ok(())
        }
    }

    #[test]
    fn resolves_recipients() {
        let dir = RecipientDirectory::new(
            [
                ("manager_username".to_owned(), "U0MGR".to_owned()),
                ("Jane Doe".to_owned(), "U0JANE".to_owned()),
            ]
            .into_iter()
            .collect(),
        );
        let jane = issue(Some("Jane Doe"));
        let bob  = issue(Some("Bob"));

        let assignee = Recipient::Token(RecipientToken::Assignee);
        assert_eq!(dir.resolve(&assignee, &jane).unwrap().as_deref(), Some("U0JANE"));
        assert_eq!(dir.resolve(&assignee, &bob).unwrap().as_deref(), Some("Bob"));
        assert!(dir.resolve(&assignee, &issue(None)).is_err());

        let mgr = Recipient::Token(RecipientToken::ManagerUsername);
        assert_eq!(dir.require(&mgr, &bob).unwrap(), "U0MGR");
        let pm = Recipient::Token(RecipientToken::ProjectManager);
        assert!(matches!(dir.resolve(&pm, &bob), Err(DeliveryError::UnresolvedRecipient(_))));

        assert_eq!(dir.resolve(&Recipient::None, &bob).unwrap(), None);
        assert!(dir.require(&Recipient::None, &bob).is_err());
    }

    #[test]
    fn message_falls_back_to_default_rendering() {
        let rule  = rule(PathKind::SlackDm, "U1");
        let issue = issue(None);
        let n = Notification { rule: &rule, path: &rule.escalation_paths[0], issue: &issue, body: None };
        assert!(n.message().contains("Max time allowed: 60 minutes"));
        assert_eq!(n.subject(), "Issue Escalation: OPS-42 - Deploy pipeline flaky");

        let n = Notification { body: Some("custom".to_owned()), ..n };
        assert_eq!(n.message(), "custom");
    }

    #[tokio::test]
    async fn router_forwards_by_kind() {
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let mut router = Router::new();
        router.register(PathKind::SlackDm, recording.clone());

        let slack = rule(PathKind::SlackDm, "U1");
        let email = rule(PathKind::Email, "ops@example.com");
        let issue = issue(None);

        let n = Notification { rule: &slack, path: &slack.escalation_paths[0], issue: &issue, body: Some("hi".into()) };
        router.dispatch(&n).await.unwrap();
        assert_eq!(*recording.0.lock().unwrap(), vec!["hi".to_owned()]);

        let n = Notification { rule: &email, path: &email.escalation_paths[0], issue: &issue, body: None };
        assert!(matches!(
            router.dispatch(&n).await,
            Err(DeliveryError::NotConfigured(PathKind::Email))
        ));
    }
}
