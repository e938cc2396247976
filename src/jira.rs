/// Issue source: the query side of the issue tracker.
///
/// The engine only sees the `IssueSource` trait: "give me the issues matching
/// this query, with how long each has sat in its current status". `JiraClient`
/// is the production implementation over the Jira REST API v2.
///
/// Time in status is derived from the issue changelog: the most recent
/// transition *into* the current status. Without one the earliest status change
/// is used, and an issue that never changed status counts from its creation.
use crate::{
    config::JiraCredentials,
    error::{DeliveryError, QueryError},
    http,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Issue {
    pub key:                    String,
    pub summary:                String,
    pub status:                 String,
    pub assignee:               Option<String>,
    pub time_in_status_minutes: f64,
}

#[async_trait]
pub trait IssueSource: Send + Sync {
    /// Issues matching `query`, in the tracker's order. Time in status is
    /// measured up to `now`.
    async fn find_issues(&self, query: &str, now: DateTime<Utc>) -> Result<Vec<Issue>, QueryError>;
}

// ---------------------------------------------------------------------------
// REST payloads (private)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    total:  u64,
    #[serde(default)]
    issues: Vec<JiraIssue>,
}

#[derive(Deserialize)]
struct JiraIssue {
    key:       String,
    fields:    JiraFields,
    #[serde(default)]
    changelog: Option<Changelog>,
}

#[derive(Deserialize)]
struct JiraFields {
    #[serde(default)]
    summary:  Option<String>,
    status:   JiraStatus,
    #[serde(default)]
    assignee: Option<JiraUser>,
    #[serde(default)]
    created:  Option<String>,
}

#[derive(Deserialize)]
struct JiraStatus {
    name: String,
}

#[derive(Deserialize)]
struct JiraUser {
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
    #[serde(default)]
    name:         Option<String>,
}

#[derive(Deserialize, Default)]
struct Changelog {
    #[serde(default)]
    histories: Vec<ChangeGroup>,
}

#[derive(Deserialize)]
struct ChangeGroup {
    created: String,
    #[serde(default)]
    items:   Vec<ChangeItem>,
}

#[derive(Deserialize)]
struct ChangeItem {
    field:     String,
    #[serde(rename = "toString", default)]
    to_status: Option<String>,
}

const PAGE_SIZE: u64 = 100;

// ---------------------------------------------------------------------------
// Time in status
// ---------------------------------------------------------------------------

/// Jira timestamps look like `2024-03-01T09:00:00.000+0000`.
pub(crate) fn parse_jira_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Minutes since the issue last entered `current_status`.
///
/// `transitions` are (timestamp, target status) pairs in any order. With no
/// transition into the current status the clock starts at the earliest
/// status change, and with no status changes at all, at creation.
pub(crate) fn minutes_in_status(
    transitions:    &[(DateTime<Utc>, String)],
    current_status: &str,
    created:        Option<DateTime<Utc>>,
    now:            DateTime<Utc>,
) -> f64 {
    let entered = transitions
        .iter()
        .filter(|(_, to)| to == current_status)
        .map(|(at, _)| *at)
        .max()
        .or_else(|| transitions.iter().map(|(at, _)| *at).min())
        .or(created);

    match entered {
        Some(at) => (now.signed_duration_since(at).num_milliseconds().max(0) as f64) / 60_000.0,
        None     => 0.0,
    }
}

impl JiraIssue {
    fn into_issue(self, now: DateTime<Utc>) -> Issue {
        let transitions: Vec<(DateTime<Utc>, String)> = self
            .changelog
            .unwrap_or_default()
            .histories
            .into_iter()
            .flat_map(|group| {
                let at = parse_jira_time(&group.created);
                group
                    .items
                    .into_iter()
                    .filter(|item| item.field == "status")
                    .filter_map(move |item| Some((at?, item.to_status?)))
            })
            .collect();

        let created = self.fields.created.as_deref().and_then(parse_jira_time);
        if created.is_none() && transitions.is_empty() {
            tracing::warn!("{}: no creation date or status history; treating as 0 minutes in status", self.key);
        }

        let status = self.fields.status.name;
        let time_in_status_minutes = minutes_in_status(&transitions, &status, created, now);

        Issue {
            key:      self.key,
            summary:  self.fields.summary.unwrap_or_default(),
            status,
            assignee: self
                .fields
                .assignee
                .and_then(|a| a.display_name.or(a.name)),
            time_in_status_minutes,
        }
    }
}

// ---------------------------------------------------------------------------
// JiraClient
// ---------------------------------------------------------------------------

/// Blocking Jira REST client; cheap to clone.
#[derive(Clone)]
pub struct JiraClient {
    agent:    ureq::Agent,
    base_url: String,
    auth:     String,
}

impl JiraClient {
    pub fn new(creds: &JiraCredentials, timeout: Duration) -> Self {
        Self {
            agent:    http::agent(timeout),
            base_url: creds.url.trim_end_matches('/').to_owned(),
            auth:     http::basic_auth(&creds.username, &creds.api_token),
        }
    }

    fn search_page(&self, jql: &str, start_at: u64) -> Result<SearchPage, QueryError> {
        let url = format!("{}/rest/api/2/search", self.base_url);
        let body = self
            .agent
            .get(&url)
            .set("Authorization", &self.auth)
            .set("Accept", "application/json")
            .query("jql", jql)
            .query("startAt", &start_at.to_string())
            .query("maxResults", &PAGE_SIZE.to_string())
            .query("fields", "summary,status,assignee,created")
            .query("expand", "changelog")
            .call()
            .map_err(|e| QueryError::Http(http::describe(e)))?
            .into_string()
            .map_err(|e| QueryError::Http(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| QueryError::Decode(e.to_string()))
    }

    /// Every issue matching `jql`, following pagination.
    pub fn search_blocking(&self, jql: &str, now: DateTime<Utc>) -> Result<Vec<Issue>, QueryError> {
        let mut issues   = Vec::new();
        let mut start_at = 0u64;

        loop {
            let page    = self.search_page(jql, start_at)?;
            let fetched = page.issues.len() as u64;
            let total   = page.total;
            issues.extend(page.issues.into_iter().map(|i| i.into_issue(now)));

            start_at += fetched;
            if fetched == 0 || start_at >= total {
                break;
            }
        }

        tracing::debug!("JQL {:?} matched {} issues", jql, issues.len());
        Ok(issues)
    }

    pub fn add_comment_blocking(&self, issue_key: &str, body: &str) -> Result<(), DeliveryError> {
        let url = format!("{}/rest/api/2/issue/{}/comment", self.base_url, issue_key);
        http::post_json(&self.agent, &url, Some(&self.auth), &serde_json::json!({ "body": body }))
            .map(|_| ())
            .map_err(DeliveryError::Http)
    }
}

#[async_trait]
impl IssueSource for JiraClient {
    async fn find_issues(&self, query: &str, now: DateTime<Utc>) -> Result<Vec<Issue>, QueryError> {
        let client = self.clone();
        let query  = query.to_owned();
        tokio::task::spawn_blocking(move || client.search_blocking(&query, now))
            .await
            .map_err(|e| QueryError::Task(e.to_string()))?
    }
}
