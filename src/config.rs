/// Run configuration: a JSON (or TOML) document plus environment credentials.
///
/// The document carries the rules and run-wide settings:
///   escalate.json
///   {
///     "escalation_cooldown_hours": 24,
///     "history_file": "escalation_history.sqlite",
///     "rules": [ ... ]
///   }
///
/// Credentials for the issue tracker and every transport come from the
/// environment only, so the document can be committed alongside the crontab.
///
/// NOTE: rule documents are loose (`Option` everywhere). Strict
/// validation happens in `rules::build_rules`, which can then report *which*
/// field is missing instead of a bare serde error.
use crate::{
    error::ConfigError,
    rules::{self, Rule},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Raw document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathDocument {
    #[serde(rename = "type")]
    pub path_type:        Option<String>,
    pub recipient:        Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleDocument {
    pub name:                       Option<String>,
    pub jql:                        Option<String>,
    pub max_time_in_status_minutes: Option<f64>,
    pub level:                      Option<i64>,
    pub days_to_activate:           Option<i64>,
    pub description:                Option<String>,
    pub escalation_paths:           Option<Vec<PathDocument>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Minimum hours between two firings of the same (issue, rule, level).
    #[serde(default = "default_cooldown_hours")]
    pub escalation_cooldown_hours: f64,

    /// SQLite file holding escalation history. Relative paths resolve against
    /// the config file's directory.
    #[serde(default = "default_history_file")]
    pub history_file: PathBuf,

    /// Timeout applied to every issue-tracker and transport request.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// Directory for the rolling log file. Unset = stderr only.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Directory used to resolve semantic recipient tokens such as
    /// `manager_username` to a concrete address.
    #[serde(default)]
    pub recipients: HashMap<String, String>,

    #[serde(default)]
    pub rules: Vec<RuleDocument>,
}

fn default_cooldown_hours() -> f64 { 24.0 }
fn default_history_file() -> PathBuf { PathBuf::from("escalation_history.sqlite") }
fn default_http_timeout_secs() -> u64 { 30 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            escalation_cooldown_hours: default_cooldown_hours(),
            history_file:              default_history_file(),
            http_timeout_secs:         default_http_timeout_secs(),
            log_dir:                   None,
            recipients:                HashMap::new(),
            rules:                     Vec::new(),
        }
    }
}

impl AppConfig {
    /// Validated rules in configuration order.
    pub fn rules(&self) -> Result<Vec<Rule>, ConfigError> {
        rules::build_rules(&self.rules)
    }

    pub fn cooldown(&self) -> Result<Duration, ConfigError> {
        let hours = self.escalation_cooldown_hours;
        if !hours.is_finite() || hours < 0.0 {
            return Err(ConfigError::Parse(format!(
                "escalation_cooldown_hours must be >= 0 (got {})",
                hours
            )));
        }
        Ok(Duration::milliseconds((hours * 3_600_000.0).round() as i64))
    }

    pub fn http_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse the config document at `path`. `.toml` files are parsed as
/// TOML, anything else as JSON. A relative `history_file` is anchored to the
/// document's directory so cron's working directory does not matter.
pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut cfg = parse(&raw, is_toml(path))?;

    if cfg.history_file.is_relative() {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            cfg.history_file = dir.join(&cfg.history_file);
        }
    }

    tracing::debug!(
        "Loaded config {:?}: {} rules, cooldown {}h, history {:?}",
        path,
        cfg.rules.len(),
        cfg.escalation_cooldown_hours,
        cfg.history_file
    );
    Ok(cfg)
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

fn parse(raw: &str, toml_format: bool) -> Result<AppConfig, ConfigError> {
    if toml_format {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    } else {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Environment credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiraCredentials {
    pub url:       String,
    pub username:  String,
    pub api_token: String,
}

/// REST API access used to assign triggered incidents to a person.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagerDutyApiCredentials {
    pub api_key:    String,
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailCredentials {
    pub sender:      String,
    pub password:    String,
    pub smtp_server: String,
    pub smtp_port:   u16,
}

/// Everything read from the environment. A transport whose credentials are
/// missing stays `None` and is simply not registered.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub jira:                  Option<JiraCredentials>,
    pub slack_token:           Option<String>,
    pub pagerduty_routing_key: Option<String>,
    pub pagerduty_api:         Option<PagerDutyApiCredentials>,
    pub email:                 Option<EmailCredentials>,
    pub sumo_endpoint_url:     Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jira = match (get("JIRA_URL"), get("JIRA_USERNAME"), get("JIRA_API_TOKEN")) {
            (Some(url), Some(username), Some(api_token)) => Some(JiraCredentials {
                url: url.trim_end_matches('/').to_owned(),
                username,
                api_token,
            }),
            _ => None,
        };

        let pagerduty_api = match (get("PAGERDUTY_API_KEY"), get("PAGERDUTY_SERVICE_ID")) {
            (Some(api_key), Some(service_id)) => Some(PagerDutyApiCredentials { api_key, service_id }),
            _ => None,
        };

        let email = match (get("EMAIL_SENDER"), get("EMAIL_PASSWORD")) {
            (Some(sender), Some(password)) => {
                let smtp_port = match get("EMAIL_SMTP_PORT").map(|p| p.parse::<u16>()) {
                    Some(Ok(port)) => port,
                    Some(Err(e)) => {
                        tracing::warn!("EMAIL_SMTP_PORT is not a port number ({}); using 587", e);
                        587
                    }
                    None => 587,
                };
                Some(EmailCredentials {
                    sender,
                    password,
                    smtp_server: get("EMAIL_SMTP_SERVER").unwrap_or_else(|| "smtp.gmail.com".to_owned()),
                    smtp_port,
                })
            }
            _ => None,
        };

        Self {
            jira,
            slack_token:           get("SLACK_TOKEN"),
            pagerduty_routing_key: get("PAGERDUTY_ROUTING_KEY"),
            pagerduty_api,
            email,
            sumo_endpoint_url:     get("SUMO_ENDPOINT_URL"),
        }
    }

    pub fn require_jira(&self) -> Result<&JiraCredentials, ConfigError> {
        self.jira.as_ref().ok_or_else(|| {
            ConfigError::MissingCredentials(
                "JIRA_URL, JIRA_USERNAME and JIRA_API_TOKEN must be set".to_owned(),
            )
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "escalation_cooldown_hours": 12,
        "history_file": "state/history.sqlite",
        "recipients": { "manager_username": "U0MANAGER" },
        "rules": [
            {
                "name": "Stale review",
                "jql": "project = TEST AND status = 'In Review'",
                "max_time_in_status_minutes": 60,
                "level": 1,
                "days_to_activate": 0,
                "description": "Test description",
                "escalation_paths": [
                    { "type": "jira_comment", "recipient": "username" },
                    { "type": "slack_dm", "recipient": "manager_username",
                      "message_template": "{issue_key} stuck in {status}" }
                ]
            }
        ]
    }"#;

    #[test]
    fn loads_json_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("escalate.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.escalation_cooldown_hours, 12.0);
        assert_eq!(cfg.history_file, dir.path().join("state/history.sqlite"));
        assert_eq!(cfg.recipients["manager_username"], "U0MANAGER");
        assert_eq!(cfg.http_timeout_secs, 30);

        let rules = cfg.rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "Stale review");
        assert_eq!(rules[0].query, "project = TEST AND status = 'In Review'");
        assert_eq!(rules[0].escalation_paths.len(), 2);
        assert_eq!(cfg.cooldown().unwrap(), Duration::hours(12));
    }

    #[test]
    fn loads_toml_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("escalate.toml");
        std::fs::write(
            &path,
            r#"
escalation_cooldown_hours = 1.5
history_file = "/var/lib/escalate/history.sqlite"

[[rules]]
name = "Unassigned bug"
jql = "type = Bug AND assignee is EMPTY"
max_time_in_status_minutes = 30

[[rules.escalation_paths]]
type = "email"
recipient = "triage@example.com"
"#,
        )
        .unwrap();

        let cfg = load(&path).unwrap();
        assert_eq!(cfg.history_file, PathBuf::from("/var/lib/escalate/history.sqlite"));
        assert_eq!(cfg.cooldown().unwrap(), Duration::minutes(90));
        let rules = cfg.rules().unwrap();
        assert_eq!(rules[0].level, 1);
    }

    #[test]
    fn defaults_when_fields_absent() {
        let cfg = parse("{}", false).unwrap();
        assert_eq!(cfg.escalation_cooldown_hours, 24.0);
        assert_eq!(cfg.history_file, PathBuf::from("escalation_history.sqlite"));
        assert!(cfg.rules.is_empty());
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn reports_unreadable_and_unparsable_files() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ \"rules\": [").unwrap();
        assert!(matches!(load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_negative_cooldown() {
        let cfg = AppConfig { escalation_cooldown_hours: -1.0, ..AppConfig::default() };
        assert!(cfg.cooldown().is_err());
    }

    #[test]
    fn reads_credentials_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("JIRA_URL", "https://jira.example.com/"),
            ("JIRA_USERNAME", "bot"),
            ("JIRA_API_TOKEN", "secret"),
            ("SLACK_TOKEN", "xoxb-1"),
            ("EMAIL_SENDER", "bot@example.com"),
            ("EMAIL_PASSWORD", "pw"),
            ("EMAIL_SMTP_PORT", "2525"),
            ("PAGERDUTY_ROUTING_KEY", "  "),
            ("PAGERDUTY_API_KEY", "u+key"),
            ("PAGERDUTY_SERVICE_ID", "PSVC123"),
        ]
        .into_iter()
        .collect();

        let creds = Credentials::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        let jira = creds.require_jira().unwrap();
        assert_eq!(jira.url, "https://jira.example.com");
        assert_eq!(creds.slack_token.as_deref(), Some("xoxb-1"));
        assert!(creds.pagerduty_routing_key.is_none());
        let pd = creds.pagerduty_api.unwrap();
        assert_eq!(pd.service_id, "PSVC123");
        let email = creds.email.unwrap();
        assert_eq!(email.smtp_port, 2525);
        assert_eq!(email.smtp_server, "smtp.gmail.com");
        assert!(creds.sumo_endpoint_url.is_none());
    }

    #[test]
    fn missing_jira_credentials_are_a_config_error() {
        let creds = Credentials::from_lookup(|_| None);
        assert!(matches!(creds.require_jira(), Err(ConfigError::MissingCredentials(_))));
    }
}
