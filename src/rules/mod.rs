pub mod template;

/// Rule model: validated, immutable escalation rules.
///
/// Rules are built from the raw configuration document in one pass. Any
/// invalid rule fails the whole set: a run never evaluates a partial rule set,
/// otherwise one typo would silently switch off an escalation.
///
/// Rules sharing a `name` form a level chain. The pair (name, level) is unique
/// within a configuration and is the namespace used by the history store.
use crate::{
    config::{PathDocument, RuleDocument},
    error::ConfigError,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

// ---------------------------------------------------------------------------
// Transport kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    JiraComment,
    SlackDm,
    Pagerduty,
    Email,
}

impl PathKind {
    pub const ALL: [PathKind; 4] = [
        PathKind::JiraComment,
        PathKind::SlackDm,
        PathKind::Pagerduty,
        PathKind::Email,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PathKind::JiraComment => "jira_comment",
            PathKind::SlackDm     => "slack_dm",
            PathKind::Pagerduty   => "pagerduty",
            PathKind::Email       => "email",
        }
    }

    pub fn parse(raw: &str) -> Option<PathKind> {
        PathKind::ALL.into_iter().find(|k| k.as_str() == raw)
    }

    /// A Jira comment can be posted without anyone to mention; every other
    /// transport needs somebody to deliver to.
    pub fn requires_recipient(&self) -> bool {
        !matches!(self, PathKind::JiraComment)
    }
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Recipients
// ---------------------------------------------------------------------------

/// Semantic recipient tokens, resolved by the dispatch layer from issue
/// metadata or the configured recipient directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecipientToken {
    Assignee,
    ManagerUsername,
    ProjectManager,
}

impl RecipientToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientToken::Assignee        => "assignee",
            RecipientToken::ManagerUsername => "manager_username",
            RecipientToken::ProjectManager  => "project_manager",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Nobody in particular (only valid for Jira comments).
    None,
    /// A concrete transport address: Slack user id, email, Jira username.
    Address(String),
    Token(RecipientToken),
}

impl Recipient {
    pub fn parse(raw: &str) -> Recipient {
        match raw.trim() {
            ""                 => Recipient::None,
            "assignee"         => Recipient::Token(RecipientToken::Assignee),
            "manager_username" => Recipient::Token(RecipientToken::ManagerUsername),
            "project_manager"  => Recipient::Token(RecipientToken::ProjectManager),
            other              => Recipient::Address(other.to_owned()),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::None       => f.write_str("-"),
            Recipient::Address(a) => f.write_str(a),
            Recipient::Token(t)   => f.write_str(t.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Rule + path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationPath {
    pub kind:             PathKind,
    pub recipient:        Recipient,
    pub message_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name:                       String,
    /// Match expression handed verbatim to the issue source.
    pub query:                      String,
    pub max_time_in_status_minutes: f64,
    /// 1-based severity within the rule's name chain.
    pub level:                      u32,
    /// Days after the chain anchor (first level-1 firing) before this level
    /// becomes eligible. Ignored for level 1.
    pub days_to_activate:           u32,
    pub description:                String,
    pub escalation_paths:           Vec<EscalationPath>,
}

impl Rule {
    /// Validate one raw rule document.
    pub fn from_document(doc: &RuleDocument, index: usize) -> Result<Rule, ConfigError> {
        let name = match doc.name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_owned(),
            _ => {
                return Err(ConfigError::MissingField {
                    rule:  format!("#{}", index + 1),
                    field: "name".to_owned(),
                })
            }
        };

        let missing = |field: &str| ConfigError::MissingField {
            rule:  name.clone(),
            field: field.to_owned(),
        };
        let malformed = |reason: String| ConfigError::MalformedRule {
            rule: name.clone(),
            reason,
        };

        let query = doc.jql.clone().ok_or_else(|| missing("jql"))?;
        if query.trim().is_empty() {
            return Err(malformed("jql is empty".to_owned()));
        }

        let max_time = doc
            .max_time_in_status_minutes
            .ok_or_else(|| missing("max_time_in_status_minutes"))?;
        if !max_time.is_finite() || max_time < 0.0 {
            return Err(malformed(format!(
                "max_time_in_status_minutes must be >= 0 (got {})",
                max_time
            )));
        }

        let level = doc.level.unwrap_or(1);
        if level < 1 {
            return Err(malformed(format!("level must be >= 1 (got {})", level)));
        }
        let level = u32::try_from(level)
            .map_err(|_| malformed(format!("level {} is out of range", level)))?;

        let days = doc.days_to_activate.unwrap_or(0);
        if days < 0 {
            return Err(malformed(format!("days_to_activate must be >= 0 (got {})", days)));
        }
        let days_to_activate = u32::try_from(days)
            .map_err(|_| malformed(format!("days_to_activate {} is out of range", days)))?;

        let raw_paths = doc
            .escalation_paths
            .as_ref()
            .ok_or_else(|| missing("escalation_paths"))?;
        if raw_paths.is_empty() {
            return Err(malformed("escalation_paths is empty".to_owned()));
        }

        let escalation_paths = raw_paths
            .iter()
            .map(|p| EscalationPath::from_document(p, &name))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Rule {
            name,
            query,
            max_time_in_status_minutes: max_time,
            level,
            days_to_activate,
            description: doc.description.clone().unwrap_or_default(),
            escalation_paths,
        })
    }

    /// Display label, e.g. `Stale review (L2)`.
    pub fn label(&self) -> String {
        format!("{} (L{})", self.name, self.level)
    }
}

impl EscalationPath {
    fn from_document(doc: &PathDocument, rule: &str) -> Result<EscalationPath, ConfigError> {
        let raw_type = doc.path_type.as_deref().ok_or_else(|| ConfigError::MissingField {
            rule:  rule.to_owned(),
            field: "escalation_paths[].type".to_owned(),
        })?;
        let kind = PathKind::parse(raw_type).ok_or_else(|| ConfigError::UnknownPathType {
            rule:      rule.to_owned(),
            path_type: raw_type.to_owned(),
        })?;

        let recipient = Recipient::parse(doc.recipient.as_deref().unwrap_or(""));
        if kind.requires_recipient() && recipient == Recipient::None {
            return Err(ConfigError::MissingField {
                rule:  rule.to_owned(),
                field: format!("escalation_paths[{}].recipient", kind),
            });
        }

        Ok(EscalationPath {
            kind,
            recipient,
            message_template: doc.message_template.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Rule sets
// ---------------------------------------------------------------------------

/// Validate every rule document, keeping configuration order.
///
/// Fails on the first invalid rule or on a duplicated (name, level) pair.
/// Chain gaps and level-1 activation delays are accepted but logged.
pub fn build_rules(docs: &[RuleDocument]) -> Result<Vec<Rule>, ConfigError> {
    let rules = docs
        .iter()
        .enumerate()
        .map(|(i, doc)| Rule::from_document(doc, i))
        .collect::<Result<Vec<_>, _>>()?;

    let mut seen: HashSet<(&str, u32)> = HashSet::new();
    for rule in &rules {
        if !seen.insert((rule.name.as_str(), rule.level)) {
            return Err(ConfigError::MalformedRule {
                rule:   rule.name.clone(),
                reason: format!("level {} is defined more than once", rule.level),
            });
        }
        if rule.level == 1 && rule.days_to_activate > 0 {
            tracing::warn!(
                "Rule {} sets days_to_activate={} on level 1; it has no effect",
                rule.label(),
                rule.days_to_activate
            );
        }
    }

    for rule in rules.iter().filter(|r| r.level > 1) {
        if !seen.contains(&(rule.name.as_str(), rule.level - 1)) {
            tracing::warn!(
                "Rule {} has no level {} in its chain; it can never fire",
                rule.label(),
                rule.level - 1
            );
        }
    }

    Ok(rules)
}

/// Rules grouped by level (ascending), configuration order inside a level.
pub fn group_by_level(rules: &[Rule]) -> BTreeMap<u32, Vec<&Rule>> {
    let mut groups: BTreeMap<u32, Vec<&Rule>> = BTreeMap::new();
    for rule in rules {
        groups.entry(rule.level).or_default().push(rule);
    }
    groups
}

/// Distinct chain names, sorted.
pub fn chain_names(rules: &[Rule]) -> BTreeSet<&str> {
    rules.iter().map(|r| r.name.as_str()).collect()
}
