/// Escalation engine: decides, per (issue, rule), whether a notification is
/// due, hands due escalations to the dispatcher and records what fired.
///
/// Every decision in a run is gated on one snapshot of the history taken before
/// the first query. Firings are still committed one by one as they happen, but
/// they never feed back into the same run: a level chain advances at most one
/// level per run, and the rule order in the configuration only changes the
/// order notifications go out in.
///
/// Gates, in order; the first that fails is the reported decision:
///   1. time in status ≥ threshold
///   2. level > 1: previous level has fired for this issue
///   3. level > 1: `days_to_activate` have passed since the chain anchor
///   4. not on cooldown (boundary inclusive)
use crate::{
    dispatch::{template_fields, Dispatcher, Notification},
    error::{ConfigError, DeliveryError, Result},
    history::{HistorySnapshot, HistoryStore},
    jira::{Issue, IssueSource},
    rules::{template, Rule},
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Due,
    BelowThreshold,
    PreviousLevelMissing,
    AwaitingActivation { remaining: Duration },
    CoolingDown { remaining: Duration },
}

impl Decision {
    pub fn is_due(&self) -> bool {
        matches!(self, Decision::Due)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Due                  => f.write_str("due"),
            Decision::BelowThreshold       => f.write_str("below threshold"),
            Decision::PreviousLevelMissing => f.write_str("previous level has not fired"),
            Decision::AwaitingActivation { remaining } => {
                write!(f, "activates in {}", human(*remaining))
            }
            Decision::CoolingDown { remaining } => write!(f, "on cooldown for {}", human(*remaining)),
        }
    }
}

/// `1d 2h 3m` style; seconds are dropped unless that is all there is.
pub(crate) fn human(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    let (days, hours, mins) = (secs / 86_400, secs % 86_400 / 3_600, secs % 3_600 / 60);
    let mut parts = Vec::new();
    if days > 0  { parts.push(format!("{}d", days)); }
    if hours > 0 { parts.push(format!("{}h", hours)); }
    if mins > 0  { parts.push(format!("{}m", mins)); }
    if parts.is_empty() {
        return format!("{}s", secs);
    }
    parts.join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Dispatch and record history.
    Live,
    /// Evaluate and render only; nothing is sent or written.
    DryRun,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub rules_evaluated:    usize,
    pub rules_failed:       usize,
    pub issues_matched:     usize,
    pub escalations_fired:  usize,
    pub escalations_failed: usize,
    pub paths_delivered:    usize,
    pub paths_failed:       usize,
    pub would_fire:         usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rules evaluated ({} failed), {} issues matched",
            self.rules_evaluated, self.rules_failed, self.issues_matched
        )?;
        if self.would_fire > 0 {
            write!(f, ", {} escalations would fire", self.would_fire)?;
        }
        write!(
            f,
            ", {} escalations fired ({} failed), {} paths delivered, {} paths failed",
            self.escalations_fired, self.escalations_failed, self.paths_delivered, self.paths_failed
        )
    }
}

/// One delivery attempt, as shipped to an external log sink.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationEvent {
    pub issue_key:                  String,
    pub issue_summary:              String,
    pub issue_assignee:             Option<String>,
    pub status:                     String,
    pub time_in_status_minutes:     f64,
    pub rule_name:                  String,
    pub rule_jql:                   String,
    pub level:                      u32,
    pub max_time_in_status_minutes: f64,
    pub escalation_path_type:       String,
    pub escalation_path_recipient:  String,
    pub successful:                 bool,
    pub error_message:              Option<String>,
    pub timestamp:                  i64,
}

impl EscalationEvent {
    pub fn new(n: &Notification<'_>, error: Option<&DeliveryError>, now: DateTime<Utc>) -> Self {
        Self {
            issue_key:                  n.issue.key.clone(),
            issue_summary:              n.issue.summary.clone(),
            issue_assignee:             n.issue.assignee.clone(),
            status:                     n.issue.status.clone(),
            time_in_status_minutes:     n.issue.time_in_status_minutes,
            rule_name:                  n.rule.name.clone(),
            rule_jql:                   n.rule.query.clone(),
            level:                      n.rule.level,
            max_time_in_status_minutes: n.rule.max_time_in_status_minutes,
            escalation_path_type:       n.path.kind.to_string(),
            escalation_path_recipient:  n.path.recipient.to_string(),
            successful:                 error.is_none(),
            error_message:              error.map(|e| e.to_string()),
            timestamp:                  now.timestamp(),
        }
    }
}

/// Receives one event per attempted path. Sinks handle (and log) their own
/// failures; a sink can never fail a run.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: &EscalationEvent);
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

pub fn evaluate(
    rule:     &Rule,
    issue:    &Issue,
    history:  &HistorySnapshot,
    now:      DateTime<Utc>,
    cooldown: Duration,
) -> Decision {
    if issue.time_in_status_minutes < rule.max_time_in_status_minutes {
        return Decision::BelowThreshold;
    }

    if rule.level > 1 {
        if history.get(&issue.key, &rule.name, rule.level - 1).is_none() {
            return Decision::PreviousLevelMissing;
        }
        let Some(anchor) = history.first_triggered(&issue.key, &rule.name) else {
            return Decision::PreviousLevelMissing;
        };
        let delay   = Duration::hours(24 * i64::from(rule.days_to_activate));
        let elapsed = now - anchor;
        if elapsed < delay {
            return Decision::AwaitingActivation { remaining: delay - elapsed };
        }
    }

    if let Some(last) = history.get(&issue.key, &rule.name, rule.level) {
        let elapsed = now - last.last_triggered_at;
        if elapsed < cooldown {
            return Decision::CoolingDown { remaining: cooldown - elapsed };
        }
    }

    Decision::Due
}

/// Parse every path template up front so a broken one aborts the run before
/// anything is sent.
pub fn preflight(rules: &[Rule]) -> std::result::Result<(), ConfigError> {
    for rule in rules {
        for path in &rule.escalation_paths {
            if let Some(t) = &path.message_template {
                template::check(t).map_err(|e| {
                    tracing::error!("Rule {} has a bad {} template: {}", rule.label(), path.kind, e);
                    e
                })?;
            }
        }
    }
    Ok(())
}

fn render_paths(rule: &Rule, issue: &Issue) -> std::result::Result<Vec<Option<String>>, ConfigError> {
    let fields = template_fields(rule, issue);
    rule.escalation_paths
        .iter()
        .map(|path| path.message_template.as_deref().map(|t| template::render(t, &fields)).transpose())
        .collect()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<S, D> {
    source:     S,
    dispatcher: D,
    cooldown:   Duration,
    sink:       Option<Arc<dyn EventSink>>,
}

impl<S: IssueSource, D: Dispatcher> Engine<S, D> {
    pub fn new(source: S, dispatcher: D, cooldown: Duration) -> Self {
        Self { source, dispatcher, cooldown, sink: None }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// One pass over `rules` in order, with a single `now` for the whole run.
    pub async fn run(
        &self,
        rules:   &[Rule],
        history: &mut HistoryStore,
        now:     DateTime<Utc>,
        mode:    RunMode,
    ) -> Result<RunSummary> {
        preflight(rules)?;
        let snapshot = history.snapshot()?;

        let mut summary = RunSummary::default();
        tracing::info!(
            "Evaluating {} rules ({:?}) against {} history records",
            rules.len(), mode, snapshot.len()
        );

        for rule in rules {
            summary.rules_evaluated += 1;

            let issues = match self.source.find_issues(&rule.query, now).await {
                Ok(issues) => issues,
                Err(e) => {
                    tracing::warn!("Skipping rule {}: {}", rule.label(), e);
                    summary.rules_failed += 1;
                    continue;
                }
            };
            tracing::debug!("Rule {} matched {} issues", rule.label(), issues.len());
            summary.issues_matched += issues.len();

            for issue in &issues {
                let decision = evaluate(rule, issue, &snapshot, now, self.cooldown);
                if !decision.is_due() {
                    tracing::debug!("{} / {}: {}", issue.key, rule.label(), decision);
                    continue;
                }

                let bodies = render_paths(rule, issue)?;
                match mode {
                    RunMode::DryRun => {
                        summary.would_fire += 1;
                        for path in &rule.escalation_paths {
                            tracing::info!(
                                "[dry run] Would escalate {} under {} via {} to {}",
                                issue.key, rule.label(), path.kind, path.recipient
                            );
                        }
                    }
                    RunMode::Live => self.fire(rule, issue, bodies, history, now, &mut summary).await?,
                }
            }
        }

        tracing::info!("Run complete: {}", summary);
        Ok(summary)
    }

    async fn fire(
        &self,
        rule:    &Rule,
        issue:   &Issue,
        bodies:  Vec<Option<String>>,
        history: &mut HistoryStore,
        now:     DateTime<Utc>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        tracing::info!(
            "Escalating {} under {} ({:.1} min in '{}')",
            issue.key, rule.label(), issue.time_in_status_minutes, issue.status
        );

        let mut delivered = 0usize;
        for (path, body) in rule.escalation_paths.iter().zip(bodies) {
            let n = Notification { rule, path, issue, body };
            let outcome = self.dispatcher.dispatch(&n).await;

            match &outcome {
                Ok(()) => {
                    delivered += 1;
                    summary.paths_delivered += 1;
                    tracing::info!("Escalated {} via {}", issue.key, path.kind);
                }
                Err(e) => {
                    summary.paths_failed += 1;
                    tracing::warn!("Failed to escalate {} via {}: {}", issue.key, path.kind, e);
                }
            }

            if let Some(sink) = &self.sink {
                sink.record(&EscalationEvent::new(&n, outcome.as_ref().err(), now)).await;
            }
        }

        if delivered > 0 {
            history.record(&issue.key, &rule.name, rule.level, now)?;
            summary.escalations_fired += 1;
        } else {
            summary.escalations_failed += 1;
            tracing::error!("Every escalation path failed for {} under {}; not recorded", issue.key, rule.label());
        }
        Ok(())
    }
}
