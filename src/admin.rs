/// Operator-facing views over the rule set and the history store: the text
/// behind `escalate rules`, `escalate history` and `escalate clear`.
use crate::{
    engine::human,
    history::{self, HistoryRecord, HistoryStore},
    rules::{self, Rule},
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::fmt::Write as _;

/// Rules grouped by level, lowest first.
pub fn format_rules(rules: &[Rule]) -> String {
    let mut out = String::new();
    let chains = rules::chain_names(rules);
    let _ = writeln!(out, "{} rules in {} chains", rules.len(), chains.len());

    for (level, group) in rules::group_by_level(rules) {
        let _ = writeln!(out, "\nLevel {}", level);
        for rule in group {
            let _ = writeln!(out, "  {}", rule.name);
            if !rule.description.is_empty() {
                let _ = writeln!(out, "    {}", rule.description);
            }
            let _ = writeln!(out, "    query:     {}", rule.query);
            let _ = writeln!(out, "    threshold: {} min", rule.max_time_in_status_minutes);
            if level > 1 {
                let _ = writeln!(out, "    activates: {} days after first escalation", rule.days_to_activate);
            }
            for path in &rule.escalation_paths {
                let template = if path.message_template.is_some() { " (custom message)" } else { "" };
                let _ = writeln!(out, "    -> {} {}{}", path.kind, path.recipient, template);
            }
        }
    }
    out
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Full history table.
pub fn format_history(records: &[HistoryRecord]) -> String {
    if records.is_empty() {
        return "No escalation history.\n".to_owned();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:<14} {:<28} {:>5}  {:<20}  {:<20}", "ISSUE", "RULE", "LEVEL", "FIRST", "LAST");
    for r in records {
        let _ = writeln!(
            out,
            "{:<14} {:<28} {:>5}  {:<20}  {:<20}",
            r.issue_key,
            r.rule_name,
            r.level,
            ts(r.first_triggered_at),
            ts(r.last_triggered_at)
        );
    }
    out
}

/// Records still on cooldown, with the time left on each.
pub fn format_active(records: &[HistoryRecord], cooldown: Duration, now: DateTime<Utc>) -> String {
    if records.is_empty() {
        return "No escalations on cooldown.\n".to_owned();
    }
    let mut out = String::new();
    let _ = writeln!(out, "{:<14} {:<28} {:>5}  {:<20}  {}", "ISSUE", "RULE", "LEVEL", "LAST", "REMAINING");
    for r in records {
        let remaining = cooldown - (now - r.last_triggered_at);
        let _ = writeln!(
            out,
            "{:<14} {:<28} {:>5}  {:<20}  {}",
            r.issue_key,
            r.rule_name,
            r.level,
            ts(r.last_triggered_at),
            human(remaining)
        );
    }
    out
}

/// Clear one issue's history, or everything when `issue` is `None`.
pub fn clear(store: &mut HistoryStore, issue: Option<&str>) -> history::Result<usize> {
    match issue {
        Some(key) => store.clear_for_issue(key),
        None      => store.clear_all(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{EscalationPath, PathKind, Recipient};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn rule(name: &str, level: u32) -> Rule {
        Rule {
            name:                       name.to_owned(),
            query:                      "status = 'In Review'".to_owned(),
            max_time_in_status_minutes: 120.0,
            level,
            days_to_activate:           if level > 1 { 2 } else { 0 },
            description:                String::new(),
            escalation_paths:           vec![EscalationPath {
                kind:             PathKind::SlackDm,
                recipient:        Recipient::parse("assignee"),
                message_template: None,
            }],
        }
    }

    #[test]
    fn rules_are_listed_by_level() {
        let rules = vec![rule("Review", 2), rule("Review", 1), rule("Triage", 1)];
        let out = format_rules(&rules);
        assert!(out.starts_with("3 rules in 2 chains"));

        let l1 = out.find("Level 1").unwrap();
        let l2 = out.find("Level 2").unwrap();
        assert!(l1 < l2);
        assert!(out[l2..].contains("activates: 2 days after first escalation"));
        assert!(!out[l1..l2].contains("activates"));
        assert!(out.contains("-> slack_dm assignee"));
    }

    #[test]
    fn history_views() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        assert_eq!(format_history(&store.list_all().unwrap()), "No escalation history.\n");

        store.record("OPS-1", "Review", 1, t0()).unwrap();
        let out = format_history(&store.list_all().unwrap());
        assert!(out.contains("OPS-1"));
        assert!(out.contains("2024-03-01T09:00:00Z"));

        let now = t0() + Duration::hours(20);
        let active = store.list_active(Duration::hours(24), now).unwrap();
        assert!(format_active(&active, Duration::hours(24), now).contains("4h"));
    }

    #[test]
    fn clear_scopes_to_issue() {
        let mut store = HistoryStore::open_in_memory().unwrap();
        store.record("OPS-1", "Review", 1, t0()).unwrap();
        store.record("OPS-2", "Review", 1, t0()).unwrap();

        assert_eq!(clear(&mut store, Some("OPS-1")).unwrap(), 1);
        assert_eq!(store.list_all().unwrap().len(), 1);
        assert_eq!(clear(&mut store, None).unwrap(), 1);
        assert!(store.list_all().unwrap().is_empty());
    }
}
