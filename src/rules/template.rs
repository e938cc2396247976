/// Message template rendering for escalation paths.
///
/// Templates use `{placeholder}` substitution. Numeric placeholders accept a
/// precision suffix (`{time_in_status_minutes:.0}`), and `{{` / `}}` produce
/// literal braces. Rendering is pure: no I/O, no clock.
///
/// Unknown placeholders are a config error. The engine runs `check` over
/// every template before its first dispatch so a typo aborts the run instead
/// of half-notifying.
use crate::error::ConfigError;

/// Values available to a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateFields<'a> {
    pub issue_key:                  &'a str,
    pub issue_summary:              &'a str,
    pub issue_assignee:             Option<&'a str>,
    pub status:                     &'a str,
    pub time_in_status_minutes:     f64,
    pub max_time_in_status_minutes: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    IssueKey,
    IssueSummary,
    IssueAssignee,
    Status,
    TimeInStatus,
    MaxTimeInStatus,
}

impl Field {
    fn parse(name: &str) -> Option<Field> {
        Some(match name {
            "issue_key"                  => Field::IssueKey,
            "issue_summary"              => Field::IssueSummary,
            "issue_assignee"             => Field::IssueAssignee,
            "status"                     => Field::Status,
            "time_in_status_minutes"     => Field::TimeInStatus,
            "max_time_in_status_minutes" => Field::MaxTimeInStatus,
            _ => return None,
        })
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Field::TimeInStatus | Field::MaxTimeInStatus)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field { field: Field, precision: Option<usize> },
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse(template: &str) -> Result<Vec<Segment>, ConfigError> {
    let mut segments = Vec::new();
    let mut literal  = String::new();
    let mut chars    = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '}' => {
                return Err(ConfigError::InvalidTemplate(format!(
                    "unmatched '}}' in {:?}",
                    template
                )));
            }
            '{' => {
                let mut inner  = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(ConfigError::InvalidTemplate(format!(
                        "unclosed '{{' in {:?}",
                        template
                    )));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(parse_placeholder(&inner)?);
            }
            other => literal.push(other),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_placeholder(inner: &str) -> Result<Segment, ConfigError> {
    let (name, suffix) = match inner.split_once(':') {
        Some((name, suffix)) => (name.trim(), Some(suffix.trim())),
        None               => (inner.trim(), None),
    };

    let field = Field::parse(name).ok_or_else(|| ConfigError::UnknownPlaceholder {
        placeholder: name.to_owned(),
    })?;

    let precision = match suffix {
        None => None,
        Some(suffix) => {
            if !field.is_numeric() {
                return Err(ConfigError::InvalidTemplate(format!(
                    "'{}' is text and takes no format suffix",
                    name
                )));
            }
            Some(parse_precision(suffix).ok_or_else(|| {
                ConfigError::InvalidTemplate(format!(
                    "unsupported format suffix ':{}' on '{}' (expected ':.0' to ':.{}')",
                    suffix, name, MAX_PRECISION
                ))
            })?)
        }
    };

    Ok(Segment::Field { field, precision })
}

const MAX_PRECISION: usize = 20;

/// `.N` or `.Nf`, with `N <= MAX_PRECISION`.
fn parse_precision(suffix: &str) -> Option<usize> {
    let digits = suffix.strip_prefix('.')?;
    let digits = digits.strip_suffix('f').unwrap_or(digits);
    if digits.is_empty() {
        return None;
    }
    digits.parse::<usize>().ok().filter(|p| *p <= MAX_PRECISION)
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Validate a template without rendering it.
pub fn check(template: &str) -> Result<(), ConfigError> {
    parse(template).map(|_| ())
}

pub fn render(template: &str, fields: &TemplateFields) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len() + 32);
    for segment in parse(template)? {
        match segment {
            Segment::Literal(s) => out.push_str(&s),
            Segment::Field { field, precision } => match field {
                Field::IssueKey      => out.push_str(fields.issue_key),
                Field::IssueSummary  => out.push_str(fields.issue_summary),
                Field::IssueAssignee => out.push_str(fields.issue_assignee.unwrap_or("Unassigned")),
                Field::Status        => out.push_str(fields.status),
                Field::TimeInStatus  => push_number(&mut out, fields.time_in_status_minutes, precision),
                Field::MaxTimeInStatus => {
                    push_number(&mut out, fields.max_time_in_status_minutes, precision)
                }
            },
        }
    }
    Ok(out)
}

fn push_number(out: &mut String, value: f64, precision: Option<usize>) {
    match precision {
        Some(p) => out.push_str(&format!("{:.*}", p, value)),
        None    => out.push_str(&value.to_string()),
    }
}

/// Body used by transports when a path has no template of its own.
pub fn default_message(fields: &TemplateFields) -> String {
    format!(
        "Issue {}: {}\nStatus: {}\nTime in status: {:.1} minutes\nMax time allowed: {} minutes",
        fields.issue_key,
        fields.issue_summary,
        fields.status,
        fields.time_in_status_minutes,
        fields.max_time_in_status_minutes,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> TemplateFields<'static> {
        TemplateFields {
            issue_key:                  "OPS-42",
            issue_summary:              "Deploy pipeline flaky",
            issue_assignee:             None,
            status:                     "In Review",
            time_in_status_minutes:     90.456,
            max_time_in_status_minutes: 60.0,
        }
    }

    #[test]
    fn substitutes_fields() {
        let out = render(
            "{issue_key} ({issue_summary}) has been {status} for {time_in_status_minutes:.0}m",
            &fields(),
        )
        .unwrap();
        assert_eq!(out, "OPS-42 (Deploy pipeline flaky) has been In Review for 90m");
    }

    #[test]
    fn precision_suffixes() {
        assert_eq!(render("{time_in_status_minutes:.1}", &fields()).unwrap(), "90.5");
        assert_eq!(render("{time_in_status_minutes:.2f}", &fields()).unwrap(), "90.46");
        assert_eq!(render("{time_in_status_minutes}", &fields()).unwrap(), "90.456");
        assert_eq!(render("{max_time_in_status_minutes}", &fields()).unwrap(), "60");
    }

    #[test]
    fn missing_assignee_renders_unassigned() {
        assert_eq!(render("@{issue_assignee}", &fields()).unwrap(), "@Unassigned");
        let mut f = fields();
        f.issue_assignee = Some("jdoe");
        assert_eq!(render("@{issue_assignee}", &f).unwrap(), "@jdoe");
    }

    #[test]
    fn escaped_braces_are_literal() {
        assert_eq!(
            render("{{code}} {issue_key} }}", &fields()).unwrap(),
            "{code} OPS-42 }"
        );
    }

    #[test]
    fn unknown_placeholder_is_config_error() {
        match render("{issue_key} owned by {team}", &fields()) {
            Err(ConfigError::UnknownPlaceholder { placeholder }) => assert_eq!(placeholder, "team"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(check("{priority}").is_err());
    }

    #[test]
    fn malformed_templates_are_rejected() {
        assert!(matches!(check("{issue_key"), Err(ConfigError::InvalidTemplate(_))));
        assert!(matches!(check("oops }"), Err(ConfigError::InvalidTemplate(_))));
        assert!(matches!(check("{status:.1}"), Err(ConfigError::InvalidTemplate(_))));
        assert!(matches!(check("{time_in_status_minutes:>8}"), Err(ConfigError::InvalidTemplate(_))));
        assert!(check("plain text").is_ok());
    }

    #[test]
    fn precision_is_capped() {
        assert!(check("{time_in_status_minutes:.20}").is_ok());
        assert!(matches!(check("{time_in_status_minutes:.21}"), Err(ConfigError::InvalidTemplate(_))));
        assert!(matches!(
            check("{max_time_in_status_minutes:.999999999999}"),
            Err(ConfigError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn default_message_mentions_threshold() {
        let msg = default_message(&fields());
        assert!(msg.starts_with("Issue OPS-42: Deploy pipeline flaky"));
        assert!(msg.contains("Time in status: 90.5 minutes"));
        assert!(msg.contains("Max time allowed: 60 minutes"));
    }
}
