//! Time-gated, level-escalating notifications for issues that sit too long in
//! one status.
//!
//! A run loads the rules, asks the issue source which issues match each rule,
//! decides per (issue, rule) whether a notification is due, dispatches it over
//! the rule's escalation paths and records the firing so later runs respect
//! the cooldown and the level chain.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod history;
pub mod http;
pub mod jira;
pub mod rules;
pub mod telemetry;

pub use engine::{Decision, Engine, RunMode, RunSummary};
pub use error::{Error, Result};
pub use history::{HistoryRecord, HistoryStore};
pub use rules::{EscalationPath, PathKind, Recipient, RecipientToken, Rule};
