/// Error taxonomy for an escalation run.
///
/// Fatal kinds (`ConfigError`, `HistoryStoreError`) abort the run and surface
/// through `Error`. `QueryError` and `DeliveryError` are scoped to one rule or
/// one escalation path; the engine logs them and carries on.
use crate::rules::PathKind;
use thiserror::Error;

/// Result type for operations that can abort a run.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path:   String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("rule '{rule}' is malformed: {reason}")]
    MalformedRule { rule: String, reason: String },

    #[error("rule '{rule}' uses unknown escalation path type '{path_type}'")]
    UnknownPathType { rule: String, path_type: String },

    #[error("rule '{rule}' is missing required field '{field}'")]
    MissingField { rule: String, field: String },

    #[error("template references unknown placeholder '{{{placeholder}}}'")]
    UnknownPlaceholder { placeholder: String },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("issue query failed: {0}")]
    Http(String),

    #[error("could not decode issue tracker response: {0}")]
    Decode(String),

    #[error("query task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no transport configured for {0}")]
    NotConfigured(PathKind),

    #[error("recipient '{0}' could not be resolved")]
    UnresolvedRecipient(String),

    #[error("transport request failed: {0}")]
    Http(String),

    #[error("transport rejected the message: {0}")]
    Rejected(String),

    #[error("email delivery failed: {0}")]
    Smtp(String),

    #[error("delivery task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum HistoryStoreError {
    #[error("history database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("history file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort an entire run.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    History(#[from] HistoryStoreError),
}
