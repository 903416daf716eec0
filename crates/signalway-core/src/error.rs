use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalwayError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("escalation instance not found: {0}")]
    InstanceNotFound(String),

    #[error("escalation policy not found: {0}")]
    PolicyNotFound(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("cannot escalate task in status {0}")]
    CannotEscalate(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid priority: {0}")]
    InvalidPriority(String),

    #[error("invalid severity: {0}")]
    InvalidSeverity(String),

    #[error("invalid visibility: {0}")]
    InvalidVisibility(String),

    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("invalid duration '{0}': expected seconds or a duration string like '1d2h30m'")]
    InvalidDuration(String),

    #[error("profile lookup failed: {0}")]
    ProfileLookup(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("notification dispatch failed: {0}")]
    Notify(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SignalwayError>;
