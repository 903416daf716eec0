//! Notification seam.
//!
//! The core never talks to a transport. It hands a task snapshot and an event
//! kind to a `NotificationSink`; the outcome is advisory. Callers log a
//! failure and carry on, they never abort the lifecycle or scheduler
//! operation that triggered it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::info;

use crate::error::Result;
use crate::task::Task;

// ---------------------------------------------------------------------------
// NotifyEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// The deadline sweep escalated the task.
    Escalated,
    /// A rule requested a notification on a channel.
    Channel { channel: String },
    /// A policy step notified a role.
    Role { role: String },
    /// A policy step notified a user.
    User { user_id: String },
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyEvent::Escalated => f.write_str("escalated"),
            NotifyEvent::Channel { channel } => write!(f, "channel:{channel}"),
            NotifyEvent::Role { role } => write!(f, "role:{role}"),
            NotifyEvent::User { user_id } => write!(f, "user:{user_id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// NotificationSink
// ---------------------------------------------------------------------------

pub trait NotificationSink {
    fn send(&self, task: &Task, event: &NotifyEvent) -> Result<()>;
}

/// Logs every notification at info level. The default sink for the CLI.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn send(&self, task: &Task, event: &NotifyEvent) -> Result<()> {
        info!(task = %task.key(), %event, "notification");
        Ok(())
    }
}

/// Captures notifications for assertions in tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    sent: Mutex<Vec<(String, NotifyEvent)>>,
}

impl CollectingSink {
    pub fn sent(&self) -> Vec<(String, NotifyEvent)> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl NotificationSink for CollectingSink {
    fn send(&self, task: &Task, event: &NotifyEvent) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((task.key(), event.clone()));
        Ok(())
    }
}

/// Fails every send. Exercises the advisory-outcome paths in tests.
#[derive(Debug, Default)]
pub struct FailingSink;

impl NotificationSink for FailingSink {
    fn send(&self, _task: &Task, event: &NotifyEvent) -> Result<()> {
        Err(crate::error::SignalwayError::Notify(format!(
            "transport unavailable for {event}"
        )))
    }
}
