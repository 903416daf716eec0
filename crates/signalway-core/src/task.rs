//! The task entity and its lifecycle operations.
//!
//! Tasks are created in `Pending` with `escalation_level = 0` and mutated
//! only through the operations below. Terminal tasks are retained for audit,
//! never deleted. `closed_at` is set exactly when the status is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{Result, SignalwayError};
use crate::profile::OrgProfile;
use crate::sla::{resolve_reactivity_deadline, SlaOverride};
use crate::types::{Priority, Severity, SignalSource, TaskStatus, Visibility};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub organization_id: String,

    // Classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    // Content
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub status: TaskStatus,
    pub priority: Priority,
    pub severity: Severity,
    pub visibility: Visibility,
    pub source: SignalSource,

    // Ownership
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_role_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_person_id: Option<String>,

    // Timing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// SLA deadline. Consumed (cleared) by the deadline sweep once the task
    /// has been escalated for breaching it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactivity_deadline_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub escalation_level: u32,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn key(&self) -> String {
        format!("{}/{}", self.organization_id, self.id)
    }

    pub fn is_unresolved(&self) -> bool {
        self.status.is_unresolved()
    }

    /// Change status according to the transition table.
    ///
    /// Same-status calls are a no-op and return `false`. Illegal edges return
    /// `InvalidTransition` and leave the task unchanged. `closed_at` is set on
    /// entry to a terminal status and cleared on exit from one.
    pub fn update_status(&mut self, new_status: TaskStatus, now: DateTime<Utc>) -> Result<bool> {
        if new_status == self.status {
            return Ok(false);
        }
        if !self.status.can_transition_to(new_status) {
            return Err(SignalwayError::InvalidTransition {
                from: self.status.to_string(),
                to: new_status.to_string(),
            });
        }

        self.status = new_status;
        if new_status.is_terminal() {
            self.closed_at = Some(now);
        } else {
            // Terminal statuses have no outgoing edges; this branch only
            // clears a stale value written by an external store.
            self.closed_at = None;
        }
        self.updated_at = now;
        Ok(true)
    }

    /// Escalate the task: status becomes `Escalated`, level strictly increases.
    ///
    /// Legal from `Pending`, `InProgress`, `OnHold`, `Escalated`; terminal
    /// tasks return `CannotEscalate`.
    pub fn escalate(&mut self, now: DateTime<Utc>) -> Result<u32> {
        if !self.status.is_unresolved() {
            return Err(SignalwayError::CannotEscalate(self.status.to_string()));
        }
        self.status = TaskStatus::Escalated;
        self.escalation_level += 1;
        self.updated_at = now;
        Ok(self.escalation_level)
    }

    /// Reassign to a role. Always legal on unresolved tasks.
    pub fn assign(&mut self, role: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if !self.status.is_unresolved() {
            return Err(SignalwayError::InvalidTransition {
                from: self.status.to_string(),
                to: self.status.to_string(),
            });
        }
        self.assignee_role = Some(role.into());
        self.updated_at = now;
        Ok(())
    }

    /// Merge a JSON object patch into the task metadata. Nested objects merge
    /// recursively; any other value replaces.
    pub fn merge_metadata(&mut self, patch: &Map<String, Value>, now: DateTime<Utc>) {
        merge_object(&mut self.metadata, patch);
        self.updated_at = now;
    }
}

fn merge_object(base: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_object(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TaskDraft
// ---------------------------------------------------------------------------

/// Input for task creation. Enum fields left `None` default from the
/// organization profile; caller values win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub source: Option<SignalSource>,
    #[serde(default)]
    pub assignee_role: Option<String>,
    #[serde(default)]
    pub created_by_user_id: Option<String>,
    #[serde(default)]
    pub requester_person_id: Option<String>,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactivity_deadline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactivity_duration: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Task {
    /// Create a task in `Pending` with the reactivity deadline resolved per
    /// the SLA precedence chain.
    pub fn create(
        organization_id: impl Into<String>,
        draft: TaskDraft,
        profile: &OrgProfile,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        if draft.title.trim().is_empty() {
            return Err(SignalwayError::Validation("task title is empty".into()));
        }

        let sla = SlaOverride {
            deadline: draft.reactivity_deadline_at,
            duration: draft.reactivity_duration.clone(),
        };
        let deadline = resolve_reactivity_deadline(now, &sla, profile)?;

        Ok(Task {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            kind: draft.kind,
            category: draft.category,
            subtype: draft.subtype,
            label: draft.label,
            title: draft.title,
            description: draft.description,
            status: TaskStatus::Pending,
            priority: draft.priority.unwrap_or(profile.priority),
            severity: draft.severity.unwrap_or(profile.severity),
            visibility: draft.visibility.unwrap_or(profile.visibility),
            source: draft.source.unwrap_or(SignalSource::Api),
            owner_role_id: None,
            owner_user_id: None,
            assignee_role: draft.assignee_role,
            created_by_user_id: draft.created_by_user_id,
            requester_person_id: draft.requester_person_id,
            due_at: draft.due_at,
            reactivity_deadline_at: Some(deadline),
            closed_at: None,
            escalation_level: 0,
            metadata: draft.metadata,
            created_at: now,
            updated_at: now,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn draft(title: &str) -> TaskDraft {
        TaskDraft {
            title: title.to_string(),
            ..TaskDraft::default()
        }
    }

    fn new_task() -> Task {
        Task::create("acme", draft("Pager is down"), &OrgProfile::default(), t0()).unwrap()
    }

    #[test]
    fn created_pending_with_level_zero() {
        let task = new_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.escalation_level, 0);
        assert!(task.closed_at.is_none());
        // no profile window, no override -> 12 h fallback
        assert_eq!(
            task.reactivity_deadline_at,
            Some(t0() + Duration::seconds(43_200))
        );
    }

    #[test]
    fn caller_values_win_over_profile() {
        let profile = OrgProfile {
            priority: Priority::Low,
            ..OrgProfile::default()
        };
        let mut d = draft("x");
        d.priority = Some(Priority::Urgent);
        let task = Task::create("acme", d, &profile, t0()).unwrap();
        assert_eq!(task.priority, Priority::Urgent);
    }

    #[test]
    fn empty_title_is_rejected() {
        let err = Task::create("acme", draft("  "), &OrgProfile::default(), t0()).unwrap_err();
        assert!(matches!(err, SignalwayError::Validation(_)));
    }

    #[test]
    fn same_status_update_is_noop() {
        let mut task = new_task();
        let changed = task.update_status(TaskStatus::Pending, t0()).unwrap();
        assert!(!changed);
    }

    #[test]
    fn illegal_edge_leaves_task_unchanged() {
        let mut task = new_task();
        let err = task.update_status(TaskStatus::Completed, t0()).unwrap_err();
        assert!(matches!(err, SignalwayError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.closed_at.is_none());
    }

    #[test]
    fn closed_at_set_iff_terminal() {
        let mut task = new_task();
        task.update_status(TaskStatus::InProgress, t0()).unwrap();
        assert!(task.closed_at.is_none());

        let later = t0() + Duration::hours(1);
        task.update_status(TaskStatus::Completed, later).unwrap();
        assert_eq!(task.closed_at, Some(later));
        assert!(task.status.is_terminal());
    }

    #[test]
    fn escalate_increments_level() {
        let mut task = new_task();
        assert_eq!(task.escalate(t0()).unwrap(), 1);
        assert_eq!(task.status, TaskStatus::Escalated);
        assert_eq!(task.escalate(t0()).unwrap(), 2);
        assert_eq!(task.escalation_level, 2);
    }

    #[test]
    fn escalate_terminal_fails() {
        let mut task = new_task();
        task.update_status(TaskStatus::Cancelled, t0()).unwrap();
        let err = task.escalate(t0()).unwrap_err();
        assert!(matches!(err, SignalwayError::CannotEscalate(_)));
        assert_eq!(task.escalation_level, 0);
    }

    #[test]
    fn metadata_merge_is_recursive() {
        let mut task = new_task();
        task.metadata = serde_json::from_str(r#"{"ctx": {"region": "eu", "zone": "a"}}"#).unwrap();
        let patch: Map<String, Value> =
            serde_json::from_str(r#"{"ctx": {"zone": "b"}, "count": 2}"#).unwrap();
        task.merge_metadata(&patch, t0());
        assert_eq!(task.metadata["ctx"]["region"], "eu");
        assert_eq!(task.metadata["ctx"]["zone"], "b");
        assert_eq!(task.metadata["count"], 2);
    }
}
