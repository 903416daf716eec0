//! Escalation policies and their runtime tracking.
//!
//! A policy is external, read-only configuration: an ordered list of steps,
//! each a wait time (relative to the previous step) plus the actions to run.
//! An `EscalationInstance` tracks one task's progress through one policy and
//! is the unit the scheduler's policy-stepping pass operates on.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::Result;
use crate::types::Severity;

// ---------------------------------------------------------------------------
// StepAction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    NotifyRole {
        role: String,
    },
    NotifyUser {
        user_id: String,
    },
    AutoReassign {
        role: String,
    },
    UpdateMetadata {
        patch: Map<String, Value>,
    },
    /// Raise severity to `severity`, or one step up when omitted.
    RaiseSeverity {
        #[serde(default)]
        severity: Option<Severity>,
    },
    AutoClose,
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::NotifyRole { .. } => "notify_role",
            StepAction::NotifyUser { .. } => "notify_user",
            StepAction::AutoReassign { .. } => "auto_reassign",
            StepAction::UpdateMetadata { .. } => "update_metadata",
            StepAction::RaiseSeverity { .. } => "raise_severity",
            StepAction::AutoClose => "auto_close",
        }
    }
}

// ---------------------------------------------------------------------------
// EscalationPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Seconds to wait after the previous step. Omitted: the policy default.
    #[serde(default)]
    pub wait_seconds: Option<u64>,
    pub actions: Vec<StepAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub name: String,
    #[serde(default = "default_wait_seconds")]
    pub default_wait_seconds: u64,
    pub steps: Vec<EscalationStep>,
}

fn default_wait_seconds() -> u64 {
    3_600
}

impl EscalationPolicy {
    pub fn step(&self, index: u32) -> Option<&EscalationStep> {
        self.steps.get(index as usize)
    }

    pub fn wait_for(&self, step: &EscalationStep) -> u64 {
        step.wait_seconds.unwrap_or(self.default_wait_seconds)
    }
}

/// Named policies loaded from a YAML sequence.
#[derive(Debug, Clone, Default)]
pub struct Policies {
    by_name: HashMap<String, EscalationPolicy>,
}

impl Policies {
    pub fn new(policies: Vec<EscalationPolicy>) -> Self {
        let by_name = policies.into_iter().map(|p| (p.name.clone(), p)).collect();
        Self { by_name }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let policies: Vec<EscalationPolicy> = serde_yaml::from_str(content)?;
        Ok(Self::new(policies))
    }

    pub fn get(&self, name: &str) -> Option<&EscalationPolicy> {
        self.by_name.get(name)
    }
}

/// Read-only policy lookup for the scheduler.
pub trait PolicySource {
    fn policy(&self, name: &str) -> Option<&EscalationPolicy>;
}

impl PolicySource for Policies {
    fn policy(&self, name: &str) -> Option<&EscalationPolicy> {
        self.get(name)
    }
}

// ---------------------------------------------------------------------------
// InstanceStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceStatus::Scheduled => "scheduled",
            InstanceStatus::InProgress => "in_progress",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }

    /// Active instances are the ones a sweep may step.
    pub fn is_active(self) -> bool {
        matches!(self, InstanceStatus::Scheduled | InstanceStatus::InProgress)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// EscalationInstance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationInstance {
    pub id: Uuid,
    pub organization_id: String,
    pub task_id: Uuid,
    pub policy: String,
    pub current_step_index: u32,
    pub status: InstanceStatus,
    pub next_fire_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscalationInstance {
    /// Attach `policy` to a task. A zero-step policy completes immediately.
    pub fn attach(
        organization_id: impl Into<String>,
        task_id: Uuid,
        policy: &EscalationPolicy,
        now: DateTime<Utc>,
    ) -> EscalationInstance {
        let (status, next_fire_at) = match policy.steps.first() {
            Some(step) => (
                InstanceStatus::Scheduled,
                now + Duration::seconds(policy.wait_for(step) as i64),
            ),
            None => (InstanceStatus::Completed, now),
        };
        EscalationInstance {
            id: Uuid::new_v4(),
            organization_id: organization_id.into(),
            task_id,
            policy: policy.name.clone(),
            current_step_index: 0,
            status,
            next_fire_at,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move past the just-executed step: point at the next one and schedule
    /// its fire time, or complete when no step remains.
    pub fn advance(&mut self, policy: &EscalationPolicy, now: DateTime<Utc>) {
        let next_index = self.current_step_index + 1;
        match policy.step(next_index) {
            Some(step) => {
                self.current_step_index = next_index;
                self.status = InstanceStatus::InProgress;
                self.next_fire_at = now + Duration::seconds(policy.wait_for(step) as i64);
            }
            None => {
                self.status = InstanceStatus::Completed;
            }
        }
        self.updated_at = now;
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Completed;
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = InstanceStatus::Cancelled;
        self.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// EscalationEvent
// ---------------------------------------------------------------------------

/// One record per executed step action, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub id: Uuid,
    pub organization_id: String,
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub step_index: u32,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl EscalationEvent {
    pub fn record(
        instance: &EscalationInstance,
        action: &StepAction,
        success: bool,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) -> EscalationEvent {
        EscalationEvent {
            id: Uuid::new_v4(),
            organization_id: instance.organization_id.clone(),
            instance_id: instance.id,
            task_id: instance.task_id,
            step_index: instance.current_step_index,
            action: action.kind().to_string(),
            success,
            detail,
            at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    const POLICY: &str = r#"
- name: incident-default
  default_wait_seconds: 900
  steps:
    - wait_seconds: 0
      actions:
        - type: notify_role
          role: on-call
    - wait_seconds: 3600
      actions:
        - type: raise_severity
        - type: auto_reassign
          role: ops-lead
    - actions:
        - type: auto_close
"#;

    fn policy() -> EscalationPolicy {
        Policies::from_yaml_str(POLICY)
            .unwrap()
            .get("incident-default")
            .unwrap()
            .clone()
    }

    #[test]
    fn policy_parses_steps_in_order() {
        let p = policy();
        assert_eq!(p.steps.len(), 3);
        assert_eq!(p.wait_for(&p.steps[0]), 0);
        assert_eq!(p.wait_for(&p.steps[1]), 3_600);
        // third step omits wait_seconds -> policy default
        assert_eq!(p.wait_for(&p.steps[2]), 900);
        assert_eq!(p.steps[1].actions[0].kind(), "raise_severity");
    }

    #[test]
    fn attach_schedules_first_step() {
        let instance = EscalationInstance::attach("acme", Uuid::new_v4(), &policy(), t0());
        assert_eq!(instance.status, InstanceStatus::Scheduled);
        assert_eq!(instance.current_step_index, 0);
        assert_eq!(instance.next_fire_at, t0());
    }

    #[test]
    fn attach_empty_policy_completes_immediately() {
        let empty = EscalationPolicy {
            name: "noop".into(),
            default_wait_seconds: 60,
            steps: Vec::new(),
        };
        let instance = EscalationInstance::attach("acme", Uuid::new_v4(), &empty, t0());
        assert_eq!(instance.status, InstanceStatus::Completed);
    }

    #[test]
    fn advance_walks_steps_then_completes() {
        let p = policy();
        let mut instance = EscalationInstance::attach("acme", Uuid::new_v4(), &p, t0());

        instance.advance(&p, t0());
        assert_eq!(instance.current_step_index, 1);
        assert_eq!(instance.status, InstanceStatus::InProgress);
        assert_eq!(instance.next_fire_at, t0() + Duration::seconds(3_600));

        let later = t0() + Duration::seconds(3_600);
        instance.advance(&p, later);
        assert_eq!(instance.current_step_index, 2);
        assert_eq!(instance.next_fire_at, later + Duration::seconds(900));

        instance.advance(&p, later);
        assert_eq!(instance.status, InstanceStatus::Completed);
        // index stays on the last executed step
        assert_eq!(instance.current_step_index, 2);
    }

    #[test]
    fn active_statuses() {
        assert!(InstanceStatus::Scheduled.is_active());
        assert!(InstanceStatus::InProgress.is_active());
        assert!(!InstanceStatus::Completed.is_active());
        assert!(!InstanceStatus::Cancelled.is_active());
    }
}
