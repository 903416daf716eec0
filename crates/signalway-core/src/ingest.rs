//! Signal ingest: evaluate a normalized signal against the active rule set
//! and apply the resolved actions through the task lifecycle.
//!
//! Batches are never all-or-nothing. Every action lands in exactly one of
//! three buckets (applied, failed, skipped), and one action's failure does
//! not stop the ones after it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{Evaluation, MatchedRule, RuleSet};
use crate::error::{Result, SignalwayError};
use crate::escalation::{EscalationInstance, PolicySource};
use crate::flag::{self, FeatureFlag, FlagContext};
use crate::notify::{NotificationSink, NotifyEvent};
use crate::profile::{defaults_or_fallback, ProfileSource};
use crate::rule::Action;
use crate::signal::Signal;
use crate::store::{InstanceStore, TaskStore};
use crate::task::{Task, TaskDraft};

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Resolve the flag codes enabled for this signal's context and bake them
/// into the signal, so rule evaluation needs no further flag lookups.
pub fn normalize(mut signal: Signal, flags: &[FeatureFlag], now: DateTime<Utc>) -> Signal {
    let ctx = FlagContext {
        organization_id: Some(signal.organization_id.clone()),
        user_id: signal.user_id.clone(),
        roles: signal.roles.clone(),
    };
    signal.enabled_flags = flag::enabled_codes(flags, &ctx, now);
    signal
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRef {
    pub rule_id: String,
    pub rule_version: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAction {
    #[serde(flatten)]
    pub action: ActionRef,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub matched_rules: Vec<MatchedRule>,
    /// Final state of every task created by this batch, in creation order.
    pub tasks: Vec<Task>,
    pub applied: Vec<ActionRef>,
    pub failed: Vec<FailedAction>,
    /// Unrecognized action types: preserved, reported, never executed.
    pub skipped: Vec<ActionRef>,
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

pub struct Ingestor<'a> {
    tasks: &'a dyn TaskStore,
    instances: &'a dyn InstanceStore,
    policies: &'a dyn PolicySource,
    profiles: &'a dyn ProfileSource,
    notifier: &'a dyn NotificationSink,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        tasks: &'a dyn TaskStore,
        instances: &'a dyn InstanceStore,
        policies: &'a dyn PolicySource,
        profiles: &'a dyn ProfileSource,
        notifier: &'a dyn NotificationSink,
    ) -> Self {
        Self {
            tasks,
            instances,
            policies,
            profiles,
            notifier,
        }
    }

    /// Evaluate `signal` against `rules` and apply the resolved actions in
    /// order. Actions that need a task apply to the most recently created
    /// one in the batch.
    pub fn ingest(&self, rules: &RuleSet, signal: &Signal, now: DateTime<Utc>) -> IngestOutcome {
        let Evaluation {
            matched_rules,
            actions,
        } = rules.evaluate(signal);

        let mut outcome = IngestOutcome {
            matched_rules,
            ..IngestOutcome::default()
        };

        for resolved in actions {
            let action_ref = ActionRef {
                rule_id: resolved.rule_id.clone(),
                rule_version: resolved.rule_version.clone(),
                kind: resolved.action.kind().to_string(),
            };

            if let Action::Unrecognized { .. } = resolved.action {
                outcome.skipped.push(action_ref);
                continue;
            }

            match self.apply(&resolved.action, signal, &mut outcome.tasks, now) {
                Ok(()) => outcome.applied.push(action_ref),
                Err(err) => outcome.failed.push(FailedAction {
                    action: action_ref,
                    error: err.to_string(),
                }),
            }
        }
        outcome
    }

    fn apply(
        &self,
        action: &Action,
        signal: &Signal,
        tasks: &mut Vec<Task>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match action {
            Action::CreateTask { set } => {
                let draft = draft_from_signal(signal);
                let draft = merge_overrides(draft, set)?;
                let profile = defaults_or_fallback(self.profiles, &signal.organization_id);
                let task = Task::create(signal.organization_id.clone(), draft, &profile, now)?;
                self.tasks.put_task(&task)?;
                tasks.push(task);
                Ok(())
            }
            Action::UpdateTask { set } => {
                let task = current_task(tasks)?;
                let updated = merge_task_fields(task, set, now)?;
                self.tasks.put_task(&updated)?;
                *task = updated;
                Ok(())
            }
            Action::Route { role } => {
                let task = current_task(tasks)?;
                task.assign(role.clone(), now)?;
                self.tasks.put_task(task)
            }
            Action::Escalate => {
                let task = current_task(tasks)?;
                task.escalate(now)?;
                self.tasks.put_task(task)
            }
            Action::AttachTemplate { template } => {
                let task = current_task(tasks)?;
                let policy = self
                    .policies
                    .policy(template)
                    .ok_or_else(|| SignalwayError::PolicyNotFound(template.clone()))?;
                let instance =
                    EscalationInstance::attach(task.organization_id.clone(), task.id, policy, now);
                self.instances.put_instance(&instance)
            }
            Action::SetMetadata { patch } => {
                let task = current_task(tasks)?;
                task.merge_metadata(patch, now);
                self.tasks.put_task(task)
            }
            Action::Notify { channel } => {
                let task = current_task(tasks)?;
                self.notifier.send(
                    task,
                    &NotifyEvent::Channel {
                        channel: channel.clone(),
                    },
                )
            }
            Action::Unrecognized { .. } => Ok(()),
        }
    }
}

/// The most recently created task of the batch.
fn current_task(tasks: &mut Vec<Task>) -> Result<&mut Task> {
    tasks
        .last_mut()
        .ok_or_else(|| SignalwayError::Validation("no task created earlier in this batch".into()))
}

fn draft_from_signal(signal: &Signal) -> TaskDraft {
    TaskDraft {
        title: signal.title.clone(),
        description: signal.description.clone(),
        kind: signal.kind.clone(),
        category: signal.category.clone(),
        label: signal.canonical_label(),
        severity: signal.severity,
        source: Some(signal.source),
        created_by_user_id: signal.user_id.clone(),
        ..TaskDraft::default()
    }
}

/// Apply a field-override map onto a draft: the map is a partial draft, so
/// merging happens through the serde representation. Bad values (an unknown
/// priority, a malformed deadline) surface as validation failures.
fn merge_overrides(draft: TaskDraft, set: &serde_json::Map<String, Value>) -> Result<TaskDraft> {
    let mut value = serde_json::to_value(&draft)?;
    if let Value::Object(ref mut fields) = value {
        for (key, override_value) in set {
            fields.insert(key.clone(), override_value.clone());
        }
    }
    serde_json::from_value(value)
        .map_err(|err| SignalwayError::Validation(format!("bad field override: {err}")))
}

/// Merge overrides into an existing task, protecting identity and the
/// lifecycle-managed fields from direct writes.
fn merge_task_fields(
    task: &Task,
    set: &serde_json::Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<Task> {
    let mut value = serde_json::to_value(task)?;
    if let Value::Object(ref mut fields) = value {
        for (key, override_value) in set {
            fields.insert(key.clone(), override_value.clone());
        }
    }
    let mut updated: Task = serde_json::from_value(value)
        .map_err(|err| SignalwayError::Validation(format!("bad field override: {err}")))?;

    updated.id = task.id;
    updated.organization_id = task.organization_id.clone();
    updated.status = task.status;
    updated.escalation_level = task.escalation_level;
    updated.closed_at = task.closed_at;
    updated.created_at = task.created_at;
    updated.updated_at = now;
    Ok(updated)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
