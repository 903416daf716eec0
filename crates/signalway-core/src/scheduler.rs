//! Deadline-driven escalation scheduler.
//!
//! `sweep` is a single idempotent operation meant to be invoked periodically
//! by an external trigger. Two independent passes:
//!
//! * **Pass A** escalates unresolved tasks whose reactivity deadline has
//!   passed. Escalating consumes the deadline, so a re-run with no time
//!   change finds no due row for the same task.
//! * **Pass B** steps active escalation instances whose `next_fire_at` has
//!   passed, executing every action of the current step with partial-failure
//!   semantics: one failing action never blocks the next.
//!
//! Failures are isolated per row and collected into the report; a bad row
//! never aborts the sweep for the rest of the batch. The sweep is expected
//! to run as a singleton per deployment; the row limits bound one cycle's
//! blast radius, they do not provide exclusivity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::escalation::{EscalationEvent, EscalationInstance, PolicySource, StepAction};
use crate::flag::{self, FlagContext};
use crate::notify::{NotificationSink, NotifyEvent};
use crate::store::{EventStore, FlagStore, InstanceStore, TaskStore};
use crate::task::Task;
use crate::types::{Severity, TaskStatus};

/// Per-org kill switch: when this flag evaluates enabled for the sweep's
/// scope, the sweep reports itself skipped and does nothing.
pub const SWEEP_PAUSED_FLAG: &str = "sweep.paused";

// ---------------------------------------------------------------------------
// SweepLimits / SweepReport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SweepLimits {
    pub max_tasks: usize,
    pub max_instances: usize,
}

impl Default for SweepLimits {
    fn default() -> Self {
        Self {
            max_tasks: 200,
            max_instances: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepFailure {
    /// Task or instance key the failure belongs to, or a pass marker when a
    /// whole query failed.
    pub row: String,
    pub error: String,
}

/// Outcome of one sweep cycle. The metric fields are consumed by an alerting
/// collaborator; the scheduler itself decides no thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub skipped: bool,
    pub tasks_escalated: u32,
    pub overdue_unresolved: u32,
    pub overdue_critical: u32,
    /// `max(now - deadline)` over the overdue tasks seen this cycle, seconds.
    pub max_delay_seconds: i64,
    pub instances_advanced: u32,
    pub instances_completed: u32,
    pub instances_cancelled: u32,
    pub events_recorded: u32,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, row: impl Into<String>, error: impl std::fmt::Display) {
        self.failures.push(SweepFailure {
            row: row.into(),
            error: error.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler<'a> {
    tasks: &'a dyn TaskStore,
    instances: &'a dyn InstanceStore,
    events: &'a dyn EventStore,
    policies: &'a dyn PolicySource,
    flags: &'a dyn FlagStore,
    notifier: &'a dyn NotificationSink,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        tasks: &'a dyn TaskStore,
        instances: &'a dyn InstanceStore,
        events: &'a dyn EventStore,
        policies: &'a dyn PolicySource,
        flags: &'a dyn FlagStore,
        notifier: &'a dyn NotificationSink,
    ) -> Self {
        Self {
            tasks,
            instances,
            events,
            policies,
            flags,
            notifier,
        }
    }

    /// Run one sweep cycle. Never fails as a whole: pass- and row-level
    /// errors land in the report's failure list.
    pub fn sweep(
        &self,
        now: DateTime<Utc>,
        org_scope: Option<&str>,
        limits: SweepLimits,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        if self.sweep_paused(org_scope, now) {
            report.skipped = true;
            return report;
        }

        self.deadline_pass(now, org_scope, limits.max_tasks, &mut report);
        self.policy_pass(now, org_scope, limits.max_instances, &mut report);
        report
    }

    fn sweep_paused(&self, org_scope: Option<&str>, now: DateTime<Utc>) -> bool {
        let rows = match self.flags.flags() {
            Ok(rows) => rows,
            Err(err) => {
                // Flag store trouble must not stop escalations.
                warn!(%err, "flag lookup failed during sweep, assuming not paused");
                return false;
            }
        };
        let ctx = FlagContext {
            organization_id: org_scope.map(str::to_string),
            ..FlagContext::default()
        };
        flag::is_enabled(flag::effective(&rows, SWEEP_PAUSED_FLAG, org_scope), &ctx, now)
    }

    // -----------------------------------------------------------------------
    // Pass A: deadline sweep
    // -----------------------------------------------------------------------

    fn deadline_pass(
        &self,
        now: DateTime<Utc>,
        org_scope: Option<&str>,
        limit: usize,
        report: &mut SweepReport,
    ) {
        let due = match self.tasks.due_tasks(now, org_scope, limit) {
            Ok(due) => due,
            Err(err) => {
                report.fail("<deadline pass>", err);
                return;
            }
        };

        for mut task in due {
            // Re-check against `now`; the row may have changed since the query.
            let Some(deadline) = task.reactivity_deadline_at else {
                continue;
            };
            if deadline > now || !task.is_unresolved() {
                continue;
            }

            report.overdue_unresolved += 1;
            if task.severity == Severity::Critical {
                report.overdue_critical += 1;
            }
            let delay = (now - deadline).num_seconds();
            report.max_delay_seconds = report.max_delay_seconds.max(delay);

            let key = task.key();
            if let Err(err) = task.escalate(now) {
                report.fail(&key, err);
                continue;
            }
            // Consume the deadline: the breach has been acted on, and the
            // next sweep must not escalate this task again for it.
            task.reactivity_deadline_at = None;
            if let Err(err) = self.tasks.put_task(&task) {
                report.fail(&key, err);
                continue;
            }
            report.tasks_escalated += 1;

            if let Err(err) = self.notifier.send(&task, &NotifyEvent::Escalated) {
                // Advisory outcome: log, never fail the escalation.
                warn!(task = %key, %err, "escalation notification failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Pass B: policy stepping
    // -----------------------------------------------------------------------

    fn policy_pass(
        &self,
        now: DateTime<Utc>,
        org_scope: Option<&str>,
        limit: usize,
        report: &mut SweepReport,
    ) {
        let due = match self.instances.due_instances(now, org_scope, limit) {
            Ok(due) => due,
            Err(err) => {
                report.fail("<policy pass>", err);
                return;
            }
        };

        for mut instance in due {
            let id = instance.id.to_string();
            if let Err(err) = self.step_instance(&mut instance, now, report) {
                report.fail(&id, err);
            }
        }
    }

    fn step_instance(
        &self,
        instance: &mut EscalationInstance,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let task = self
            .tasks
            .task(&instance.organization_id, instance.task_id)?;

        // A vanished task gets the same fail-closed treatment as a vanished
        // policy: finish the instance rather than retry it forever.
        let Some(mut task) = task else {
            warn!(instance = %instance.id, "task missing for instance, completing");
            instance.complete(now);
            self.instances.put_instance(instance)?;
            report.instances_completed += 1;
            return Ok(());
        };

        if !task.is_unresolved() {
            instance.cancel(now);
            self.instances.put_instance(instance)?;
            report.instances_cancelled += 1;
            return Ok(());
        }

        let Some(policy) = self.policies.policy(&instance.policy) else {
            warn!(instance = %instance.id, policy = %instance.policy, "policy missing, completing instance");
            instance.complete(now);
            self.instances.put_instance(instance)?;
            report.instances_completed += 1;
            return Ok(());
        };

        let Some(step) = policy.step(instance.current_step_index) else {
            instance.complete(now);
            self.instances.put_instance(instance)?;
            report.instances_completed += 1;
            return Ok(());
        };

        // Execute every action of the current step. One failure is recorded
        // and the rest still run.
        for action in &step.actions {
            let outcome = self.apply_step_action(&mut task, action, now);
            let (success, detail) = match outcome {
                Ok(()) => (true, None),
                Err(err) => (false, Some(err.to_string())),
            };
            let event = EscalationEvent::record(instance, action, success, detail, now);
            if let Err(err) = self.events.append_event(&event) {
                warn!(instance = %instance.id, %err, "failed to record escalation event");
            } else {
                report.events_recorded += 1;
            }
        }
        self.tasks.put_task(&task)?;

        instance.advance(policy, now);
        self.instances.put_instance(instance)?;
        match instance.status.is_active() {
            true => report.instances_advanced += 1,
            false => report.instances_completed += 1,
        }
        Ok(())
    }

    fn apply_step_action(
        &self,
        task: &mut Task,
        action: &StepAction,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match action {
            StepAction::NotifyRole { role } => self.notifier.send(
                task,
                &NotifyEvent::Role { role: role.clone() },
            ),
            StepAction::NotifyUser { user_id } => self.notifier.send(
                task,
                &NotifyEvent::User {
                    user_id: user_id.clone(),
                },
            ),
            StepAction::AutoReassign { role } => task.assign(role.clone(), now),
            StepAction::UpdateMetadata { patch } => {
                task.merge_metadata(patch, now);
                Ok(())
            }
            StepAction::RaiseSeverity { severity } => {
                task.severity = severity.unwrap_or_else(|| task.severity.raised());
                task.updated_at = now;
                Ok(())
            }
            StepAction::AutoClose => {
                // Completed is not reachable from every unresolved status in
                // one hop; go through in_progress where the table needs it.
                if !task.status.can_transition_to(TaskStatus::Completed) {
                    task.update_status(TaskStatus::InProgress, now)?;
                }
                task.update_status(TaskStatus::Completed, now)?;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
