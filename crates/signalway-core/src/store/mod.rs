//! Persistence seams.
//!
//! The core reads and writes through these narrow traits; the embedded redb
//! implementation lives in [`db`], an in-memory one in [`memory`]. Tasks are
//! never deleted; terminal rows are retained for audit.

pub mod db;
pub mod memory;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, SignalwayError};
use crate::escalation::{EscalationEvent, EscalationInstance};
use crate::flag::FeatureFlag;
use crate::task::Task;

// ---------------------------------------------------------------------------
// TaskStore
// ---------------------------------------------------------------------------

pub trait TaskStore {
    /// Insert or replace a task by id.
    fn put_task(&self, task: &Task) -> Result<()>;

    fn task(&self, organization_id: &str, id: Uuid) -> Result<Option<Task>>;

    /// Unresolved tasks whose reactivity deadline is `<= now`, ascending by
    /// deadline, capped at `limit`. Tasks without a deadline never appear.
    fn due_tasks(&self, now: DateTime<Utc>, org_scope: Option<&str>, limit: usize)
        -> Result<Vec<Task>>;

    /// All tasks, newest first.
    fn tasks(&self, org_scope: Option<&str>) -> Result<Vec<Task>>;
}

// ---------------------------------------------------------------------------
// InstanceStore
// ---------------------------------------------------------------------------

pub trait InstanceStore {
    fn put_instance(&self, instance: &EscalationInstance) -> Result<()>;

    fn instance(&self, id: Uuid) -> Result<Option<EscalationInstance>>;

    /// Active instances (`scheduled`/`in_progress`) with `next_fire_at <= now`,
    /// ascending by fire time, capped at `limit`.
    fn due_instances(
        &self,
        now: DateTime<Utc>,
        org_scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EscalationInstance>>;

    fn instances_for_task(&self, task_id: Uuid) -> Result<Vec<EscalationInstance>>;
}

// ---------------------------------------------------------------------------
// EventStore
// ---------------------------------------------------------------------------

pub trait EventStore {
    fn append_event(&self, event: &EscalationEvent) -> Result<()>;

    fn events_for_task(&self, task_id: Uuid) -> Result<Vec<EscalationEvent>>;
}

// ---------------------------------------------------------------------------
// FlagStore
// ---------------------------------------------------------------------------

pub trait FlagStore {
    /// Insert or replace the row for `(code, organization_id)`.
    fn put_flag(&self, flag: &FeatureFlag) -> Result<()>;

    /// Every flag row; override resolution happens in [`crate::flag`].
    fn flags(&self) -> Result<Vec<FeatureFlag>>;
}

// ---------------------------------------------------------------------------
// Typed lookups
// ---------------------------------------------------------------------------

/// Fetch a task, surfacing a typed not-found error.
pub fn require_task(store: &dyn TaskStore, organization_id: &str, id: Uuid) -> Result<Task> {
    store
        .task(organization_id, id)?
        .ok_or_else(|| SignalwayError::TaskNotFound(format!("{organization_id}/{id}")))
}

/// Fetch an escalation instance, surfacing a typed not-found error.
pub fn require_instance(store: &dyn InstanceStore, id: Uuid) -> Result<EscalationInstance> {
    store
        .instance(id)?
        .ok_or_else(|| SignalwayError::InstanceNotFound(id.to_string()))
}
