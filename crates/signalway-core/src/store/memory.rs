//! In-memory store, used by tests and as the simplest wiring for embedding.
//!
//! Each collection sits behind its own `RwLock`, which also provides the
//! per-entity write serialization the lifecycle requires.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;
use crate::escalation::{EscalationEvent, EscalationInstance};
use crate::flag::FeatureFlag;
use crate::task::Task;

use super::{EventStore, FlagStore, InstanceStore, TaskStore};

#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<(String, Uuid), Task>>,
    instances: RwLock<HashMap<Uuid, EscalationInstance>>,
    events: RwLock<Vec<EscalationEvent>>,
    flags: RwLock<Vec<FeatureFlag>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn org_matches(org_scope: Option<&str>, organization_id: &str) -> bool {
    org_scope.map_or(true, |scope| scope == organization_id)
}

impl TaskStore for MemoryStore {
    fn put_task(&self, task: &Task) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        tasks.insert((task.organization_id.clone(), task.id), task.clone());
        Ok(())
    }

    fn task(&self, organization_id: &str, id: Uuid) -> Result<Option<Task>> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        Ok(tasks.get(&(organization_id.to_string(), id)).cloned())
    }

    fn due_tasks(
        &self,
        now: DateTime<Utc>,
        org_scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        let mut due: Vec<Task> = tasks
            .values()
            .filter(|t| t.is_unresolved())
            .filter(|t| t.reactivity_deadline_at.is_some_and(|d| d <= now))
            .filter(|t| org_matches(org_scope, &t.organization_id))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.reactivity_deadline_at);
        due.truncate(limit);
        Ok(due)
    }

    fn tasks(&self, org_scope: Option<&str>) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        let mut all: Vec<Task> = tasks
            .values()
            .filter(|t| org_matches(org_scope, &t.organization_id))
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

impl InstanceStore for MemoryStore {
    fn put_instance(&self, instance: &EscalationInstance) -> Result<()> {
        let mut instances = self.instances.write().unwrap_or_else(|p| p.into_inner());
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    fn instance(&self, id: Uuid) -> Result<Option<EscalationInstance>> {
        let instances = self.instances.read().unwrap_or_else(|p| p.into_inner());
        Ok(instances.get(&id).cloned())
    }

    fn due_instances(
        &self,
        now: DateTime<Utc>,
        org_scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EscalationInstance>> {
        let instances = self.instances.read().unwrap_or_else(|p| p.into_inner());
        let mut due: Vec<EscalationInstance> = instances
            .values()
            .filter(|i| i.status.is_active())
            .filter(|i| i.next_fire_at <= now)
            .filter(|i| org_matches(org_scope, &i.organization_id))
            .cloned()
            .collect();
        due.sort_by_key(|i| i.next_fire_at);
        due.truncate(limit);
        Ok(due)
    }

    fn instances_for_task(&self, task_id: Uuid) -> Result<Vec<EscalationInstance>> {
        let instances = self.instances.read().unwrap_or_else(|p| p.into_inner());
        let mut found: Vec<EscalationInstance> = instances
            .values()
            .filter(|i| i.task_id == task_id)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }
}

impl EventStore for MemoryStore {
    fn append_event(&self, event: &EscalationEvent) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(|p| p.into_inner());
        events.push(event.clone());
        Ok(())
    }

    fn events_for_task(&self, task_id: Uuid) -> Result<Vec<EscalationEvent>> {
        let events = self.events.read().unwrap_or_else(|p| p.into_inner());
        Ok(events
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }
}

impl FlagStore for MemoryStore {
    fn put_flag(&self, flag: &FeatureFlag) -> Result<()> {
        let mut flags = self.flags.write().unwrap_or_else(|p| p.into_inner());
        flags.retain(|f| !(f.code == flag.code && f.organization_id == flag.organization_id));
        flags.push(flag.clone());
        Ok(())
    }

    fn flags(&self) -> Result<Vec<FeatureFlag>> {
        let flags = self.flags.read().unwrap_or_else(|p| p.into_inner());
        Ok(flags.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
