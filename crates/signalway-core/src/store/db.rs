//! Embedded persistent store using redb.
//!
//! # Table design
//!
//! Deadline-driven tables use a 24-byte composite key:
//! ```text
//! [ timestamp_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//!
//! With the timestamp in the high bytes of a big-endian encoding, byte order
//! equals timestamp order, so "all rows due by `now`" is a single range scan
//! `..=due_upper_bound(now)` with only status/org filtering left to do in
//! application code. Tasks are keyed by reactivity deadline (a task without
//! one gets a `u64::MAX` prefix and never appears in a due scan), instances
//! by `next_fire_at`, events append-only by their timestamp. Flags use a
//! plain `code\0organization` string key.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{Result, SignalwayError};
use crate::escalation::{EscalationEvent, EscalationInstance};
use crate::flag::FeatureFlag;
use crate::task::Task;

use super::{EventStore, FlagStore, InstanceStore, TaskStore};

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const TASKS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("tasks");
const INSTANCES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("instances");
const EVENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("events");
const FLAGS: TableDefinition<&str, &[u8]> = TableDefinition::new("flags");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn composite_key(ts_ms: u64, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&ts_ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

fn ts_ms(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_millis().max(0) as u64
}

fn task_key(task: &Task) -> [u8; 24] {
    // No deadline -> sorts after every reachable scan bound.
    let ms = task.reactivity_deadline_at.map(ts_ms).unwrap_or(u64::MAX);
    composite_key(ms, task.id)
}

fn instance_key(instance: &EscalationInstance) -> [u8; 24] {
    composite_key(ts_ms(instance.next_fire_at), instance.id)
}

/// Upper bound for a range scan returning all rows due by `now`. The uuid
/// suffix is `0xff` × 16, greater than any valid uuid.
fn due_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&ts_ms(now).to_be_bytes());
    key[8..].fill(0xff);
    key
}

fn flag_key(code: &str, organization_id: Option<&str>) -> String {
    format!("{code}\0{}", organization_id.unwrap_or(""))
}

fn store_err(err: impl std::fmt::Display) -> SignalwayError {
    SignalwayError::Store(err.to_string())
}

// ---------------------------------------------------------------------------
// StoreDb
// ---------------------------------------------------------------------------

/// Persistent store for tasks, escalation instances/events, and flags.
pub struct StoreDb {
    db: Database,
}

impl StoreDb {
    /// Open or create the database at `path`, creating all tables.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(TASKS).map_err(store_err)?;
        wt.open_table(INSTANCES).map_err(store_err)?;
        wt.open_table(EVENTS).map_err(store_err)?;
        wt.open_table(FLAGS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    /// Locate an existing row by uuid suffix. Full scan; rows are rekeyed
    /// when their timestamp component changes.
    fn find_key<T>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        id: Uuid,
    ) -> Result<Option<([u8; 24], T)>>
    where
        T: serde::de::DeserializeOwned,
    {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(table).map_err(store_err)?;
        for entry in table.iter().map_err(store_err)? {
            let (k, v) = entry.map_err(store_err)?;
            if k.value()[8..] == id.as_bytes()[..] {
                let mut key = [0u8; 24];
                key.copy_from_slice(k.value());
                let row: T = serde_json::from_slice(v.value())?;
                return Ok(Some((key, row)));
            }
        }
        Ok(None)
    }

    fn replace(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        old_key: Option<[u8; 24]>,
        new_key: [u8; 24],
        value: &[u8],
    ) -> Result<()> {
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(table).map_err(store_err)?;
            if let Some(old) = old_key {
                table.remove(old.as_slice()).map_err(store_err)?;
            }
            table
                .insert(new_key.as_slice(), value)
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }
}

fn org_matches(org_scope: Option<&str>, organization_id: &str) -> bool {
    org_scope.map_or(true, |scope| scope == organization_id)
}

impl TaskStore for StoreDb {
    fn put_task(&self, task: &Task) -> Result<()> {
        let existing = self.find_key::<Task>(TASKS, task.id)?.map(|(k, _)| k);
        let value = serde_json::to_vec(task)?;
        self.replace(TASKS, existing, task_key(task), &value)
    }

    fn task(&self, organization_id: &str, id: Uuid) -> Result<Option<Task>> {
        Ok(self
            .find_key::<Task>(TASKS, id)?
            .map(|(_, task)| task)
            .filter(|task| task.organization_id == organization_id))
    }

    fn due_tasks(
        &self,
        now: DateTime<Utc>,
        org_scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let upper = due_upper_bound(now);
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(TASKS).map_err(store_err)?;

        let mut due = Vec::new();
        for entry in table.range(..=upper.as_slice()).map_err(store_err)? {
            if due.len() >= limit {
                break;
            }
            let (_, v) = entry.map_err(store_err)?;
            let task: Task = serde_json::from_slice(v.value())?;
            if task.is_unresolved() && org_matches(org_scope, &task.organization_id) {
                due.push(task);
            }
        }
        Ok(due)
    }

    fn tasks(&self, org_scope: Option<&str>) -> Result<Vec<Task>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(TASKS).map_err(store_err)?;

        let mut all = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            let task: Task = serde_json::from_slice(v.value())?;
            if org_matches(org_scope, &task.organization_id) {
                all.push(task);
            }
        }
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

impl InstanceStore for StoreDb {
    fn put_instance(&self, instance: &EscalationInstance) -> Result<()> {
        let existing = self
            .find_key::<EscalationInstance>(INSTANCES, instance.id)?
            .map(|(k, _)| k);
        let value = serde_json::to_vec(instance)?;
        self.replace(INSTANCES, existing, instance_key(instance), &value)
    }

    fn instance(&self, id: Uuid) -> Result<Option<EscalationInstance>> {
        Ok(self
            .find_key::<EscalationInstance>(INSTANCES, id)?
            .map(|(_, instance)| instance))
    }

    fn due_instances(
        &self,
        now: DateTime<Utc>,
        org_scope: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EscalationInstance>> {
        let upper = due_upper_bound(now);
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(INSTANCES).map_err(store_err)?;

        let mut due = Vec::new();
        for entry in table.range(..=upper.as_slice()).map_err(store_err)? {
            if due.len() >= limit {
                break;
            }
            let (_, v) = entry.map_err(store_err)?;
            let instance: EscalationInstance = serde_json::from_slice(v.value())?;
            if instance.status.is_active() && org_matches(org_scope, &instance.organization_id) {
                due.push(instance);
            }
        }
        Ok(due)
    }

    fn instances_for_task(&self, task_id: Uuid) -> Result<Vec<EscalationInstance>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(INSTANCES).map_err(store_err)?;

        let mut found = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            let instance: EscalationInstance = serde_json::from_slice(v.value())?;
            if instance.task_id == task_id {
                found.push(instance);
            }
        }
        found.sort_by_key(|i| i.created_at);
        Ok(found)
    }
}

impl EventStore for StoreDb {
    fn append_event(&self, event: &EscalationEvent) -> Result<()> {
        let value = serde_json::to_vec(event)?;
        self.replace(EVENTS, None, composite_key(ts_ms(event.at), event.id), &value)
    }

    fn events_for_task(&self, task_id: Uuid) -> Result<Vec<EscalationEvent>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(EVENTS).map_err(store_err)?;

        let mut found = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            let event: EscalationEvent = serde_json::from_slice(v.value())?;
            if event.task_id == task_id {
                found.push(event);
            }
        }
        Ok(found)
    }
}

impl FlagStore for StoreDb {
    fn put_flag(&self, flag: &FeatureFlag) -> Result<()> {
        let key = flag_key(&flag.code, flag.organization_id.as_deref());
        let value = serde_json::to_vec(flag)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(FLAGS).map_err(store_err)?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    fn flags(&self) -> Result<Vec<FeatureFlag>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(FLAGS).map_err(store_err)?;

        let mut all = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            all.push(serde_json::from_slice(v.value())?);
        }
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::{EscalationPolicy, EscalationStep, InstanceStatus, StepAction};
    use crate::profile::OrgProfile;
    use crate::task::TaskDraft;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn open_tmp() -> (TempDir, StoreDb) {
        let dir = TempDir::new().unwrap();
        let db = StoreDb::open(&dir.path().join("signalway.redb")).unwrap();
        (dir, db)
    }

    fn task_at(db: &StoreDb, org: &str, deadline: DateTime<Utc>) -> Task {
        let draft = TaskDraft {
            title: "t".into(),
            reactivity_deadline_at: Some(deadline),
            ..TaskDraft::default()
        };
        let task = Task::create(org, draft, &OrgProfile::default(), t0()).unwrap();
        db.put_task(&task).unwrap();
        task
    }

    #[test]
    fn due_scan_returns_past_deadlines_in_order() {
        let (_dir, db) = open_tmp();
        let late = task_at(&db, "acme", t0() - Duration::minutes(5));
        let early = task_at(&db, "acme", t0() - Duration::hours(2));
        task_at(&db, "acme", t0() + Duration::hours(1));

        let due = db.due_tasks(t0(), None, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, early.id);
        assert_eq!(due[1].id, late.id);
    }

    #[test]
    fn rekey_on_deadline_clear_removes_from_due_scan() {
        let (_dir, db) = open_tmp();
        let mut task = task_at(&db, "acme", t0() - Duration::minutes(5));
        task.reactivity_deadline_at = None;
        db.put_task(&task).unwrap();

        assert!(db.due_tasks(t0(), None, 10).unwrap().is_empty());
        // still retrievable by id
        assert!(db.task("acme", task.id).unwrap().is_some());
    }

    #[test]
    fn put_task_replaces_not_duplicates() {
        let (_dir, db) = open_tmp();
        let mut task = task_at(&db, "acme", t0() - Duration::minutes(5));
        task.title = "renamed".into();
        db.put_task(&task).unwrap();

        let all = db.tasks(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "renamed");
    }

    #[test]
    fn terminal_tasks_leave_due_scan_but_are_retained() {
        let (_dir, db) = open_tmp();
        let mut task = task_at(&db, "acme", t0() - Duration::minutes(5));
        task.update_status(crate::types::TaskStatus::Cancelled, t0())
            .unwrap();
        db.put_task(&task).unwrap();

        assert!(db.due_tasks(t0(), None, 10).unwrap().is_empty());
        assert_eq!(db.tasks(None).unwrap().len(), 1);
    }

    #[test]
    fn instance_due_scan_filters_inactive() {
        let (_dir, db) = open_tmp();
        let policy = EscalationPolicy {
            name: "p".into(),
            default_wait_seconds: 60,
            steps: vec![EscalationStep {
                wait_seconds: Some(0),
                actions: vec![StepAction::AutoClose],
            }],
        };
        let mut instance =
            EscalationInstance::attach("acme", Uuid::new_v4(), &policy, t0() - Duration::hours(1));
        db.put_instance(&instance).unwrap();

        let due = db.due_instances(t0(), None, 10).unwrap();
        assert_eq!(due.len(), 1);

        instance.status = InstanceStatus::Completed;
        db.put_instance(&instance).unwrap();
        assert!(db.due_instances(t0(), None, 10).unwrap().is_empty());
    }

    #[test]
    fn events_append_and_filter_by_task() {
        let (_dir, db) = open_tmp();
        let policy = EscalationPolicy {
            name: "p".into(),
            default_wait_seconds: 60,
            steps: vec![EscalationStep {
                wait_seconds: Some(0),
                actions: vec![StepAction::AutoClose],
            }],
        };
        let instance = EscalationInstance::attach("acme", Uuid::new_v4(), &policy, t0());
        let event =
            EscalationEvent::record(&instance, &StepAction::AutoClose, true, None, t0());
        db.append_event(&event).unwrap();

        assert_eq!(db.events_for_task(instance.task_id).unwrap().len(), 1);
        assert!(db.events_for_task(Uuid::new_v4()).unwrap().is_empty());
    }

    #[test]
    fn flag_rows_key_by_code_and_org() {
        let (_dir, db) = open_tmp();
        let global = FeatureFlag {
            code: "x".into(),
            organization_id: None,
            enabled: true,
            enabled_from: None,
            disabled_at: None,
            rollout: None,
        };
        let scoped = FeatureFlag {
            organization_id: Some("acme".into()),
            enabled: false,
            ..global.clone()
        };
        db.put_flag(&global).unwrap();
        db.put_flag(&scoped).unwrap();
        db.put_flag(&global).unwrap();

        assert_eq!(db.flags().unwrap().len(), 2);
    }
}
