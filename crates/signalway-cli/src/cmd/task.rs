use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use clap::Subcommand;
use signalway_core::store::db::StoreDb;
use signalway_core::store::{require_task, TaskStore};
use signalway_core::task::Task;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// List tasks, newest first
    List {
        #[arg(long, env = "SIGNALWAY_DB")]
        db: PathBuf,
        #[arg(long)]
        org: Option<String>,
    },
    /// Show full details for a single task
    Show {
        #[arg(long, env = "SIGNALWAY_DB")]
        db: PathBuf,
        org: String,
        id: String,
    },
    /// Change a task's status through the lifecycle state machine
    Status {
        #[arg(long, env = "SIGNALWAY_DB")]
        db: PathBuf,
        org: String,
        id: String,
        status: String,
    },
    /// Escalate a task
    Escalate {
        #[arg(long, env = "SIGNALWAY_DB")]
        db: PathBuf,
        org: String,
        id: String,
    },
}

pub fn run(subcmd: TaskSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TaskSubcommand::List { db, org } => list(&db, org.as_deref(), json),
        TaskSubcommand::Show { db, org, id } => show(&db, &org, &id, json),
        TaskSubcommand::Status {
            db,
            org,
            id,
            status,
        } => self::status(&db, &org, &id, &status, json),
        TaskSubcommand::Escalate { db, org, id } => escalate(&db, &org, &id, json),
    }
}

fn load(db: &StoreDb, org: &str, id: &str) -> anyhow::Result<Task> {
    let id: Uuid = id.parse().with_context(|| format!("invalid task id '{id}'"))?;
    Ok(require_task(db, org, id)?)
}

fn list(db_path: &Path, org: Option<&str>, json: bool) -> anyhow::Result<()> {
    let db = StoreDb::open(db_path)?;
    let tasks = db.tasks(org)?;
    if json {
        print_json(&tasks)?;
    } else {
        let rows = tasks
            .iter()
            .map(|t| {
                vec![
                    t.id.to_string(),
                    t.organization_id.clone(),
                    t.status.to_string(),
                    t.priority.to_string(),
                    t.severity.to_string(),
                    t.reactivity_deadline_at
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_else(|| "-".to_string()),
                    t.title.clone(),
                ]
            })
            .collect();
        print_table(
            &["id", "org", "status", "priority", "severity", "deadline", "title"],
            rows,
        );
    }
    Ok(())
}

fn show(db_path: &Path, org: &str, id: &str, _json: bool) -> anyhow::Result<()> {
    let db = StoreDb::open(db_path)?;
    let task = load(&db, org, id)?;
    print_json(&task)
}

fn status(db_path: &Path, org: &str, id: &str, status: &str, json: bool) -> anyhow::Result<()> {
    let db = StoreDb::open(db_path)?;
    let mut task = load(&db, org, id)?;
    let new_status = status.parse()?;
    let changed = task.update_status(new_status, Utc::now())?;
    db.put_task(&task)?;

    if json {
        print_json(&task)?;
    } else if changed {
        println!("task {} -> {}", task.id, task.status);
    } else {
        println!("task {} already {}", task.id, task.status);
    }
    Ok(())
}

fn escalate(db_path: &Path, org: &str, id: &str, json: bool) -> anyhow::Result<()> {
    let db = StoreDb::open(db_path)?;
    let mut task = load(&db, org, id)?;
    let level = task.escalate(Utc::now())?;
    db.put_task(&task)?;

    if json {
        print_json(&task)?;
    } else {
        println!("task {} escalated to level {level}", task.id);
    }
    Ok(())
}
