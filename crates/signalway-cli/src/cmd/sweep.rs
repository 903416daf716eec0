use crate::cmd::{parse_at, read_file};
use crate::output::print_json;
use signalway_core::escalation::Policies;
use signalway_core::notify::LogSink;
use signalway_core::scheduler::{Scheduler, SweepLimits};
use signalway_core::store::db::StoreDb;
use std::path::Path;

pub fn run(
    db_path: &Path,
    policies_path: Option<&Path>,
    org: Option<&str>,
    limit_tasks: usize,
    limit_instances: usize,
    at: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let now = parse_at(at)?;
    let db = StoreDb::open(db_path)?;
    let policies = match policies_path {
        Some(path) => Policies::from_yaml_str(&read_file(path)?)?,
        None => Policies::default(),
    };

    let sink = LogSink;
    let scheduler = Scheduler::new(&db, &db, &db, &policies, &db, &sink);
    let report = scheduler.sweep(
        now,
        org,
        SweepLimits {
            max_tasks: limit_tasks,
            max_instances: limit_instances,
        },
    );

    if json {
        print_json(&report)?;
    } else if report.skipped {
        println!("sweep skipped (paused)");
    } else {
        println!(
            "escalated {} task(s) ({} overdue, {} critical, max delay {}s)",
            report.tasks_escalated,
            report.overdue_unresolved,
            report.overdue_critical,
            report.max_delay_seconds
        );
        println!(
            "instances: {} advanced, {} completed, {} cancelled; {} event(s)",
            report.instances_advanced,
            report.instances_completed,
            report.instances_cancelled,
            report.events_recorded
        );
        for failure in &report.failures {
            println!("failed {}: {}", failure.row, failure.error);
        }
    }
    Ok(())
}
