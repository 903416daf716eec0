use crate::cmd::{parse_at, read_file};
use crate::output::print_json;
use signalway_core::engine::RuleSet;
use signalway_core::escalation::Policies;
use signalway_core::ingest::{normalize, Ingestor};
use signalway_core::notify::LogSink;
use signalway_core::profile::StaticProfiles;
use signalway_core::signal::Signal;
use signalway_core::store::db::StoreDb;
use signalway_core::store::FlagStore;
use std::path::Path;

#[allow(clippy::too_many_arguments)]
pub fn run(
    db_path: &Path,
    rules_path: &Path,
    signal_path: &Path,
    policies_path: Option<&Path>,
    profiles_path: Option<&Path>,
    at: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let now = parse_at(at)?;
    let db = StoreDb::open(db_path)?;
    let rules = RuleSet::from_yaml_str(&read_file(rules_path)?)?;
    let signal: Signal = serde_yaml::from_str(&read_file(signal_path)?)?;

    let policies = match policies_path {
        Some(path) => Policies::from_yaml_str(&read_file(path)?)?,
        None => Policies::default(),
    };
    let profiles = match profiles_path {
        Some(path) => StaticProfiles::from_yaml(&read_file(path)?)?,
        None => StaticProfiles::default(),
    };

    let signal = normalize(signal, &db.flags()?, now);
    let sink = LogSink;
    let ingestor = Ingestor::new(&db, &db, &policies, &profiles, &sink);
    let outcome = ingestor.ingest(&rules, &signal, now);

    if json {
        print_json(&outcome)?;
    } else {
        println!(
            "matched {} rule(s): {} applied, {} failed, {} skipped",
            outcome.matched_rules.len(),
            outcome.applied.len(),
            outcome.failed.len(),
            outcome.skipped.len()
        );
        for task in &outcome.tasks {
            println!("task {} [{}] {}", task.id, task.status, task.title);
        }
        for failure in &outcome.failed {
            println!(
                "failed {} (rule {}): {}",
                failure.action.kind, failure.action.rule_id, failure.error
            );
        }
    }
    Ok(())
}
