use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

const RULES: &str = r#"
- id: incident-intake
  version: "1"
  match:
    category: incident
    severity: major
  actions:
    - type: create_task
      set:
        priority: high
        reactivity_duration: "60"
    - type: route
      role: on-call
"#;

const SIGNAL: &str = r#"
organization_id: acme
source: api
category: incident
severity: major
title: Checkout errors spiking
"#;

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn signalway() -> Command {
    Command::cargo_bin("signalway").unwrap()
}

#[test]
fn rules_validate_accepts_a_clean_file() {
    let dir = TempDir::new().unwrap();
    let rules = write(dir.path(), "rules.yaml", RULES);

    signalway()
        .args(["rules", "validate"])
        .arg(&rules)
        .assert()
        .success()
        .stdout(predicate::str::contains("no issues"));
}

#[test]
fn rules_validate_fails_on_missing_required_fields() {
    let dir = TempDir::new().unwrap();
    let rules = write(
        dir.path(),
        "rules.yaml",
        "- id: broken\n  version: '1'\n  actions:\n    - type: route\n",
    );

    signalway()
        .args(["rules", "validate"])
        .arg(&rules)
        .assert()
        .failure()
        .stderr(predicate::str::contains("rule error"));
}

#[test]
fn simulate_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let rules = write(dir.path(), "rules.yaml", RULES);
    let signal = write(dir.path(), "signal.yaml", SIGNAL);

    let run = || {
        signalway()
            .args(["simulate", "--rules"])
            .arg(&rules)
            .arg("--signal")
            .arg(&signal)
            .args(["--at", "2024-05-01T08:00:00Z"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone()
    };

    let first = run();
    let second = run();
    assert_eq!(first, second);
    let text = String::from_utf8(first).unwrap();
    assert!(text.contains("create_task"));
    assert!(text.contains("incident-intake"));
}

#[test]
fn ingest_then_sweep_escalates_overdue_tasks() {
    let dir = TempDir::new().unwrap();
    let rules = write(dir.path(), "rules.yaml", RULES);
    let signal = write(dir.path(), "signal.yaml", SIGNAL);
    let db = dir.path().join("signalway.redb");

    signalway()
        .args(["ingest", "--db"])
        .arg(&db)
        .arg("--rules")
        .arg(&rules)
        .arg("--signal")
        .arg(&signal)
        .args(["--at", "2024-05-01T08:00:00Z", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"failed\": []"));

    // The 60 s reactivity window has long passed an hour later.
    signalway()
        .args(["sweep", "--db"])
        .arg(&db)
        .args(["--at", "2024-05-01T09:00:00Z", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tasks_escalated\": 1"));

    // Idempotent: a second sweep at the same time finds nothing due.
    signalway()
        .args(["sweep", "--db"])
        .arg(&db)
        .args(["--at", "2024-05-01T09:00:00Z", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tasks_escalated\": 0"));

    signalway()
        .args(["task", "list", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("escalated"));
}

#[test]
fn flag_check_reads_a_file() {
    let dir = TempDir::new().unwrap();
    let flags = write(
        dir.path(),
        "flags.yaml",
        r#"
- code: new-routing
  enabled: true
  rollout:
    type: percentage
    percentage: 100
"#,
    );

    signalway()
        .args(["flag", "check", "--flags"])
        .arg(&flags)
        .args(["--code", "new-routing", "--org", "acme"])
        .assert()
        .success()
        .stdout(predicate::str::contains("enabled"));
}
