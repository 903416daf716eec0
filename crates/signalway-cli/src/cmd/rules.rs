use crate::cmd::read_file;
use crate::output::print_json;
use anyhow::bail;
use clap::Subcommand;
use signalway_core::engine::{IssueLevel, RuleSet};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum RulesSubcommand {
    /// Validate rule files and report per-rule issues
    Validate {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

pub fn run(subcmd: RulesSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        RulesSubcommand::Validate { files } => validate(&files, json),
    }
}

fn validate(files: &[PathBuf], json: bool) -> anyhow::Result<()> {
    let mut report = Vec::new();
    let mut rules_total = 0usize;
    let mut error_count = 0usize;

    for file in files {
        let (count, issues) = validate_file(file)?;
        rules_total += count;
        for issue in issues {
            if issue.level == IssueLevel::Error {
                error_count += 1;
            }
            report.push(serde_json::json!({
                "file": file.display().to_string(),
                "rule_id": issue.rule_id,
                "level": issue.level,
                "message": issue.message,
            }));
        }
    }

    if json {
        print_json(&serde_json::json!({
            "rules": rules_total,
            "errors": error_count,
            "issues": report,
        }))?;
    } else if report.is_empty() {
        println!("{rules_total} rule(s), no issues");
    } else {
        for entry in &report {
            println!(
                "{}: [{}] {}: {}",
                entry["file"].as_str().unwrap_or_default(),
                entry["level"].as_str().unwrap_or_default(),
                entry["rule_id"].as_str().unwrap_or_default(),
                entry["message"].as_str().unwrap_or_default()
            );
        }
    }

    if error_count > 0 {
        bail!("{error_count} rule error(s)");
    }
    Ok(())
}

fn validate_file(
    path: &Path,
) -> anyhow::Result<(usize, Vec<signalway_core::engine::RuleIssue>)> {
    let content = read_file(path)?;
    let set = RuleSet::from_yaml_str(&content)?;
    Ok((set.len(), set.validate()))
}
