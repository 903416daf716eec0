use crate::cmd::{parse_at, read_file};
use crate::output::print_json;
use signalway_core::engine::RuleSet;
use signalway_core::ingest::normalize;
use signalway_core::signal::Signal;
use signalway_core::{flag, flag::FeatureFlag};
use std::path::Path;

/// Evaluate a signal against a rule set and print the resolved actions.
/// Pure dry run: identical inputs produce byte-identical output.
pub fn run(
    rules_path: &Path,
    signal_path: &Path,
    flags_path: Option<&Path>,
    at: Option<&str>,
) -> anyhow::Result<()> {
    let now = parse_at(at)?;
    let rules = RuleSet::from_yaml_str(&read_file(rules_path)?)?;
    let signal: Signal = serde_yaml::from_str(&read_file(signal_path)?)?;

    let flags: Vec<FeatureFlag> = match flags_path {
        Some(path) => flag::from_yaml_str(&read_file(path)?)?,
        None => Vec::new(),
    };
    let signal = normalize(signal, &flags, now);

    print_json(&rules.evaluate(&signal))
}
