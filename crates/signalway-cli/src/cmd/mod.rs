pub mod flag;
pub mod ingest;
pub mod rules;
pub mod simulate;
pub mod sweep;
pub mod task;

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::Path;

/// Parse an optional RFC 3339 timestamp, defaulting to now.
pub fn parse_at(at: Option<&str>) -> anyhow::Result<DateTime<Utc>> {
    match at {
        Some(raw) => {
            let parsed = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("invalid timestamp '{raw}'"))?;
            Ok(parsed.with_timezone(&Utc))
        }
        None => Ok(Utc::now()),
    }
}

pub fn read_file(path: &Path) -> anyhow::Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
