//! Normalized signal: the evaluation context for the rule engine.
//!
//! A signal is built once at the ingest boundary and is self-contained:
//! rule evaluation reads only this value, which keeps `evaluate` a pure
//! function that can be replayed for dry runs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::types::{Severity, SignalSource};

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub organization_id: String,
    pub source: SignalSource,
    /// Domain type, e.g. "incident" vs "request".
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub severity: Option<Severity>,
    /// Dotted classification label, e.g. "200.31.4".
    #[serde(default)]
    pub label: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Flag codes resolved as enabled for this context at normalization time.
    /// Precomputed so rule evaluation needs no flag lookups.
    #[serde(default)]
    pub enabled_flags: BTreeSet<String>,
}

impl Signal {
    /// Trimmed, lowercased label used for prefix and numeric-base matching.
    pub fn canonical_label(&self) -> Option<String> {
        self.label
            .as_deref()
            .map(|l| l.trim().to_lowercase())
            .filter(|l| !l.is_empty())
    }

    /// Lowercase haystack for keyword matching: title, description, and the
    /// serialized payload concatenated.
    pub fn keyword_haystack(&self) -> String {
        let mut haystack = String::new();
        haystack.push_str(&self.title);
        haystack.push('\n');
        if let Some(ref description) = self.description {
            haystack.push_str(description);
            haystack.push('\n');
        }
        if !self.payload.is_null() {
            haystack.push_str(&self.payload.to_string());
        }
        haystack.to_lowercase()
    }

    pub fn flag_enabled(&self, code: &str) -> bool {
        self.enabled_flags.contains(code)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> Signal {
        Signal {
            organization_id: "acme".into(),
            source: SignalSource::Api,
            kind: Some("incident".into()),
            category: Some("infra".into()),
            severity: Some(Severity::Major),
            label: Some("  200.31.4 ".into()),
            title: "DB replica Lagging".into(),
            description: Some("Replication delay above threshold".into()),
            payload: serde_json::json!({"host": "db-07", "lag_seconds": 340}),
            user_id: None,
            roles: Vec::new(),
            enabled_flags: BTreeSet::new(),
        }
    }

    #[test]
    fn canonical_label_trims_and_lowercases() {
        assert_eq!(signal().canonical_label().unwrap(), "200.31.4");
    }

    #[test]
    fn empty_label_is_none() {
        let mut s = signal();
        s.label = Some("   ".into());
        assert!(s.canonical_label().is_none());
    }

    #[test]
    fn haystack_covers_title_description_payload() {
        let haystack = signal().keyword_haystack();
        assert!(haystack.contains("db replica lagging"));
        assert!(haystack.contains("replication delay"));
        assert!(haystack.contains("db-07"));
        assert_eq!(haystack, haystack.to_lowercase());
    }

    #[test]
    fn null_payload_is_skipped() {
        let mut s = signal();
        s.payload = Value::Null;
        assert!(!s.keyword_haystack().contains("null"));
    }
}
