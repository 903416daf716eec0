//! Declarative rule documents: match criteria and the actions they trigger.
//!
//! Actions arrive as `{type: ..., ...fields}` documents. The union is closed:
//! every known type gets a typed variant, anything else lands in
//! `Unrecognized`, which is preserved through evaluation but never executed.

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::signal::Signal;
use crate::types::{Severity, SignalSource};

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Create a task from the signal, with a field-override map.
    CreateTask { set: Map<String, Value> },
    /// Merge field overrides into the task created earlier in the batch.
    UpdateTask { set: Map<String, Value> },
    /// Route the task to a target role.
    Route { role: String },
    /// Escalate the task immediately.
    Escalate,
    /// Attach a named escalation policy to the task.
    AttachTemplate { template: String },
    /// Merge a JSON patch into the task metadata.
    SetMetadata { patch: Map<String, Value> },
    /// Emit a notification on a channel.
    Notify { channel: String },
    /// Preserved verbatim, never executed.
    Unrecognized {
        kind: String,
        fields: Map<String, Value>,
    },
}

impl Action {
    pub fn kind(&self) -> &str {
        match self {
            Action::CreateTask { .. } => "create_task",
            Action::UpdateTask { .. } => "update_task",
            Action::Route { .. } => "route",
            Action::Escalate => "escalate",
            Action::AttachTemplate { .. } => "attach_template",
            Action::SetMetadata { .. } => "set_metadata",
            Action::Notify { .. } => "notify",
            Action::Unrecognized { kind, .. } => kind,
        }
    }

    fn from_raw(raw: RawAction) -> Action {
        let RawAction { kind, fields } = raw;

        let object = |fields: &Map<String, Value>, key: &str| -> Map<String, Value> {
            match fields.get(key) {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            }
        };
        let string = |fields: &Map<String, Value>, key: &str| -> String {
            fields
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        match kind.as_str() {
            "create_task" => Action::CreateTask {
                set: object(&fields, "set"),
            },
            "update_task" => Action::UpdateTask {
                set: object(&fields, "set"),
            },
            "route" => Action::Route {
                role: string(&fields, "role"),
            },
            "escalate" => Action::Escalate,
            "attach_template" => Action::AttachTemplate {
                template: string(&fields, "template"),
            },
            "set_metadata" => Action::SetMetadata {
                patch: object(&fields, "patch"),
            },
            "notify" => Action::Notify {
                channel: string(&fields, "channel"),
            },
            _ => Action::Unrecognized { kind, fields },
        }
    }
}

/// Wire carrier: `type` plus whatever other fields the document had.
#[derive(Deserialize)]
struct RawAction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Action::from_raw(RawAction::deserialize(deserializer)?))
    }
}

impl Serialize for Action {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind())?;
        match self {
            Action::CreateTask { set } | Action::UpdateTask { set } => {
                map.serialize_entry("set", set)?;
            }
            Action::Route { role } => map.serialize_entry("role", role)?,
            Action::Escalate => {}
            Action::AttachTemplate { template } => map.serialize_entry("template", template)?,
            Action::SetMetadata { patch } => map.serialize_entry("patch", patch)?,
            Action::Notify { channel } => map.serialize_entry("channel", channel)?,
            Action::Unrecognized { fields, .. } => {
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
            }
        }
        map.end()
    }
}

// ---------------------------------------------------------------------------
// MatchCriteria
// ---------------------------------------------------------------------------

/// All criteria are optional and AND-combined; an absent criterion is a
/// wildcard. String comparisons are case-insensitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SignalSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Integer parsed from the label substring before the first `.`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_numeric_base: Option<i64>,
    /// Literal prefix test on the canonical label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_prefix: Option<String>,
    /// At least one must appear in the keyword haystack.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords_any: Vec<String>,
    /// All must appear in the keyword haystack.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords_all: Vec<String>,
    /// Rule only matches when this flag evaluated enabled for the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_flag: Option<String>,
}

impl MatchCriteria {
    pub fn matches(&self, signal: &Signal) -> bool {
        if let Some(source) = self.source {
            if signal.source != source {
                return false;
            }
        }
        if let Some(ref kind) = self.kind {
            match signal.kind {
                Some(ref actual) if actual.eq_ignore_ascii_case(kind) => {}
                _ => return false,
            }
        }
        if let Some(ref category) = self.category {
            match signal.category {
                Some(ref actual) if actual.eq_ignore_ascii_case(category) => {}
                _ => return false,
            }
        }
        if let Some(severity) = self.severity {
            if signal.severity != Some(severity) {
                return false;
            }
        }

        if self.label_numeric_base.is_some() || self.label_prefix.is_some() {
            let Some(label) = signal.canonical_label() else {
                return false;
            };
            if let Some(base) = self.label_numeric_base {
                let head = label.split('.').next().unwrap_or("");
                match head.parse::<i64>() {
                    Ok(parsed) if parsed == base => {}
                    _ => return false,
                }
            }
            if let Some(ref prefix) = self.label_prefix {
                if !label.starts_with(&prefix.to_lowercase()) {
                    return false;
                }
            }
        }

        if !self.keywords_any.is_empty() || !self.keywords_all.is_empty() {
            let haystack = signal.keyword_haystack();
            if !self.keywords_any.is_empty()
                && !self
                    .keywords_any
                    .iter()
                    .any(|k| haystack.contains(&k.to_lowercase()))
            {
                return false;
            }
            if !self
                .keywords_all
                .iter()
                .all(|k| haystack.contains(&k.to_lowercase()))
            {
                return false;
            }
        }

        if let Some(ref code) = self.requires_flag {
            if !signal.flag_enabled(code) {
                return false;
            }
        }

        true
    }
}

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: String,
    pub version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "match", default)]
    pub criteria: MatchCriteria,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn default_enabled() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn signal() -> Signal {
        Signal {
            organization_id: "acme".into(),
            source: SignalSource::Api,
            kind: Some("incident".into()),
            category: Some("incident".into()),
            severity: Some(Severity::Major),
            label: Some("200.31.4".into()),
            title: "Checkout errors spiking".into(),
            description: Some("5xx rate above 2%".into()),
            payload: serde_json::json!({"service": "checkout"}),
            user_id: None,
            roles: Vec::new(),
            enabled_flags: BTreeSet::new(),
        }
    }

    #[test]
    fn empty_criteria_is_wildcard() {
        assert!(MatchCriteria::default().matches(&signal()));
    }

    #[test]
    fn category_and_severity_must_both_hold() {
        let criteria = MatchCriteria {
            category: Some("INCIDENT".into()),
            severity: Some(Severity::Major),
            ..MatchCriteria::default()
        };
        assert!(criteria.matches(&signal()));

        let mismatched = MatchCriteria {
            category: Some("incident".into()),
            severity: Some(Severity::Critical),
            ..MatchCriteria::default()
        };
        assert!(!mismatched.matches(&signal()));
    }

    #[test]
    fn label_numeric_base_parses_head() {
        let criteria = MatchCriteria {
            label_numeric_base: Some(200),
            ..MatchCriteria::default()
        };
        assert!(criteria.matches(&signal()));

        let wrong_base = MatchCriteria {
            label_numeric_base: Some(300),
            ..MatchCriteria::default()
        };
        assert!(!wrong_base.matches(&signal()));
    }

    #[test]
    fn label_criteria_fail_without_label() {
        let mut s = signal();
        s.label = None;
        let criteria = MatchCriteria {
            label_prefix: Some("200".into()),
            ..MatchCriteria::default()
        };
        assert!(!criteria.matches(&s));
    }

    #[test]
    fn keywords_any_needs_one_hit() {
        let criteria = MatchCriteria {
            keywords_any: vec!["checkout".into(), "payments".into()],
            ..MatchCriteria::default()
        };
        assert!(criteria.matches(&signal()));

        let misses = MatchCriteria {
            keywords_any: vec!["payments".into(), "billing".into()],
            ..MatchCriteria::default()
        };
        assert!(!misses.matches(&signal()));
    }

    #[test]
    fn keywords_all_needs_every_hit() {
        let criteria = MatchCriteria {
            keywords_all: vec!["checkout".into(), "5xx".into()],
            ..MatchCriteria::default()
        };
        assert!(criteria.matches(&signal()));

        let partial = MatchCriteria {
            keywords_all: vec!["checkout".into(), "refunds".into()],
            ..MatchCriteria::default()
        };
        assert!(!partial.matches(&signal()));
    }

    #[test]
    fn keywords_search_payload() {
        let criteria = MatchCriteria {
            keywords_any: vec!["checkout".into()],
            ..MatchCriteria::default()
        };
        let mut s = signal();
        s.title = "errors".into();
        s.description = None;
        assert!(criteria.matches(&s), "payload should be searched");
    }

    #[test]
    fn requires_flag_gates_match() {
        let criteria = MatchCriteria {
            requires_flag: Some("new-routing".into()),
            ..MatchCriteria::default()
        };
        let mut s = signal();
        assert!(!criteria.matches(&s));
        s.enabled_flags.insert("new-routing".into());
        assert!(criteria.matches(&s));
    }

    #[test]
    fn known_action_decodes_typed() {
        let action: Action =
            serde_yaml::from_str("type: create_task\nset:\n  priority: high\n").unwrap();
        match action {
            Action::CreateTask { ref set } => assert_eq!(set["priority"], "high"),
            other => panic!("expected create_task, got {other:?}"),
        }
    }

    #[test]
    fn unknown_action_is_preserved() {
        let action: Action =
            serde_yaml::from_str("type: open_ticket\nqueue: tier2\n").unwrap();
        match action {
            Action::Unrecognized { ref kind, ref fields } => {
                assert_eq!(kind, "open_ticket");
                assert_eq!(fields["queue"], "tier2");
            }
            other => panic!("expected unrecognized, got {other:?}"),
        }
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "open_ticket");
        assert_eq!(json["queue"], "tier2");
    }

    #[test]
    fn action_serialization_roundtrip() {
        let action = Action::Route {
            role: "on-call".into(),
        };
        let json = serde_json::to_string(&action).unwrap();
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(action, back);
    }

    #[test]
    fn rule_defaults_enabled() {
        let rule: Rule = serde_yaml::from_str(
            "id: r1\nversion: '1'\nactions:\n  - type: escalate\n",
        )
        .unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.actions, vec![Action::Escalate]);
    }
}
