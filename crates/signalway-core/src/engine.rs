//! Rule-set loading, validation, and evaluation.
//!
//! A `RuleSet` is an immutable snapshot. The `RuleEngine` holds the current
//! snapshot behind an `Arc` and replaces it atomically on `reload`; readers
//! always see a consistent set, never a partially applied one.
//!
//! Evaluation is a pure function of `(signal, rule set)`: no I/O, no clock,
//! no randomness. A dry run with the same inputs produces identical output.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::error::Result;
use crate::rule::{Action, Rule};
use crate::signal::Signal;

// ---------------------------------------------------------------------------
// RuleIssue / IssueLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueLevel {
    /// The rule is ignored at evaluation time.
    Error,
    /// The rule still evaluates; the flagged action is never executed.
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleIssue {
    pub rule_id: String,
    pub level: IssueLevel,
    pub message: String,
}

// ---------------------------------------------------------------------------
// RuleSet
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    /// Parse failures recorded at load time, reported by `validate`.
    load_issues: Vec<RuleIssue>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            load_issues: Vec::new(),
        }
    }

    /// Load a rule set from an ordered collection of YAML documents.
    ///
    /// Loading is fail-soft: a document that does not parse is skipped and
    /// recorded as a load issue; the rest of the set still loads.
    pub fn from_documents<S: AsRef<str>>(documents: &[S]) -> Self {
        let mut rules = Vec::new();
        let mut load_issues = Vec::new();
        for (index, document) in documents.iter().enumerate() {
            match serde_yaml::from_str::<Rule>(document.as_ref()) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    warn!(index, %err, "skipping malformed rule document");
                    load_issues.push(RuleIssue {
                        rule_id: format!("<document {index}>"),
                        level: IssueLevel::Error,
                        message: err.to_string(),
                    });
                }
            }
        }
        Self { rules, load_issues }
    }

    /// Load a rule set from one YAML file containing a sequence of rules.
    /// Per-element failures are tolerated the same way as per-document ones.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let values: Vec<serde_yaml::Value> = serde_yaml::from_str(content)?;
        let mut rules = Vec::new();
        let mut load_issues = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            match serde_yaml::from_value::<Rule>(value) {
                Ok(rule) => rules.push(rule),
                Err(err) => {
                    warn!(index, %err, "skipping malformed rule entry");
                    load_issues.push(RuleIssue {
                        rule_id: format!("<entry {index}>"),
                        level: IssueLevel::Error,
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(Self { rules, load_issues })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Report every validation issue in load order. Callers decide whether
    /// error-level issues are fatal.
    pub fn validate(&self) -> Vec<RuleIssue> {
        let mut issues = self.load_issues.clone();
        for rule in &self.rules {
            issues.extend(validate_rule(rule));
        }
        issues
    }

    fn rule_is_sound(rule: &Rule) -> bool {
        !validate_rule(rule)
            .iter()
            .any(|i| i.level == IssueLevel::Error)
    }

    /// Match the signal against every enabled, structurally sound rule in
    /// load order, appending each matching rule's actions in rule order then
    /// action order. Each resolved action is tagged with its originating rule
    /// id and version for audit and idempotent replays.
    pub fn evaluate(&self, signal: &Signal) -> Evaluation {
        let mut matched_rules = Vec::new();
        let mut actions = Vec::new();

        for rule in &self.rules {
            if !rule.enabled || !Self::rule_is_sound(rule) {
                continue;
            }
            if !rule.criteria.matches(signal) {
                continue;
            }
            matched_rules.push(MatchedRule {
                id: rule.id.clone(),
                version: rule.version.clone(),
            });
            for action in &rule.actions {
                actions.push(ResolvedAction {
                    rule_id: rule.id.clone(),
                    rule_version: rule.version.clone(),
                    action: action.clone(),
                });
            }
        }

        Evaluation {
            matched_rules,
            actions,
        }
    }
}

fn validate_rule(rule: &Rule) -> Vec<RuleIssue> {
    let id = if rule.id.trim().is_empty() {
        "<missing id>".to_string()
    } else {
        rule.id.clone()
    };
    let issue = |level: IssueLevel, message: String| RuleIssue {
        rule_id: id.clone(),
        level,
        message,
    };

    let mut issues = Vec::new();
    if rule.id.trim().is_empty() {
        issues.push(issue(IssueLevel::Error, "rule id is empty".into()));
    }
    if rule.version.trim().is_empty() {
        issues.push(issue(IssueLevel::Error, "rule version is empty".into()));
    }
    if rule.actions.is_empty() {
        issues.push(issue(IssueLevel::Error, "rule has no actions".into()));
    }
    for (index, action) in rule.actions.iter().enumerate() {
        match action {
            Action::CreateTask { set } if set.is_empty() => {
                issues.push(issue(
                    IssueLevel::Error,
                    format!("action {index}: create_task has an empty field-override map"),
                ));
            }
            Action::Route { role } if role.trim().is_empty() => {
                issues.push(issue(
                    IssueLevel::Error,
                    format!("action {index}: route is missing a target role"),
                ));
            }
            Action::Notify { channel } if channel.trim().is_empty() => {
                issues.push(issue(
                    IssueLevel::Error,
                    format!("action {index}: notify is missing a channel"),
                ));
            }
            Action::AttachTemplate { template } if template.trim().is_empty() => {
                issues.push(issue(
                    IssueLevel::Error,
                    format!("action {index}: attach_template is missing a template"),
                ));
            }
            Action::Unrecognized { kind, .. } => {
                issues.push(issue(
                    IssueLevel::Warning,
                    format!("action {index}: unknown action type '{kind}'"),
                ));
            }
            _ => {}
        }
    }
    issues
}

// ---------------------------------------------------------------------------
// Evaluation (output)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedRule {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAction {
    pub rule_id: String,
    pub rule_version: String,
    #[serde(flatten)]
    pub action: Action,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evaluation {
    pub matched_rules: Vec<MatchedRule>,
    pub actions: Vec<ResolvedAction>,
}

// ---------------------------------------------------------------------------
// RuleEngine
// ---------------------------------------------------------------------------

/// Holds the active rule-set snapshot. `reload` swaps the whole set
/// atomically; there is no partial application and no in-place mutation.
pub struct RuleEngine {
    current: RwLock<Arc<RuleSet>>,
}

impl RuleEngine {
    pub fn new(rule_set: RuleSet) -> Self {
        Self {
            current: RwLock::new(Arc::new(rule_set)),
        }
    }

    /// The current snapshot. Cheap to clone; stays consistent for the
    /// caller's lifetime even across a concurrent reload.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn reload(&self, rule_set: RuleSet) {
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(rule_set);
    }

    pub fn evaluate(&self, signal: &Signal) -> Evaluation {
        self.snapshot().evaluate(signal)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, SignalSource};
    use std::collections::BTreeSet;

    fn signal() -> Signal {
        Signal {
            organization_id: "acme".into(),
            source: SignalSource::Api,
            kind: None,
            category: Some("incident".into()),
            severity: Some(Severity::Major),
            label: None,
            title: "Checkout down".into(),
            description: None,
            payload: serde_json::Value::Null,
            user_id: None,
            roles: Vec::new(),
            enabled_flags: BTreeSet::new(),
        }
    }

    const RULES: &str = r#"
- id: incident-major
  version: "3"
  match:
    category: incident
    severity: major
  actions:
    - type: create_task
      set:
        priority: high
    - type: notify
      channel: pagers
- id: all-signals
  version: "1"
  actions:
    - type: set_metadata
      patch:
        routed: true
- id: disabled-rule
  version: "1"
  enabled: false
  actions:
    - type: escalate
"#;

    fn rule_set() -> RuleSet {
        RuleSet::from_yaml_str(RULES).unwrap()
    }

    #[test]
    fn matches_in_load_order_actions_in_rule_order() {
        let evaluation = rule_set().evaluate(&signal());
        let ids: Vec<&str> = evaluation
            .matched_rules
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, ["incident-major", "all-signals"]);

        let kinds: Vec<&str> = evaluation
            .actions
            .iter()
            .map(|a| a.action.kind())
            .collect();
        assert_eq!(kinds, ["create_task", "notify", "set_metadata"]);
        assert_eq!(evaluation.actions[0].rule_id, "incident-major");
        assert_eq!(evaluation.actions[0].rule_version, "3");
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let evaluation = rule_set().evaluate(&signal());
        assert!(evaluation
            .matched_rules
            .iter()
            .all(|m| m.id != "disabled-rule"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let set = rule_set();
        let first = serde_json::to_string(&set.evaluate(&signal())).unwrap();
        let second = serde_json::to_string(&set.evaluate(&signal())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn example_from_the_routing_table() {
        let set = RuleSet::from_yaml_str(
            r#"
- id: r1
  version: "1"
  match:
    category: incident
    severity: major
  actions:
    - type: create_task
      set:
        priority: HIGH
"#,
        )
        .unwrap();
        let evaluation = set.evaluate(&signal());
        assert_eq!(evaluation.matched_rules.len(), 1);
        match &evaluation.actions[0].action {
            Action::CreateTask { set } => assert_eq!(set["priority"], "HIGH"),
            other => panic!("expected create_task, got {other:?}"),
        }
    }

    #[test]
    fn malformed_document_does_not_discard_the_rest() {
        let set = RuleSet::from_documents(&[
            "id: ok-rule\nversion: '1'\nactions:\n  - type: escalate\n",
            ": not yaml ::",
        ]);
        assert_eq!(set.len(), 1);
        let issues = set.validate();
        assert!(issues
            .iter()
            .any(|i| i.rule_id.contains("document 1") && i.level == IssueLevel::Error));
    }

    #[test]
    fn validation_reports_required_fields() {
        let set = RuleSet::from_yaml_str(
            r#"
- id: bad-create
  version: "1"
  actions:
    - type: create_task
- id: bad-route
  version: "1"
  actions:
    - type: route
- id: ""
  version: "1"
  actions:
    - type: escalate
- id: no-actions
  version: "1"
  actions: []
"#,
        )
        .unwrap();
        let issues = set.validate();
        assert!(issues.iter().any(|i| i.message.contains("field-override")));
        assert!(issues.iter().any(|i| i.message.contains("target role")));
        assert!(issues.iter().any(|i| i.message.contains("id is empty")));
        assert!(issues.iter().any(|i| i.message.contains("no actions")));
    }

    #[test]
    fn invalid_rules_are_ignored_at_evaluation() {
        let set = RuleSet::from_yaml_str(
            r#"
- id: broken
  version: "1"
  actions:
    - type: route
- id: fine
  version: "1"
  actions:
    - type: escalate
"#,
        )
        .unwrap();
        let evaluation = set.evaluate(&signal());
        let ids: Vec<&str> = evaluation
            .matched_rules
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, ["fine"]);
    }

    #[test]
    fn unknown_action_type_still_evaluates_and_is_preserved() {
        let set = RuleSet::from_yaml_str(
            r#"
- id: forward-compat
  version: "2"
  actions:
    - type: page_human
      rotation: primary
    - type: escalate
"#,
        )
        .unwrap();
        let issues = set.validate();
        assert!(issues
            .iter()
            .any(|i| i.level == IssueLevel::Warning && i.message.contains("page_human")));

        let evaluation = set.evaluate(&signal());
        assert_eq!(evaluation.actions.len(), 2);
        assert_eq!(evaluation.actions[0].action.kind(), "page_human");
    }

    #[test]
    fn reload_swaps_the_whole_set() {
        let engine = RuleEngine::new(rule_set());
        let before = engine.snapshot();
        assert_eq!(before.len(), 3);

        engine.reload(RuleSet::from_yaml_str("- id: only\n  version: '1'\n  actions:\n    - type: escalate\n").unwrap());
        assert_eq!(engine.snapshot().len(), 1);
        // The old snapshot is still intact for holders.
        assert_eq!(before.len(), 3);
    }
}
