//! Feature-flag rollout evaluation.
//!
//! Pure decision function over a flag record and an evaluation context.
//! Percentage rollouts bucket a stable seed through crc32 so the same seed
//! always lands in the same bucket, across calls and across process restarts.
//! A strategy shape the decoder does not recognize evaluates disabled and is
//! logged at warn level.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use tracing::warn;

use crate::error::Result;

// ---------------------------------------------------------------------------
// RolloutStrategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum RolloutStrategy {
    All,
    Percentage {
        percentage: f64,
        seed: Option<String>,
    },
    Roles {
        role_codes: Vec<String>,
    },
    Users {
        user_ids: Vec<String>,
    },
    /// Fail-closed: evaluates disabled. Preserved verbatim.
    Unknown {
        kind: String,
        fields: Map<String, Value>,
    },
}

impl RolloutStrategy {
    fn kind(&self) -> &str {
        match self {
            RolloutStrategy::All => "all",
            RolloutStrategy::Percentage { .. } => "percentage",
            RolloutStrategy::Roles { .. } => "roles",
            RolloutStrategy::Users { .. } => "users",
            RolloutStrategy::Unknown { kind, .. } => kind,
        }
    }
}

impl Serialize for RolloutStrategy {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind())?;
        match self {
            RolloutStrategy::All => {}
            RolloutStrategy::Percentage { percentage, seed } => {
                map.serialize_entry("percentage", percentage)?;
                if let Some(seed) = seed {
                    map.serialize_entry("seed", seed)?;
                }
            }
            RolloutStrategy::Roles { role_codes } => {
                map.serialize_entry("role_codes", role_codes)?;
            }
            RolloutStrategy::Users { user_ids } => {
                map.serialize_entry("user_ids", user_ids)?;
            }
            RolloutStrategy::Unknown { fields, .. } => {
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
            }
        }
        map.end()
    }
}

#[derive(Deserialize)]
struct RawStrategy {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl<'de> Deserialize<'de> for RolloutStrategy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let RawStrategy { kind, fields } = RawStrategy::deserialize(deserializer)?;
        let strategy = match kind.as_str() {
            "all" => RolloutStrategy::All,
            "percentage" => match fields.get("percentage").and_then(Value::as_f64) {
                Some(percentage) => RolloutStrategy::Percentage {
                    percentage,
                    seed: fields
                        .get("seed")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                },
                // A percentage strategy without a percentage is malformed.
                None => RolloutStrategy::Unknown { kind, fields },
            },
            "roles" => RolloutStrategy::Roles {
                role_codes: string_list(&fields, "role_codes"),
            },
            "users" => RolloutStrategy::Users {
                user_ids: string_list(&fields, "user_ids"),
            },
            _ => RolloutStrategy::Unknown { kind, fields },
        };
        Ok(strategy)
    }
}

fn string_list(fields: &Map<String, Value>, key: &str) -> Vec<String> {
    fields
        .get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// FeatureFlag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
    pub code: String,
    /// `None` means a global row; org-scoped rows override it.
    #[serde(default)]
    pub organization_id: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub enabled_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disabled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rollout: Option<RolloutStrategy>,
}

// ---------------------------------------------------------------------------
// FlagContext
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FlagContext {
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
}

impl FlagContext {
    pub fn for_org(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: Some(organization_id.into()),
            ..Self::default()
        }
    }

    /// Seed for percentage bucketing when the strategy carries none:
    /// user, else org, else sorted roles, else the literal "global".
    fn default_seed(&self) -> String {
        if let Some(ref user) = self.user_id {
            return format!("user:{user}");
        }
        if let Some(ref org) = self.organization_id {
            return format!("org:{org}");
        }
        if !self.roles.is_empty() {
            let mut roles = self.roles.clone();
            roles.sort();
            return format!("roles:{}", roles.join(","));
        }
        "global".to_string()
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Map a seed into `[0, 100)`.
fn bucket(seed: &str) -> f64 {
    let hash = crc32fast::hash(seed.as_bytes());
    (hash as f64) / (u32::MAX as f64 + 1.0) * 100.0
}

/// Evaluate one effective flag row against a context at `now`.
pub fn is_enabled(flag: Option<&FeatureFlag>, ctx: &FlagContext, now: DateTime<Utc>) -> bool {
    let Some(flag) = flag else {
        return false;
    };
    if !flag.enabled {
        return false;
    }
    if let Some(from) = flag.enabled_from {
        if now < from {
            return false;
        }
    }
    if let Some(until) = flag.disabled_at {
        if now >= until {
            return false;
        }
    }

    match flag.rollout {
        None | Some(RolloutStrategy::All) => true,
        Some(RolloutStrategy::Percentage {
            percentage,
            ref seed,
        }) => {
            let seed = seed.clone().unwrap_or_else(|| ctx.default_seed());
            bucket(&seed) < percentage.clamp(0.0, 100.0)
        }
        Some(RolloutStrategy::Roles { ref role_codes }) => ctx
            .roles
            .iter()
            .any(|role| role_codes.iter().any(|code| code == role)),
        Some(RolloutStrategy::Users { ref user_ids }) => match ctx.user_id {
            Some(ref user) => user_ids.iter().any(|id| id == user),
            None => false,
        },
        Some(RolloutStrategy::Unknown { ref kind, .. }) => {
            warn!(code = %flag.code, strategy = %kind, "unknown rollout strategy, treating flag as disabled");
            false
        }
    }
}

/// Pick the effective row for a code: the org-scoped row overrides the
/// global one. At most one row per scope is expected; the first wins.
pub fn effective<'a>(
    flags: &'a [FeatureFlag],
    code: &str,
    organization_id: Option<&str>,
) -> Option<&'a FeatureFlag> {
    let scoped = flags.iter().find(|f| {
        f.code == code && f.organization_id.as_deref() == organization_id && organization_id.is_some()
    });
    scoped.or_else(|| {
        flags
            .iter()
            .find(|f| f.code == code && f.organization_id.is_none())
    })
}

/// Resolve every flag code that evaluates enabled for the context.
/// Used at signal normalization so rule evaluation stays pure.
pub fn enabled_codes(
    flags: &[FeatureFlag],
    ctx: &FlagContext,
    now: DateTime<Utc>,
) -> BTreeSet<String> {
    let mut codes: BTreeSet<String> = BTreeSet::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for flag in flags {
        if !seen.insert(flag.code.as_str()) {
            continue;
        }
        let row = effective(flags, &flag.code, ctx.organization_id.as_deref());
        if is_enabled(row, ctx, now) {
            codes.insert(flag.code.clone());
        }
    }
    codes
}

/// Load flag rows from a YAML sequence.
pub fn from_yaml_str(content: &str) -> Result<Vec<FeatureFlag>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_yaml::from_str(content)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn flag(code: &str) -> FeatureFlag {
        FeatureFlag {
            code: code.into(),
            organization_id: None,
            enabled: true,
            enabled_from: None,
            disabled_at: None,
            rollout: None,
        }
    }

    #[test]
    fn absent_flag_is_disabled() {
        assert!(!is_enabled(None, &FlagContext::default(), t0()));
    }

    #[test]
    fn disabled_row_short_circuits() {
        let mut f = flag("x");
        f.enabled = false;
        f.rollout = Some(RolloutStrategy::All);
        assert!(!is_enabled(Some(&f), &FlagContext::default(), t0()));
    }

    #[test]
    fn time_window_is_half_open() {
        let mut f = flag("x");
        f.enabled_from = Some(t0());
        f.disabled_at = Some(t0() + chrono::Duration::hours(1));

        assert!(!is_enabled(Some(&f), &FlagContext::default(), t0() - chrono::Duration::seconds(1)));
        assert!(is_enabled(Some(&f), &FlagContext::default(), t0()));
        assert!(!is_enabled(
            Some(&f),
            &FlagContext::default(),
            t0() + chrono::Duration::hours(1)
        ));
    }

    #[test]
    fn percentage_zero_never_passes_hundred_always_does() {
        let ctx = FlagContext::for_org("acme");
        for seed in ["a", "b", "user:1234", "weird-seed"] {
            let mut off = flag("x");
            off.rollout = Some(RolloutStrategy::Percentage {
                percentage: 0.0,
                seed: Some(seed.into()),
            });
            assert!(!is_enabled(Some(&off), &ctx, t0()));

            let mut on = flag("x");
            on.rollout = Some(RolloutStrategy::Percentage {
                percentage: 100.0,
                seed: Some(seed.into()),
            });
            assert!(is_enabled(Some(&on), &ctx, t0()));
        }
    }

    #[test]
    fn percentage_is_clamped() {
        let mut f = flag("x");
        f.rollout = Some(RolloutStrategy::Percentage {
            percentage: 250.0,
            seed: Some("anything".into()),
        });
        assert!(is_enabled(Some(&f), &FlagContext::default(), t0()));
    }

    #[test]
    fn percentage_is_stable_for_a_fixed_seed() {
        let mut f = flag("x");
        f.rollout = Some(RolloutStrategy::Percentage {
            percentage: 50.0,
            seed: Some("stable-seed".into()),
        });
        let ctx = FlagContext::default();
        let first = is_enabled(Some(&f), &ctx, t0());
        for _ in 0..20 {
            assert_eq!(is_enabled(Some(&f), &ctx, t0()), first);
        }
    }

    #[test]
    fn seed_chain_prefers_user_then_org() {
        let ctx = FlagContext {
            organization_id: Some("acme".into()),
            user_id: Some("u1".into()),
            roles: vec!["ops".into()],
        };
        assert_eq!(ctx.default_seed(), "user:u1");

        let org_only = FlagContext::for_org("acme");
        assert_eq!(org_only.default_seed(), "org:acme");

        let roles_only = FlagContext {
            roles: vec!["ops".into(), "admin".into()],
            ..FlagContext::default()
        };
        assert_eq!(roles_only.default_seed(), "roles:admin,ops");

        assert_eq!(FlagContext::default().default_seed(), "global");
    }

    #[test]
    fn roles_strategy_requires_intersection() {
        let mut f = flag("x");
        f.rollout = Some(RolloutStrategy::Roles {
            role_codes: vec!["ops".into()],
        });
        let mut ctx = FlagContext::default();
        assert!(!is_enabled(Some(&f), &ctx, t0()));
        ctx.roles.push("ops".into());
        assert!(is_enabled(Some(&f), &ctx, t0()));
    }

    #[test]
    fn users_strategy_requires_listed_user() {
        let mut f = flag("x");
        f.rollout = Some(RolloutStrategy::Users {
            user_ids: vec!["u1".into()],
        });
        let mut ctx = FlagContext::default();
        assert!(!is_enabled(Some(&f), &ctx, t0()));
        ctx.user_id = Some("u1".into());
        assert!(is_enabled(Some(&f), &ctx, t0()));
    }

    #[test]
    fn unknown_strategy_fails_closed() {
        let parsed: RolloutStrategy =
            serde_yaml::from_str("type: geo\nregions:\n  - eu\n").unwrap();
        assert!(matches!(parsed, RolloutStrategy::Unknown { .. }));

        let mut f = flag("x");
        f.rollout = Some(parsed);
        assert!(!is_enabled(Some(&f), &FlagContext::default(), t0()));
    }

    #[test]
    fn unknown_strategy_roundtrips_verbatim() {
        let parsed: RolloutStrategy =
            serde_yaml::from_str("type: geo\nregions:\n  - eu\n").unwrap();
        let json = serde_json::to_value(&parsed).unwrap();
        assert_eq!(json["type"], "geo");
        assert_eq!(json["regions"][0], "eu");
    }

    #[test]
    fn malformed_percentage_fails_closed() {
        let parsed: RolloutStrategy = serde_yaml::from_str("type: percentage\n").unwrap();
        assert!(matches!(parsed, RolloutStrategy::Unknown { .. }));
    }

    #[test]
    fn org_row_overrides_global() {
        let rows = vec![
            flag("x"),
            FeatureFlag {
                organization_id: Some("acme".into()),
                enabled: false,
                ..flag("x")
            },
        ];
        let acme = effective(&rows, "x", Some("acme"));
        assert!(!is_enabled(acme, &FlagContext::for_org("acme"), t0()));

        let other = effective(&rows, "x", Some("globex"));
        assert!(is_enabled(other, &FlagContext::for_org("globex"), t0()));
    }

    #[test]
    fn enabled_codes_resolves_overrides_once_per_code() {
        let rows = vec![
            flag("a"),
            flag("b"),
            FeatureFlag {
                organization_id: Some("acme".into()),
                enabled: false,
                ..flag("b")
            },
        ];
        let codes = enabled_codes(&rows, &FlagContext::for_org("acme"), t0());
        assert!(codes.contains("a"));
        assert!(!codes.contains("b"));
    }
}
