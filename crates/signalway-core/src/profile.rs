//! Organization default profiles.
//!
//! Profiles are external configuration; the core only consumes the resolved
//! defaults. Lookup failures degrade to the hard-coded fallback profile so a
//! missing or broken profile source never blocks task creation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::error::{Result, SignalwayError};
use crate::types::{Priority, Severity, Visibility};

// ---------------------------------------------------------------------------
// OrgProfile
// ---------------------------------------------------------------------------

/// Resolved defaults for one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgProfile {
    #[serde(default = "default_priority")]
    pub priority: Priority,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_visibility")]
    pub visibility: Visibility,
    /// Default reactivity window in seconds. `None` falls through to the
    /// hard-coded fallback in the SLA layer.
    #[serde(default)]
    pub reactivity_seconds: Option<u64>,
}

fn default_priority() -> Priority {
    Priority::Medium
}

fn default_severity() -> Severity {
    Severity::Minor
}

fn default_visibility() -> Visibility {
    Visibility::Internal
}

impl Default for OrgProfile {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            severity: default_severity(),
            visibility: default_visibility(),
            reactivity_seconds: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ProfileSource
// ---------------------------------------------------------------------------

/// Read-only lookup of organization defaults.
pub trait ProfileSource {
    fn defaults(&self, organization_id: &str) -> Result<OrgProfile>;
}

/// Fetch defaults, degrading to the fallback profile on any lookup failure.
/// The failure is logged, never propagated.
pub fn defaults_or_fallback(source: &dyn ProfileSource, organization_id: &str) -> OrgProfile {
    match source.defaults(organization_id) {
        Ok(profile) => profile,
        Err(err) => {
            warn!(%organization_id, %err, "profile lookup failed, using fallback defaults");
            OrgProfile::default()
        }
    }
}

// ---------------------------------------------------------------------------
// StaticProfiles
// ---------------------------------------------------------------------------

/// In-memory profile map, loadable from a YAML document of
/// `organization_id -> profile`.
#[derive(Debug, Clone, Default)]
pub struct StaticProfiles {
    profiles: HashMap<String, OrgProfile>,
}

impl StaticProfiles {
    pub fn new(profiles: HashMap<String, OrgProfile>) -> Self {
        Self { profiles }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let profiles: HashMap<String, OrgProfile> = serde_yaml::from_str(content)?;
        Ok(Self { profiles })
    }
}

impl ProfileSource for StaticProfiles {
    fn defaults(&self, organization_id: &str) -> Result<OrgProfile> {
        self.profiles
            .get(organization_id)
            .cloned()
            .ok_or_else(|| SignalwayError::ProfileLookup(format!("no profile for {organization_id}")))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
