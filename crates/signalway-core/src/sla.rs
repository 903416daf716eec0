//! Reactivity-deadline computation.
//!
//! The deadline for a new task is resolved with a fixed precedence:
//!   1. explicit absolute deadline override
//!   2. explicit duration override (seconds or a duration string)
//!   3. organization-profile default duration
//!   4. hard-coded 12 h fallback
//!
//! Duration strings accept either plain seconds (`"90"`) or day/hour/minute/
//! second components in order (`"1d2h30m15s"`, `"PT1H30M"`; the ISO `P`/`T`
//! markers are tolerated and ignored).

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{Result, SignalwayError};
use crate::profile::OrgProfile;

/// Applied when neither the caller nor the organization profile supplies a
/// reactivity window: 12 hours.
pub const FALLBACK_REACTIVITY_SECS: u64 = 43_200;

// ---------------------------------------------------------------------------
// Duration parsing
// ---------------------------------------------------------------------------

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^P?T?(?:(\d+)d)?T?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap()
    })
}

/// Parse a duration override into seconds.
///
/// `days·86400 + hours·3600 + minutes·60 + seconds`. A bare integer is taken
/// as seconds. An empty or component-free string is rejected.
pub fn parse_duration_secs(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SignalwayError::InvalidDuration(input.to_string()));
    }
    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(secs);
    }

    let caps = duration_re()
        .captures(trimmed)
        .ok_or_else(|| SignalwayError::InvalidDuration(input.to_string()))?;

    let component = |i: usize| -> u64 {
        caps.get(i)
            .map(|m| m.as_str().parse::<u64>().unwrap_or(0))
            .unwrap_or(0)
    };
    let days = component(1);
    let hours = component(2);
    let minutes = component(3);
    let seconds = component(4);

    if caps.get(1).is_none() && caps.get(2).is_none() && caps.get(3).is_none() && caps.get(4).is_none()
    {
        return Err(SignalwayError::InvalidDuration(input.to_string()));
    }

    Ok(days * 86_400 + hours * 3_600 + minutes * 60 + seconds)
}

// ---------------------------------------------------------------------------
// Deadline resolution
// ---------------------------------------------------------------------------

/// Caller-supplied SLA overrides. Both fields are optional; `deadline` wins.
#[derive(Debug, Clone, Default)]
pub struct SlaOverride {
    /// Explicit absolute deadline. Used exactly as given.
    pub deadline: Option<DateTime<Utc>>,
    /// Explicit duration, seconds or a duration string.
    pub duration: Option<String>,
}

/// Resolve the reactivity deadline for a task created at `created_at`.
///
/// Returns an error only for an unparseable explicit duration override.
/// A missing or empty profile default falls through to the fallback.
pub fn resolve_reactivity_deadline(
    created_at: DateTime<Utc>,
    sla: &SlaOverride,
    profile: &OrgProfile,
) -> Result<DateTime<Utc>> {
    if let Some(deadline) = sla.deadline {
        return Ok(deadline);
    }

    let secs = if let Some(ref duration) = sla.duration {
        parse_duration_secs(duration)?
    } else {
        profile
            .reactivity_seconds
            .unwrap_or(FALLBACK_REACTIVITY_SECS)
    };

    Ok(created_at + Duration::seconds(secs as i64))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
