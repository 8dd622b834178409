//! Low-frequency safety net for the window timer and the watchdog.

use chrono::{DateTime, Utc};

use super::state::PublicationWindow;
use crate::config::FALLBACK_STALE_SECS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDecision {
    OutsideWindow,
    /// Today was already complete; only local completeness needs re-checking.
    Suppressed,
    /// A reconciliation finished recently enough.
    Healthy { minutes_since: i64 },
    /// Nothing finished within the staleness bound. `None` means nothing ever ran.
    Force { minutes_since: Option<i64> },
}

impl FallbackDecision {
    pub fn message(&self) -> String {
        match self {
            FallbackDecision::OutsideWindow => "Outside publication window".to_string(),
            FallbackDecision::Suppressed => "Today is already complete, no sync needed".to_string(),
            FallbackDecision::Healthy { .. } => "Dynamic sync is working, no action needed".to_string(),
            FallbackDecision::Force { minutes_since: Some(m) } => {
                format!("Forced check - last check was {m} minutes ago")
            }
            FallbackDecision::Force { minutes_since: None } => "Forced check - no check recorded yet".to_string(),
        }
    }
}

/// `last_run` is the latest finished reconciliation or schedule check, whichever is newer.
pub fn decide(
    window: &PublicationWindow,
    now: DateTime<Utc>,
    suppressed_today: bool,
    last_run: Option<DateTime<Utc>>,
) -> FallbackDecision {
    if !window.contains(now) {
        return FallbackDecision::OutsideWindow;
    }
    if suppressed_today {
        return FallbackDecision::Suppressed;
    }
    match last_run {
        Some(t) if (now - t).num_seconds() <= FALLBACK_STALE_SECS => {
            FallbackDecision::Healthy { minutes_since: (now - t).num_minutes() }
        }
        Some(t) => FallbackDecision::Force { minutes_since: Some((now - t).num_minutes()) },
        None => FallbackDecision::Force { minutes_since: None },
    }
}
