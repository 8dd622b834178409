//! Repairs a schedule that stopped firing, without knowing why it stopped.

use chrono::{DateTime, TimeDelta, Utc};

use super::state::DailySchedule;
use crate::config::{FORCE_CHECK_AFTER_SECS, STUCK_THRESHOLD_SECS};
use crate::types::ScheduleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    None,
    Rescheduled,
    /// The caller should run a reconciliation now.
    ForceCheck,
    ClearedSuppression,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogReport {
    pub action: WatchdogAction,
    pub message: String,
}

impl WatchdogReport {
    fn new(action: WatchdogAction, message: impl Into<String>) -> Self {
        Self { action, message: message.into() }
    }

    /// Whether the pending timer changed and the driver must re-read it.
    pub fn moved_timer(&self) -> bool {
        matches!(self.action, WatchdogAction::Rescheduled | WatchdogAction::ClearedSuppression)
    }
}

/// Inspect the schedule at `now` and fix the first problem found.
pub fn check(schedule: &mut DailySchedule, now: DateTime<Utc>) -> WatchdogReport {
    if schedule.state() == ScheduleState::Stopped {
        return WatchdogReport::new(WatchdogAction::None, "No action needed - scheduler stopped");
    }

    if schedule.suppressed_date().is_some() && !schedule.is_suppressed_at(now) {
        schedule.clear_suppression(now);
        return WatchdogReport::new(WatchdogAction::ClearedSuppression, "Cleared suppression - date changed");
    }

    if let Some(next) = schedule.next_run_at() {
        if next < now {
            schedule.rearm_in(now, TimeDelta::zero());
            return WatchdogReport::new(WatchdogAction::Rescheduled, "Rescheduled - next run was in the past");
        }
    }

    let in_window = schedule.window().contains(now);
    if schedule.is_suppressed_at(now) {
        return WatchdogReport::new(WatchdogAction::None, "No action needed - sync is healthy");
    }

    match schedule.next_run_at() {
        None => {
            if in_window {
                schedule.rearm_in(now, TimeDelta::zero());
            } else {
                let open = schedule.window().next_open_after(now);
                schedule.rearm_in(now, open - now);
            }
            return WatchdogReport::new(WatchdogAction::Rescheduled, "Rescheduled - no sync was scheduled");
        }
        Some(next) if in_window && (next - now).num_seconds() > STUCK_THRESHOLD_SECS => {
            let minutes = (next - now).num_minutes();
            schedule.rearm_in(now, schedule.poll_interval());
            return WatchdogReport::new(
                WatchdogAction::Rescheduled,
                format!("Rescheduled - next run was {minutes} minutes away"),
            );
        }
        Some(_) => {}
    }

    if in_window {
        if let Some(last) = schedule.last_check_at() {
            let since = now - last;
            if since.num_seconds() > FORCE_CHECK_AFTER_SECS {
                return WatchdogReport::new(
                    WatchdogAction::ForceCheck,
                    format!("Forced check - last check was {} minutes ago", since.num_minutes()),
                );
            }
        }
    }

    WatchdogReport::new(WatchdogAction::None, "No action needed - sync is healthy")
}
