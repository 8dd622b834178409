//! Suspend/resume detection from the gap between wall-clock and process time.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::{SUSPEND_PROCESS_MAX_SECS, SUSPEND_WALL_GAP_SECS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeObservation {
    /// Seconds since the previous observation (None on the first one).
    pub wall_since_last: Option<i64>,
    pub process_since_last: Option<i64>,
    pub wall_since_start: i64,
    pub process_since_start: i64,
    /// Estimated suspended seconds when a suspend/resume was detected.
    pub suspended_secs: Option<i64>,
}

impl WakeObservation {
    pub fn resumed(&self) -> bool {
        self.suspended_secs.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct WakeDetector {
    started_wall: DateTime<Utc>,
    last: Option<(DateTime<Utc>, Duration)>,
    /// Wall/process drift already attributed to earlier detections.
    accounted_drift: i64,
}

impl WakeDetector {
    /// `now` and `uptime` read at the same moment; the process start is derived from them.
    pub fn new(now: DateTime<Utc>, uptime: Duration) -> Self {
        let started_wall = now - chrono::TimeDelta::from_std(uptime).unwrap_or_default();
        Self { started_wall, last: None, accounted_drift: 0 }
    }

    /// Two checks: a large wall gap since the last tick with almost no process
    /// time, or total wall/process drift since start beyond what earlier
    /// detections already explained.
    pub fn observe(&mut self, now: DateTime<Utc>, uptime: Duration) -> WakeObservation {
        let wall_since_start = (now - self.started_wall).num_seconds();
        let process_since_start = uptime.as_secs() as i64;

        let mut suspended_secs = None;
        let (wall_since_last, process_since_last) = match self.last {
            Some((last_wall, last_uptime)) => {
                let wall = (now - last_wall).num_seconds();
                let process = uptime.saturating_sub(last_uptime).as_secs() as i64;
                if wall > SUSPEND_WALL_GAP_SECS && process < SUSPEND_PROCESS_MAX_SECS {
                    suspended_secs = Some(wall - process);
                }
                (Some(wall), Some(process))
            }
            None => (None, None),
        };

        let drift = wall_since_start - process_since_start;
        if suspended_secs.is_none() && drift - self.accounted_drift > SUSPEND_WALL_GAP_SECS {
            suspended_secs = Some(drift - self.accounted_drift);
        }
        if suspended_secs.is_some() {
            self.accounted_drift = drift;
        }
        self.last = Some((now, uptime));

        WakeObservation {
            wall_since_last,
            process_since_last,
            wall_since_start,
            process_since_start,
            suspended_secs,
        }
    }
}
