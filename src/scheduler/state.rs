//! The daily publication-window state machine. Pure: every transition takes
//! `now` explicitly and the driver loop asks [`DailySchedule::next_fire_time`]
//! when to wake up next.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;

use crate::calendar::MarketCalendar;
use crate::config::{Config, POLL_INTERVAL_SECS};
use crate::types::{ScheduleState, ScheduleStatus};

/// Daily `[open, close]` range (inclusive) in the window timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicationWindow {
    calendar: MarketCalendar,
    open: NaiveTime,
    close: NaiveTime,
}

impl PublicationWindow {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime) -> Self {
        Self { calendar: MarketCalendar::new(tz), open, close }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.window_tz, cfg.window_open, cfg.window_close)
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    pub fn open_on(&self, date: NaiveDate) -> DateTime<Utc> {
        self.calendar.at(date, self.open)
    }

    pub fn close_on(&self, date: NaiveDate) -> DateTime<Utc> {
        self.calendar.at(date, self.close)
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let date = self.calendar.date_of(now);
        now >= self.open_on(date) && now <= self.close_on(date)
    }

    /// Today's opening if it is still ahead, otherwise tomorrow's.
    pub fn next_open_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let date = self.calendar.date_of(now);
        let open = self.open_on(date);
        if now < open {
            open
        } else {
            self.open_on(date + TimeDelta::days(1))
        }
    }
}

/// What the driver should do after a timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireAction {
    /// Run a reconciliation, then report back through `after_reconcile`.
    Reconcile,
    /// Today was already complete: re-check local completeness without touching upstream.
    VerifySuppression,
    /// Fired outside the window; the timer has been moved to the next opening.
    Rearmed,
}

#[derive(Debug, Clone)]
pub struct DailySchedule {
    window: PublicationWindow,
    reference: MarketCalendar,
    poll: TimeDelta,
    state: ScheduleState,
    next_run_at: Option<DateTime<Utc>>,
    last_check_at: Option<DateTime<Utc>>,
    suppressed_date: Option<NaiveDate>,
}

impl DailySchedule {
    pub fn new(window: PublicationWindow, reference: MarketCalendar) -> Self {
        Self {
            window,
            reference,
            poll: TimeDelta::seconds(POLL_INTERVAL_SECS),
            state: ScheduleState::Idle,
            next_run_at: None,
            last_check_at: None,
            suppressed_date: None,
        }
    }

    pub fn window(&self) -> &PublicationWindow {
        &self.window
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.next_run_at
    }

    pub fn last_check_at(&self) -> Option<DateTime<Utc>> {
        self.last_check_at
    }

    pub fn suppressed_date(&self) -> Option<NaiveDate> {
        self.suppressed_date
    }

    pub fn poll_interval(&self) -> TimeDelta {
        self.poll
    }

    pub fn is_suppressed_at(&self, now: DateTime<Utc>) -> bool {
        self.suppressed_date == Some(self.reference.today(now))
    }

    /// When the driver should wake next. None when stopped or nothing is armed.
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        match self.state {
            ScheduleState::Stopped => None,
            _ => self.next_run_at,
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Idle -> ActivePolling (inside the window, fires immediately) or
    /// ArmedPreWindow (timer at the next opening).
    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.state == ScheduleState::Stopped {
            return;
        }
        self.arm(now);
    }

    pub fn on_fire(&mut self, now: DateTime<Utc>) -> FireAction {
        if self.state == ScheduleState::Stopped {
            return FireAction::Rearmed;
        }
        self.next_run_at = None;
        self.drop_stale_suppression(now);

        if !self.window.contains(now) {
            if self.state != ScheduleState::Suppressed {
                self.state = ScheduleState::ArmedPreWindow;
            }
            self.next_run_at = Some(self.window.next_open_after(now));
            return FireAction::Rearmed;
        }

        self.last_check_at = Some(now);
        if self.is_suppressed_at(now) {
            FireAction::VerifySuppression
        } else {
            self.state = ScheduleState::ActivePolling;
            FireAction::Reconcile
        }
    }

    /// Record a finished reconciliation. A complete today suppresses polling
    /// until tomorrow's opening; otherwise poll again shortly while the window
    /// is still open, or wait for the next opening.
    pub fn after_reconcile(&mut self, now: DateTime<Utc>, today_complete: bool) {
        if self.state == ScheduleState::Stopped {
            return;
        }
        self.last_check_at = Some(now);
        if today_complete {
            self.state = ScheduleState::Suppressed;
            self.suppressed_date = Some(self.reference.today(now));
            self.next_run_at = Some(self.window.next_open_after(now));
            return;
        }

        self.suppressed_date = None;
        let next = now + self.poll;
        if self.window.contains(now) && self.window.contains(next) {
            self.state = ScheduleState::ActivePolling;
            self.next_run_at = Some(next);
        } else {
            self.state = ScheduleState::ArmedPreWindow;
            self.next_run_at = Some(self.window.next_open_after(now));
        }
    }

    /// Local data still shows today complete: stay suppressed until tomorrow.
    pub fn keep_suppressed(&mut self, now: DateTime<Utc>) {
        if self.state == ScheduleState::Stopped {
            return;
        }
        self.last_check_at = Some(now);
        self.next_run_at = Some(self.window.next_open_after(now));
    }

    pub fn clear_suppression(&mut self, now: DateTime<Utc>) {
        self.suppressed_date = None;
        if self.state == ScheduleState::Suppressed {
            self.arm(now);
        }
    }

    /// Replace the pending timer with one `delay` from now.
    pub fn rearm_in(&mut self, now: DateTime<Utc>, delay: TimeDelta) {
        if self.state == ScheduleState::Stopped {
            return;
        }
        self.next_run_at = Some(now + delay);
        if self.state != ScheduleState::Suppressed {
            self.state = if self.window.contains(now) {
                ScheduleState::ActivePolling
            } else {
                ScheduleState::ArmedPreWindow
            };
        }
    }

    pub fn stop(&mut self) {
        self.state = ScheduleState::Stopped;
        self.next_run_at = None;
    }

    pub fn status(&self, watchdog_active: bool, fallback_active: bool) -> ScheduleStatus {
        ScheduleStatus {
            state: self.state,
            next_run_at: self.next_fire_time(),
            last_check_at: self.last_check_at,
            suppressed_date: self.suppressed_date,
            watchdog_active,
            fallback_active,
        }
    }

    fn arm(&mut self, now: DateTime<Utc>) {
        if self.window.contains(now) {
            self.state = ScheduleState::ActivePolling;
            self.next_run_at = Some(now);
        } else {
            self.state = ScheduleState::ArmedPreWindow;
            self.next_run_at = Some(self.window.next_open_after(now));
        }
    }

    fn drop_stale_suppression(&mut self, now: DateTime<Utc>) {
        if self.suppressed_date.is_some() && !self.is_suppressed_at(now) {
            self.suppressed_date = None;
            if self.state == ScheduleState::Suppressed {
                self.state = ScheduleState::ArmedPreWindow;
            }
        }
    }
}
