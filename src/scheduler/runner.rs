//! Drives the daily schedule and the independent periodic triggers. Every
//! trigger funnels into [`ReconcileEngine::trigger`], whose in-flight gate
//! turns overlapping requests into skipped runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Utc, Weekday};
use serde_json::json;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, sleep};
use tracing::{debug, error, info, warn};

use super::fallback::{self, FallbackDecision};
use super::state::{DailySchedule, FireAction, PublicationWindow};
use super::wake::WakeDetector;
use super::watchdog::{self, WatchdogAction};
use crate::api::health::HealthState;
use crate::calendar::MarketCalendar;
use crate::config::{
    Config, CATCH_UP_MISSING_HOURS, FALLBACK_INTERVAL_SECS, HEALTH_INTERVAL_SECS, NEXT_DAY_CHECK_HOUR,
    NEXT_DAY_CHECK_MINUTE, WATCHDOG_INTERVAL_SECS, WEEKLY_SYNC_HOUR,
};
use crate::error::Result;
use crate::sync::backfill::Backfill;
use crate::sync::engine::ReconcileEngine;
use crate::types::{Entity, ReconcileOutcome, ScheduleStatus, SyncRun, SyncRunKind, SyncRunStatus};

/// Longest single sleep. Wall-clock jumps are noticed within this bound.
const MAX_SLEEP: Duration = Duration::from_secs(60);

pub struct Scheduler {
    engine: Arc<ReconcileEngine>,
    health: Arc<HealthState>,
    schedule: Mutex<DailySchedule>,
    wake_detector: Mutex<WakeDetector>,
    rearmed: Notify,
    shutdown: watch::Sender<bool>,
    watchdog_active: AtomicBool,
    fallback_active: AtomicBool,
}

impl Scheduler {
    pub fn new(cfg: &Config, engine: Arc<ReconcileEngine>, health: Arc<HealthState>) -> Self {
        let clock = engine.clock();
        let schedule = DailySchedule::new(PublicationWindow::from_config(cfg), *engine.calendar());
        let wake_detector = WakeDetector::new(clock.now(), clock.uptime());
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            health,
            schedule: Mutex::new(schedule),
            wake_detector: Mutex::new(wake_detector),
            rearmed: Notify::new(),
            shutdown,
            watchdog_active: AtomicBool::new(false),
            fallback_active: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }

    pub fn status(&self) -> ScheduleStatus {
        self.schedule().status(
            self.watchdog_active.load(Ordering::Relaxed),
            self.fallback_active.load(Ordering::Relaxed),
        )
    }

    pub fn shutdown(&self) {
        self.schedule().stop();
        self.shutdown.send_replace(true);
        self.rearmed.notify_waiters();
        info!("[Daily Sync] scheduler stopped");
    }

    fn schedule(&self) -> MutexGuard<'_, DailySchedule> {
        self.schedule.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.engine.clock().now()
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Backfill on first start, otherwise a recovery pass from the watermarks.
    /// Then arm the window schedule; outside the window one daily check runs now.
    pub async fn startup(&self, backfill: &Backfill) {
        let store = self.engine.store();
        match store.initial_sync_completed().await {
            Ok(Some(through)) => {
                info!(through = %through, "[Daily Sync] initial sync already done, running recovery pass");
                self.engine.trigger(SyncRunKind::WakeRecovery, None).await;
            }
            Ok(None) => {
                info!("[Backfill] no initial sync recorded, starting backfill");
                if let Err(e) = backfill.run().await {
                    error!("[Backfill] aborted: {e}");
                }
                self.engine.trigger(SyncRunKind::Startup, None).await;
            }
            Err(e) => {
                error!("[Daily Sync] failed to read initial sync flag: {e}");
                self.engine.trigger(SyncRunKind::Startup, None).await;
            }
        }

        let now = self.now();
        let in_window = {
            let mut schedule = self.schedule();
            schedule.start(now);
            schedule.window().contains(now)
        };
        self.rearmed.notify_one();
        if !in_window {
            info!("[Daily Sync] started outside the publication window, checking once");
            self.run_check(SyncRunKind::Scheduled).await;
        }
        let status = self.status();
        info!(state = %status.state, next_run_at = ?status.next_run_at, "[Daily Sync] schedule armed");
    }

    // -----------------------------------------------------------------------
    // Window timer
    // -----------------------------------------------------------------------

    /// Sleeps until the schedule's next fire time, fires, repeats. Re-reads the
    /// target whenever something else moves the timer.
    pub async fn run_driver(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_shutting_down() {
                break;
            }
            let next = self.schedule().next_fire_time();
            let wait = match next {
                Some(t) => (t - self.now()).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP),
                None => MAX_SLEEP,
            };
            tokio::select! {
                _ = sleep(wait) => {}
                _ = self.rearmed.notified() => continue,
                _ = shutdown.changed() => break,
            }
            let now = self.now();
            if next.is_some_and(|t| t <= now) {
                self.fire(now).await;
            }
        }
        debug!("[Daily Sync] driver exited");
    }

    pub(crate) async fn fire(&self, now: DateTime<Utc>) {
        let action = self.schedule().on_fire(now);
        match action {
            FireAction::Rearmed => {
                let next = self.schedule().next_fire_time();
                info!(next_run_at = ?next, "[Daily Sync] outside publication window, waiting for next opening");
            }
            FireAction::Reconcile => {
                self.run_check(SyncRunKind::Scheduled).await;
            }
            FireAction::VerifySuppression => {
                if !self.verify_suppression(now).await {
                    self.run_check(SyncRunKind::Scheduled).await;
                }
            }
        }
    }

    /// Reconcile and feed the outcome back into the schedule. Always re-arms.
    async fn run_check(&self, kind: SyncRunKind) -> ReconcileOutcome {
        let outcome = self.engine.trigger(kind, None).await;
        let today_complete = self.settled_today_complete(&outcome).await;
        let now = self.now();
        {
            let mut schedule = self.schedule();
            schedule.after_reconcile(now, today_complete);
            info!(
                kind = %kind,
                status = %outcome.status,
                ingested = outcome.ingested(),
                state = %schedule.state(),
                next_run_at = ?schedule.next_fire_time(),
                "[Daily Sync] check finished"
            );
        }
        self.rearmed.notify_one();
        outcome
    }

    /// Whether today is complete after `outcome`. A skipped or failed pass says
    /// nothing about the data, so local completeness decides.
    async fn settled_today_complete(&self, outcome: &ReconcileOutcome) -> bool {
        match outcome.status {
            SyncRunStatus::Skipped | SyncRunStatus::Error => {
                let today = self.engine.calendar().today(self.now());
                match self.engine.oracle().is_date_complete(today).await {
                    Ok(c) => c.is_complete,
                    Err(e) => {
                        error!("[Daily Sync] completeness check failed: {e}");
                        false
                    }
                }
            }
            _ => outcome.today_complete,
        }
    }

    /// Re-check local completeness of today. True when today is still complete
    /// and the schedule stays suppressed; false when suppression was lifted.
    async fn verify_suppression(&self, now: DateTime<Utc>) -> bool {
        let today = self.engine.calendar().today(now);
        match self.engine.oracle().is_date_complete(today).await {
            Ok(c) if c.is_complete => {
                self.schedule().keep_suppressed(now);
                self.rearmed.notify_one();
                debug!(date = %today, "[Daily Sync] suppressed - today is already complete");
                self.record(
                    SyncRun::started(SyncRunKind::DailyCheck, now)
                        .finish(SyncRunStatus::Skipped, self.now(), 0)
                        .with_details(json!({ "message": "Today is already complete, no sync needed" })),
                )
                .await;
                true
            }
            Ok(_) => {
                warn!(date = %today, "[Daily Sync] today is no longer complete, lifting suppression");
                self.schedule().clear_suppression(now);
                false
            }
            Err(e) => {
                error!("[Daily Sync] completeness check failed: {e}");
                self.schedule().clear_suppression(now);
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Watchdog
    // -----------------------------------------------------------------------

    pub async fn run_watchdog(self: Arc<Self>) {
        self.watchdog_active.store(true, Ordering::Relaxed);
        info!("[Watchdog] started (every {} minutes)", WATCHDOG_INTERVAL_SECS / 60);
        self.every(Duration::from_secs(WATCHDOG_INTERVAL_SECS), || self.watchdog_tick()).await;
        self.watchdog_active.store(false, Ordering::Relaxed);
    }

    pub(crate) async fn watchdog_tick(&self) {
        let started = Instant::now();
        let now = self.now();
        let report = if self.engine.is_busy() {
            watchdog::WatchdogReport {
                action: WatchdogAction::None,
                message: "No action needed - reconciliation in progress".to_string(),
            }
        } else {
            watchdog::check(&mut self.schedule(), now)
        };

        match report.action {
            WatchdogAction::None => debug!("[Watchdog] {}", report.message),
            _ => warn!("[Watchdog] {}", report.message),
        }
        if report.moved_timer() {
            self.rearmed.notify_one();
        }
        if report.action == WatchdogAction::ForceCheck {
            self.run_check(SyncRunKind::Watchdog).await;
        }

        self.record(
            SyncRun::started(SyncRunKind::WatchdogCheck, now)
                .finish(SyncRunStatus::Success, self.now(), started.elapsed().as_millis() as i64)
                .with_details(json!({ "action": report.message })),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Fallback poller
    // -----------------------------------------------------------------------

    pub async fn run_fallback(self: Arc<Self>) {
        self.fallback_active.store(true, Ordering::Relaxed);
        info!("[Fallback] started (every {} minutes inside the window)", FALLBACK_INTERVAL_SECS / 60);
        self.every(Duration::from_secs(FALLBACK_INTERVAL_SECS), || self.fallback_tick()).await;
        self.fallback_active.store(false, Ordering::Relaxed);
    }

    pub(crate) async fn fallback_tick(&self) {
        let started = Instant::now();
        let now = self.now();
        let (window, suppressed, last_check) = {
            let s = self.schedule();
            (*s.window(), s.is_suppressed_at(now), s.last_check_at())
        };
        let last_success = match self.engine.store().last_success_at(&SyncRunKind::RECONCILE).await {
            Ok(t) => t,
            Err(e) => {
                error!("[Fallback] failed to read run log: {e}");
                None
            }
        };
        let last_run = last_check.max(last_success);

        let decision = fallback::decide(&window, now, suppressed, last_run);
        let status = match decision {
            FallbackDecision::OutsideWindow => return,
            FallbackDecision::Suppressed => {
                if self.verify_suppression(now).await {
                    SyncRunStatus::Skipped
                } else {
                    self.run_check(SyncRunKind::Fallback).await;
                    SyncRunStatus::Success
                }
            }
            FallbackDecision::Healthy { minutes_since } => {
                debug!(minutes_since, "[Fallback] dynamic sync is working, skipping");
                SyncRunStatus::Skipped
            }
            FallbackDecision::Force { .. } => {
                warn!("[Fallback] {}", decision.message());
                self.run_check(SyncRunKind::Fallback).await;
                SyncRunStatus::Success
            }
        };

        self.record(
            SyncRun::started(SyncRunKind::FallbackCheck, now)
                .finish(status, self.now(), started.elapsed().as_millis() as i64)
                .with_details(json!({ "action": decision.message() })),
        )
        .await;
    }

    // -----------------------------------------------------------------------
    // Hourly health check
    // -----------------------------------------------------------------------

    pub async fn run_health(self: Arc<Self>) {
        info!("[Health Check] started (every {} minutes)", HEALTH_INTERVAL_SECS / 60);
        self.every(Duration::from_secs(HEALTH_INTERVAL_SECS), || self.health_tick()).await;
    }

    pub(crate) async fn health_tick(&self) {
        let started = Instant::now();
        let clock = self.engine.clock();
        let now = clock.now();
        let obs = self
            .wake_detector
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .observe(now, clock.uptime());

        if let Some(secs) = obs.suspended_secs {
            warn!(
                suspended_minutes = secs / 60,
                wall_since_start = obs.wall_since_start,
                process_since_start = obs.process_since_start,
                "[Health Check] suspend/resume detected, running recovery sync"
            );
            self.health.inc_wake_events();
            let outcome = self.engine.trigger(SyncRunKind::WakeRecovery, None).await;
            let today_complete = self.settled_today_complete(&outcome).await;
            self.schedule().after_reconcile(self.now(), today_complete);
            self.rearmed.notify_one();
        }

        let result = self.freshness(now).await;
        self.health.set_last_health_check_at(now.timestamp());

        let mut details = json!({
            "wall_since_last_secs": obs.wall_since_last,
            "process_since_last_secs": obs.process_since_last,
            "wall_since_start_secs": obs.wall_since_start,
            "process_since_start_secs": obs.process_since_start,
            "suspended_secs": obs.suspended_secs,
        });
        let run = SyncRun::started(SyncRunKind::HealthCheck, now);
        let run = match result {
            Ok((entities, lagging)) => {
                details["entities"] = json!(entities);
                details["issues"] = json!(lagging
                    .iter()
                    .map(|e| format!("{e}: more than {CATCH_UP_MISSING_HOURS}h missing"))
                    .collect::<Vec<_>>());
                if !lagging.is_empty() {
                    warn!(entities = ?lagging, "[Health Check] data is behind, scheduling catch-up");
                    let outcome = self.engine.trigger_with_retry(SyncRunKind::CatchUp, Some(lagging.as_slice())).await;
                    details["catch_up"] = json!({ "status": outcome.status, "ingested": outcome.ingested() });
                }
                info!(uptime_secs = obs.process_since_start, "[Health Check] done");
                run.finish(SyncRunStatus::Success, self.now(), started.elapsed().as_millis() as i64)
            }
            Err(e) => {
                error!("[Health Check] failed: {e}");
                run.finish(SyncRunStatus::Error, self.now(), started.elapsed().as_millis() as i64)
                    .with_error(e.to_string())
            }
        };
        self.record(run.with_details(details)).await;
    }

    /// Hours between each entity's latest stored slot and the end of tomorrow.
    /// Returns the per-entity report and the entities needing a catch-up.
    async fn freshness(&self, now: DateTime<Utc>) -> Result<(Vec<serde_json::Value>, Vec<Entity>)> {
        let calendar = self.engine.calendar();
        let target = calendar.day_end_instant(calendar.today(now) + TimeDelta::days(1));
        let mut report = Vec::new();
        let mut lagging = Vec::new();
        for entity in self.engine.entities() {
            let latest = self.engine.store().latest_instant(entity).await?;
            let missing_hours = latest.map(|t| (target - t).num_hours().max(0));
            if missing_hours.map_or(true, |h| h > CATCH_UP_MISSING_HOURS) {
                lagging.push(entity.clone());
            }
            report.push(json!({
                "entity": entity,
                "latest": latest,
                "missing_hours": missing_hours,
            }));
        }
        Ok((report, lagging))
    }

    // -----------------------------------------------------------------------
    // Weekly and next-day triggers
    // -----------------------------------------------------------------------

    /// Full reconciliation every Sunday at 02:00 reference time.
    pub async fn run_weekly(self: Arc<Self>) {
        let calendar = *self.engine.calendar();
        let at = NaiveTime::from_hms_opt(WEEKLY_SYNC_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
        loop {
            let target = next_weekly(&calendar, self.now(), Weekday::Sun, at);
            info!(next = %target, "[Daily Sync] weekly sync scheduled");
            if !self.sleep_until(target).await {
                break;
            }
            info!("[Daily Sync] running weekly full sync");
            self.engine.trigger(SyncRunKind::Weekly, None).await;
        }
    }

    /// Daily at 13:30 window time.
    pub async fn run_next_day(self: Arc<Self>) {
        let calendar = *self.schedule().window().calendar();
        let at = NaiveTime::from_hms_opt(NEXT_DAY_CHECK_HOUR, NEXT_DAY_CHECK_MINUTE, 0).unwrap_or(NaiveTime::MIN);
        loop {
            let target = next_daily(&calendar, self.now(), at);
            if !self.sleep_until(target).await {
                break;
            }
            self.next_day_tick().await;
        }
    }

    /// Reconcile only the entities the provider is ahead on.
    pub(crate) async fn next_day_tick(&self) -> ReconcileOutcome {
        let started = Instant::now();
        let now = self.now();
        let mut ahead = Vec::new();
        for entity in self.engine.entities() {
            let local = match self.engine.store().latest_instant(entity).await {
                Ok(t) => t,
                Err(e) => {
                    error!(entity = %entity, "[Daily Sync] next-day check failed: {e}");
                    continue;
                }
            };
            let remote = match self.engine.source().latest_timestamp(entity).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(entity = %entity, "[Upstream] latest lookup failed: {e}");
                    continue;
                }
            };
            let is_ahead = match (local, remote) {
                (None, _) => true,
                (Some(l), Some(r)) => r > l,
                (Some(_), None) => false,
            };
            if is_ahead {
                ahead.push(entity.clone());
            }
        }

        if ahead.is_empty() {
            info!("[Daily Sync] next-day check: provider has nothing newer");
            self.record(
                SyncRun::started(SyncRunKind::NextDay, now)
                    .finish(SyncRunStatus::Skipped, self.now(), started.elapsed().as_millis() as i64)
                    .with_details(json!({ "message": "Provider has nothing newer" })),
            )
            .await;
            return ReconcileOutcome::skipped();
        }
        info!(entities = ?ahead, "[Daily Sync] next-day check: provider is ahead");
        self.engine.trigger(SyncRunKind::NextDay, Some(ahead.as_slice())).await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn every<F, Fut>(&self, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(period);
        ticker.tick().await; // consume immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Sleep in bounded steps until the wall clock reaches `target`. False on shutdown.
    async fn sleep_until(&self, target: DateTime<Utc>) -> bool {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if self.is_shutting_down() {
                return false;
            }
            let now = self.now();
            if now >= target {
                return true;
            }
            let wait = (target - now).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP);
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => return false,
            }
        }
    }

    async fn record(&self, run: SyncRun) {
        if let Err(e) = self.engine.store().record_run(&run).await {
            error!(kind = %run.kind, "failed to record run: {e}");
        }
    }
}

/// Next `time` on `calendar` strictly after `now`.
pub fn next_daily(calendar: &MarketCalendar, now: DateTime<Utc>, time: NaiveTime) -> DateTime<Utc> {
    let today = calendar.date_of(now);
    let candidate = calendar.at(today, time);
    if candidate > now {
        candidate
    } else {
        calendar.at(today + TimeDelta::days(1), time)
    }
}

/// Next `weekday` at `time` on `calendar` strictly after `now`.
pub fn next_weekly(calendar: &MarketCalendar, now: DateTime<Utc>, weekday: Weekday, time: NaiveTime) -> DateTime<Utc> {
    let today = calendar.date_of(now);
    let ahead = (7 + weekday.num_days_from_monday() as i64 - today.weekday().num_days_from_monday() as i64) % 7;
    let candidate = calendar.at(today + TimeDelta::days(ahead), time);
    if candidate > now {
        candidate
    } else {
        calendar.at(today + TimeDelta::days(ahead + 7), time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::engine::tests::{date, harness, noon, publish, Harness};
    use crate::types::ScheduleState;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn scheduler(h: &Harness) -> Scheduler {
        Scheduler::new(&Config::default(), h.engine.clone(), Arc::new(HealthState::new()))
    }

    async fn runs_of(h: &Harness, kind: SyncRunKind) -> Vec<SyncRun> {
        h.store.recent_runs(50, Some(kind)).await.unwrap()
    }

    #[test]
    fn weekly_target_is_next_sunday_two_am_vilnius() {
        let cal = MarketCalendar::new(chrono_tz::Europe::Vilnius);
        let two = NaiveTime::from_hms_opt(2, 0, 0).unwrap();
        // Tuesday 2025-06-10 -> Sunday 2025-06-15 02:00 EEST = 2025-06-14T23:00Z
        assert_eq!(next_weekly(&cal, noon(), Weekday::Sun, two), at("2025-06-14T23:00:00Z"));
        // Exactly at the target rolls a full week.
        assert_eq!(
            next_weekly(&cal, at("2025-06-14T23:00:00Z"), Weekday::Sun, two),
            at("2025-06-21T23:00:00Z")
        );
    }

    #[test]
    fn daily_target_rolls_to_tomorrow_once_passed() {
        let cal = MarketCalendar::new(chrono_tz::Europe::Paris);
        let t = NaiveTime::from_hms_opt(13, 30, 0).unwrap();
        assert_eq!(next_daily(&cal, at("2025-06-10T09:00:00Z"), t), at("2025-06-10T11:30:00Z"));
        assert_eq!(next_daily(&cal, noon(), t), at("2025-06-11T11:30:00Z"));
    }

    #[tokio::test]
    async fn complete_today_suppresses_upstream_fetches() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let s = scheduler(&h);

        let now = at("2025-06-10T11:00:00Z");
        h.clock.set(now);
        s.schedule().start(now);
        s.fire(now).await;
        assert_eq!(s.status().state, ScheduleState::Suppressed);
        assert_eq!(s.status().suppressed_date, Some(date("2025-06-10")));
        let fetches = h.upstream.range_calls();
        assert_eq!(fetches, 1);

        // Fallback and watchdog keep ticking but never reach upstream.
        for minutes in [15, 30, 45] {
            h.clock.set(now + TimeDelta::minutes(minutes));
            s.fallback_tick().await;
            s.watchdog_tick().await;
        }
        assert_eq!(h.upstream.range_calls(), fetches);
        assert_eq!(s.status().state, ScheduleState::Suppressed);
        assert!(runs_of(&h, SyncRunKind::Fallback).await.is_empty());
        let checks = runs_of(&h, SyncRunKind::FallbackCheck).await;
        assert_eq!(checks.len(), 3);
        assert!(checks.iter().all(|r| r.status == SyncRunStatus::Skipped));
        let watchdog = runs_of(&h, SyncRunKind::WatchdogCheck).await;
        assert_eq!(watchdog[0].details.as_ref().unwrap()["action"], "No action needed - sync is healthy");

        // Today regresses locally: the next fallback tick lifts suppression and reconciles.
        let (start, end) = h.engine.calendar().day_bounds(date("2025-06-10"));
        h.store.delete_prices_in_range(&Entity::new("lt"), start, end).await.unwrap();
        h.clock.set(now + TimeDelta::minutes(60));
        s.fallback_tick().await;
        assert_eq!(runs_of(&h, SyncRunKind::Fallback).await.len(), 1);
        assert_ne!(s.status().suppressed_date, Some(date("2025-06-10")));
    }

    #[tokio::test]
    async fn date_change_clears_suppression() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let s = scheduler(&h);
        let now = at("2025-06-10T11:00:00Z");
        h.clock.set(now);
        s.schedule().start(now);
        s.fire(now).await;
        assert_eq!(s.status().state, ScheduleState::Suppressed);

        h.clock.set(at("2025-06-11T11:00:00Z"));
        s.watchdog_tick().await;
        let status = s.status();
        assert_eq!(status.state, ScheduleState::ActivePolling);
        assert_eq!(status.suppressed_date, None);
        let watchdog = runs_of(&h, SyncRunKind::WatchdogCheck).await;
        assert_eq!(watchdog[0].details.as_ref().unwrap()["action"], "Cleared suppression - date changed");
    }

    #[tokio::test]
    async fn incomplete_today_keeps_polling() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-09");
        let s = scheduler(&h);
        let now = at("2025-06-10T11:00:00Z");
        h.clock.set(now);
        s.schedule().start(now);
        s.fire(now).await;

        let status = s.status();
        assert_eq!(status.state, ScheduleState::ActivePolling);
        assert_eq!(status.next_run_at, Some(now + TimeDelta::minutes(5)));
        assert_eq!(runs_of(&h, SyncRunKind::Scheduled).await.len(), 1);
    }

    #[tokio::test]
    async fn fallback_forces_a_run_when_nothing_ran() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-09");
        let s = scheduler(&h);
        h.clock.set(at("2025-06-10T11:00:00Z"));
        s.fallback_tick().await;

        assert_eq!(runs_of(&h, SyncRunKind::Fallback).await.len(), 1);
        let check = &runs_of(&h, SyncRunKind::FallbackCheck).await[0];
        assert_eq!(check.status, SyncRunStatus::Success);
        assert_eq!(check.details.as_ref().unwrap()["action"], "Forced check - no check recorded yet");
    }

    #[tokio::test]
    async fn fallback_is_silent_outside_window() {
        let h = harness("lt", "2025-06-05").await;
        let s = scheduler(&h);
        h.clock.set(at("2025-06-10T18:00:00Z"));
        s.fallback_tick().await;
        assert!(runs_of(&h, SyncRunKind::FallbackCheck).await.is_empty());
        assert_eq!(h.upstream.range_calls(), 0);
    }

    #[tokio::test]
    async fn health_check_detects_resume_and_catches_up() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let health = Arc::new(HealthState::new());
        let s = Scheduler::new(&Config::default(), h.engine.clone(), health.clone());

        h.clock.set(at("2025-06-10T06:00:00Z"));
        s.health_tick().await;
        // Nothing stored yet: the entity is lagging and gets a catch-up run.
        let catch_up = runs_of(&h, SyncRunKind::CatchUp).await;
        assert_eq!(catch_up.len(), 1);
        assert_eq!(catch_up[0].status, SyncRunStatus::Success);
        assert_eq!(health.wake_events(), 0);

        h.clock.suspend(Duration::from_secs(2 * 3_600));
        s.health_tick().await;
        assert_eq!(health.wake_events(), 1);
        assert_eq!(runs_of(&h, SyncRunKind::WakeRecovery).await.len(), 1);
        // Data is fresh now, so no second catch-up.
        assert_eq!(runs_of(&h, SyncRunKind::CatchUp).await.len(), 1);

        let ticks = runs_of(&h, SyncRunKind::HealthCheck).await;
        assert_eq!(ticks.len(), 2);
        let latest = ticks[0].details.as_ref().unwrap();
        assert_eq!(latest["suspended_secs"], 7_200);
        assert_eq!(latest["entities"][0]["missing_hours"], 0);
    }

    #[tokio::test]
    async fn skipped_wake_recovery_keeps_suppression() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let now = at("2025-06-10T11:00:00Z");
        h.clock.set(now);
        let s = scheduler(&h);
        s.schedule().start(now);
        s.fire(now).await;
        assert_eq!(s.status().state, ScheduleState::Suppressed);
        let fetches = h.upstream.range_calls();

        // A manual pass holds the engine while the host sleeps for ten minutes.
        let guard = h.engine.try_acquire().unwrap();
        h.clock.advance(Duration::from_secs(60));
        h.clock.suspend(Duration::from_secs(600));
        s.health_tick().await;
        drop(guard);

        let recovery = runs_of(&h, SyncRunKind::WakeRecovery).await;
        assert_eq!(recovery.len(), 1);
        assert_eq!(recovery[0].status, SyncRunStatus::Skipped);
        let status = s.status();
        assert_eq!(status.state, ScheduleState::Suppressed);
        assert_eq!(status.suppressed_date, Some(date("2025-06-10")));
        assert!(status.next_run_at.is_some_and(|t| t > at("2025-06-11T00:00:00Z")));
        assert_eq!(h.upstream.range_calls(), fetches);
    }

    #[tokio::test]
    async fn failed_check_with_complete_local_today_suppresses() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let now = at("2025-06-10T11:00:00Z");
        h.clock.set(now);
        h.engine.trigger(SyncRunKind::Manual, None).await;

        // Provider has a newer day, but the fetch fails.
        publish(&h.upstream, "lt", "2025-06-12", "2025-06-12");
        h.upstream.fail_next(1);
        let s = scheduler(&h);
        s.schedule().start(now);
        s.fire(now).await;

        let scheduled = runs_of(&h, SyncRunKind::Scheduled).await;
        assert_eq!(scheduled[0].status, SyncRunStatus::Error);
        assert_eq!(s.status().state, ScheduleState::Suppressed);
        assert_eq!(s.status().suppressed_date, Some(date("2025-06-10")));
    }

    #[tokio::test]
    async fn next_day_check_skips_when_provider_is_not_ahead() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        h.engine.trigger(SyncRunKind::Manual, None).await;
        let s = scheduler(&h);

        let out = s.next_day_tick().await;
        assert_eq!(out.status, SyncRunStatus::Skipped);
        let runs = runs_of(&h, SyncRunKind::NextDay).await;
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, SyncRunStatus::Skipped);

        publish(&h.upstream, "lt", "2025-06-12", "2025-06-12");
        let out = s.next_day_tick().await;
        assert_eq!(out.status, SyncRunStatus::Success);
        assert_eq!(out.synced, vec![Entity::new("lt")]);
    }

    #[tokio::test]
    async fn startup_backfills_once_then_recovers() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let s = scheduler(&h);
        let cfg = Config { earliest_date: date("2025-06-05"), backfill_chunk_delay_ms: 0, ..Config::default() };
        let backfill = Backfill::new(&cfg, h.engine.clone());

        h.clock.set(at("2025-06-10T06:00:00Z"));
        s.startup(&backfill).await;
        assert_eq!(h.store.initial_sync_completed().await.unwrap(), Some(date("2025-06-11")));
        assert_eq!(runs_of(&h, SyncRunKind::Startup).await.len(), 1);
        // Outside the window: one immediate daily check, then armed.
        assert_eq!(runs_of(&h, SyncRunKind::Scheduled).await.len(), 1);
        assert!(s.status().next_run_at.is_some());

        let s = scheduler(&h);
        s.startup(&backfill).await;
        assert_eq!(runs_of(&h, SyncRunKind::WakeRecovery).await.len(), 1);
        assert_eq!(runs_of(&h, SyncRunKind::Backfill).await.len(), 1);
    }
}
