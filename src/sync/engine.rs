use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::api::health::HealthState;
use crate::calendar::MarketCalendar;
use crate::clock::Clock;
use crate::config::{
    Config, CATCH_UP_BASE_DELAY_MS, CATCH_UP_MAX_ATTEMPTS, COMPLETE_LOOKBACK_DAYS, HORIZON_DAYS, SCAN_DAYS_AHEAD,
};
use crate::db::Store;
use crate::error::Result;
use crate::sync::ingest::Ingestor;
use crate::sync::oracle::CompletenessOracle;
use crate::sync::retry::RetryPolicy;
use crate::sync::watermark::WatermarkStore;
use crate::types::{Entity, ReconcileOutcome, SyncRun, SyncRunKind, SyncRunStatus, SyncWatermark};
use crate::upstream::PriceSource;

/// Held while a reconciliation (or backfill) is running.
pub struct InFlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct EntityPlan {
    entity: Entity,
    start: NaiveDate,
    trustworthy: bool,
    local_latest: Option<DateTime<Utc>>,
}

/// Fetch-decide-ingest-update cycle. Every trigger funnels through [`ReconcileEngine::trigger`].
pub struct ReconcileEngine {
    source: Arc<dyn PriceSource>,
    store: Store,
    oracle: CompletenessOracle,
    watermarks: WatermarkStore,
    ingestor: Ingestor,
    calendar: MarketCalendar,
    entities: Vec<Entity>,
    earliest: NaiveDate,
    clock: Arc<dyn Clock>,
    health: Arc<HealthState>,
    retry: RetryPolicy,
    in_flight: AtomicBool,
}

impl ReconcileEngine {
    pub fn new(
        cfg: &Config,
        store: Store,
        source: Arc<dyn PriceSource>,
        clock: Arc<dyn Clock>,
        health: Arc<HealthState>,
    ) -> Self {
        let calendar = MarketCalendar::new(cfg.reference_tz);
        let oracle = CompletenessOracle::new(store.clone(), calendar, cfg.bounds, cfg.entities.clone());
        Self {
            source,
            oracle,
            watermarks: WatermarkStore::new(store.clone()),
            ingestor: Ingestor::new(store.clone()),
            store,
            calendar,
            entities: cfg.entities.clone(),
            earliest: cfg.earliest_date,
            clock,
            health,
            retry: RetryPolicy::new(
                CATCH_UP_MAX_ATTEMPTS,
                CATCH_UP_BASE_DELAY_MS,
                CATCH_UP_BASE_DELAY_MS * 4,
                0.1,
            ),
            in_flight: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn oracle(&self) -> &CompletenessOracle {
        &self.oracle
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn calendar(&self) -> &MarketCalendar {
        &self.calendar
    }

    pub fn source(&self) -> &dyn PriceSource {
        self.source.as_ref()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Take the single in-flight slot. None when something else holds it.
    pub fn try_acquire(&self) -> Option<InFlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightGuard { flag: &self.in_flight })
    }

    // -----------------------------------------------------------------------
    // Trigger boundary
    // -----------------------------------------------------------------------

    /// Run one reconciliation for `entities` (all tracked when None) and log it
    /// as a run of `kind`. Never fails; errors end up in the outcome and the run log.
    pub async fn trigger(&self, kind: SyncRunKind, entities: Option<&[Entity]>) -> ReconcileOutcome {
        let started_at = self.clock.now();
        let started = Instant::now();
        let entities = entities.filter(|e| !e.is_empty()).unwrap_or(self.entities.as_slice());

        let outcome = match self.reconcile(entities, started_at).await {
            Ok(o) => o,
            Err(e) => {
                error!(kind = %kind, "[Reconcile] failed: {e}");
                ReconcileOutcome::failed(e.to_string())
            }
        };

        let completed_at = self.clock.now();
        let mut run = SyncRun::started(kind, started_at)
            .finish(outcome.status, completed_at, started.elapsed().as_millis() as i64)
            .with_records(outcome.records)
            .with_details(json!({
                "entities": outcome.synced,
                "fetched": outcome.fetched.map(|(s, e)| [s.to_string(), e.to_string()]),
                "today_complete": outcome.today_complete,
            }));
        if let Some(msg) = &outcome.error {
            run = run.with_error(msg.clone());
        }
        if let Err(e) = self.store.record_run(&run).await {
            error!("[Reconcile] failed to record run: {e}");
        }
        if outcome.status != SyncRunStatus::Skipped {
            self.health.record_reconcile(
                completed_at.timestamp(),
                outcome.status == SyncRunStatus::Success,
                outcome.ingested(),
            );
        }
        outcome
    }

    /// Catch-up path with bounded exponential backoff between failed attempts.
    pub async fn trigger_with_retry(&self, kind: SyncRunKind, entities: Option<&[Entity]>) -> ReconcileOutcome {
        let result = self
            .retry
            .retry_async(|attempt| async move {
                if attempt > 0 {
                    warn!(kind = %kind, attempt, "[Reconcile] retrying");
                }
                let outcome = self.trigger(kind, entities).await;
                match outcome.status {
                    SyncRunStatus::Error => Err(outcome),
                    _ => Ok(outcome),
                }
            })
            .await;
        result.unwrap_or_else(|outcome| outcome)
    }

    // -----------------------------------------------------------------------
    // Core
    // -----------------------------------------------------------------------

    /// Bring `entities` up to date as of `now`. Returns a skipped outcome when
    /// another pass is in flight. Upstream and store errors propagate.
    pub async fn reconcile(&self, entities: &[Entity], now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let Some(_guard) = self.try_acquire() else {
            info!("[Reconcile] another pass is in flight, skipping");
            return Ok(ReconcileOutcome::skipped());
        };
        self.reconcile_locked(entities, now).await
    }

    async fn reconcile_locked(&self, entities: &[Entity], now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let today = self.calendar.today(now);
        let tomorrow = today + TimeDelta::days(1);
        let horizon = today + TimeDelta::days(HORIZON_DAYS);

        let mut outcome = ReconcileOutcome {
            status: SyncRunStatus::Success,
            ..ReconcileOutcome::skipped()
        };

        let mut plans = Vec::new();
        for entity in entities {
            let wm = match self.watermarks.get(entity).await? {
                Some(wm) => wm,
                None => self.seed_watermark(entity, horizon, now).await?,
            };
            if wm.trustworthy && wm.last_complete_date >= horizon {
                debug!(entity = %entity, date = %wm.last_complete_date, "[Reconcile] at horizon");
                continue;
            }
            let start = if wm.trustworthy {
                wm.last_complete_date + TimeDelta::days(1)
            } else {
                wm.last_complete_date - TimeDelta::days(1)
            };
            plans.push(EntityPlan {
                entity: entity.clone(),
                start: start.max(self.earliest),
                trustworthy: wm.trustworthy,
                local_latest: self.store.latest_instant(entity).await?,
            });
        }

        if plans.is_empty() {
            info!("[Reconcile] every entity is synced through the horizon");
            outcome.today_complete = self.oracle.is_date_complete(today).await?.is_complete;
            return Ok(outcome);
        }

        let synced: Vec<Entity> = plans.iter().map(|p| p.entity.clone()).collect();
        let fetch_start = plans.iter().map(|p| p.start).min().unwrap_or(today);

        let mut upstream_latest: Option<NaiveDate> = None;
        for p in &plans {
            let found = self
                .source
                .latest_available_date(&p.entity, fetch_start, SCAN_DAYS_AHEAD, p.local_latest)
                .await?;
            upstream_latest = upstream_latest.max(found);
        }

        let mut should_fetch = true;
        let target_end = match upstream_latest {
            Some(d) => d.min(horizon).max(fetch_start),
            None if plans.iter().all(|p| p.trustworthy) => {
                info!("[Reconcile] upstream has nothing newer than local data");
                should_fetch = false;
                horizon
            }
            None => horizon,
        };

        if should_fetch
            && self.oracle.is_date_complete_for(today, &synced).await?.is_complete
            && !self.oracle.is_date_complete_for(tomorrow, &synced).await?.is_complete
        {
            let mut beyond: Option<NaiveDate> = None;
            for p in &plans {
                let found = self
                    .source
                    .latest_available_date(&p.entity, tomorrow, SCAN_DAYS_AHEAD, p.local_latest)
                    .await?;
                beyond = beyond.max(found);
            }
            if beyond.is_none() {
                info!(%today, %tomorrow, "[Reconcile] today complete, nothing more published for tomorrow; skipping fetch");
                should_fetch = false;
            }
        }

        if should_fetch {
            info!(
                start = %fetch_start,
                end = %target_end,
                entities = synced.len(),
                "[Reconcile] fetching {fetch_start}..{target_end}"
            );
            let batch = self.source.fetch_range(fetch_start, target_end, &synced).await?;
            outcome.records = self.ingestor.ingest(batch, &synced).await?;
            outcome.fetched = Some((fetch_start, target_end));
            self.refresh_watermarks(&synced, horizon, now).await?;
        } else if plans.iter().any(|p| !p.trustworthy) {
            self.refresh_watermarks(&synced, horizon, now).await?;
        }

        outcome.synced = synced;
        outcome.today_complete = self.oracle.is_date_complete(today).await?.is_complete;
        info!(
            ingested = outcome.ingested(),
            today_complete = outcome.today_complete,
            "[Reconcile] done"
        );
        Ok(outcome)
    }

    /// First watermark for an entity, derived from what is already stored.
    async fn seed_watermark(&self, entity: &Entity, horizon: NaiveDate, now: DateTime<Utc>) -> Result<SyncWatermark> {
        let Some(latest) = self.store.latest_instant(entity).await? else {
            return self
                .watermarks
                .initialize_if_absent(entity, self.earliest, None, false, now)
                .await;
        };

        let latest_date = self.calendar.date_of(latest);
        let single = std::slice::from_ref(entity);
        let complete = self
            .oracle
            .latest_complete_date(latest_date, COMPLETE_LOOKBACK_DAYS, single, self.earliest)
            .await?;

        match complete {
            Some(d) => {
                let d = d.min(horizon);
                self.watermarks
                    .initialize_if_absent(entity, d, Some(self.calendar.day_end_instant(d)), true, now)
                    .await
            }
            None => {
                self.watermarks
                    .initialize_if_absent(entity, latest_date.min(horizon), Some(latest), false, now)
                    .await
            }
        }
    }

    /// Walk back from the newest stored date to the most recent complete one and
    /// move every entity's watermark there. Trustworthy watermarks never move back.
    async fn refresh_watermarks(&self, entities: &[Entity], horizon: NaiveDate, now: DateTime<Utc>) -> Result<()> {
        let Some(max_instant) = self.store.max_instant(entities).await? else {
            debug!("[Reconcile] no stored data yet, watermarks unchanged");
            return Ok(());
        };
        let max_date = self.calendar.date_of(max_instant).min(horizon);
        let complete = self
            .oracle
            .latest_complete_date(max_date, COMPLETE_LOOKBACK_DAYS, entities, self.earliest)
            .await?;

        for entity in entities {
            let existing = self.watermarks.get(entity).await?;
            match complete {
                Some(found) => {
                    let date = match &existing {
                        Some(w) if w.trustworthy && w.last_complete_date > found => w.last_complete_date,
                        _ => found,
                    };
                    self.watermarks
                        .set(entity, date, Some(self.calendar.day_end_instant(date)), true, now)
                        .await?;
                }
                None => {
                    let latest = self.store.latest_instant(entity).await?;
                    let best = latest.map(|t| self.calendar.date_of(t).min(horizon)).unwrap_or(self.earliest);
                    warn!(entity = %entity, %best, "[Reconcile] no complete date in look-back window");
                    self.watermarks.set(entity, best, latest, false, now).await?;
                }
            }
        }
        Ok(())
    }
}
