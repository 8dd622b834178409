//! Bulk historical backfill in half-year chunks.
//!
//! Each chunk's prices and its progress marker commit in one transaction, so an
//! interrupted run resumes at the chunk after the last committed one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate, TimeDelta};
use serde_json::json;
use tracing::{error, info};

use crate::config::{Config, HORIZON_DAYS};
use crate::error::{AppError, Result};
use crate::sync::engine::ReconcileEngine;
use crate::types::{ChunkProgress, Entity, IngestStats, SyncRun, SyncRunKind, SyncRunStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct BackfillSummary {
    pub chunks: usize,
    pub records: IngestStats,
    /// Newest date actually ingested.
    pub through: NaiveDate,
}

/// Split `[start, end]` on half-year boundaries (Jan 1 - Jun 30, Jul 1 - Dec 31).
pub fn split_half_year_chunks(start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let half_end = if cursor.month() <= 6 {
            NaiveDate::from_ymd_opt(cursor.year(), 6, 30)
        } else {
            NaiveDate::from_ymd_opt(cursor.year(), 12, 31)
        };
        let Some(half_end) = half_end else { break };
        let chunk_end = half_end.min(end);
        out.push((cursor, chunk_end));
        cursor = chunk_end + TimeDelta::days(1);
    }
    out
}

pub struct Backfill {
    engine: Arc<ReconcileEngine>,
    earliest: NaiveDate,
    delay: Duration,
}

/// What a chunk loop does besides upserting prices.
#[derive(Clone, Copy)]
enum ChunkMode {
    /// Commit chunk progress with each chunk.
    Initial,
    /// Leave chunk progress and the initial-sync flag alone.
    Resync,
}

impl Backfill {
    pub fn new(cfg: &Config, engine: Arc<ReconcileEngine>) -> Self {
        Self {
            engine,
            earliest: cfg.earliest_date,
            delay: Duration::from_millis(cfg.backfill_chunk_delay_ms),
        }
    }

    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }

    /// Fetch everything from the provider's earliest date (or the last committed
    /// chunk) through today + horizon, then mark the initial sync complete.
    pub async fn run(&self) -> Result<BackfillSummary> {
        let Some(_guard) = self.engine.try_acquire() else {
            return Err(AppError::Busy("a reconciliation is in flight".to_string()));
        };

        let store = self.engine.store();
        let entities = self.engine.entities();
        let calendar = self.engine.calendar();
        let clock = self.engine.clock();

        let end = calendar.today(clock.now()) + TimeDelta::days(HORIZON_DAYS);
        let start = match store.chunk_progress().await? {
            Some(p) => {
                let resume = p.last_completed_chunk_end + TimeDelta::days(1);
                info!(resume = %resume, "[Backfill] resuming after last committed chunk");
                resume
            }
            None => self.earliest,
        };
        let chunks = split_half_year_chunks(start, end);
        info!(chunks = chunks.len(), "[Backfill] syncing {start}..{end}");

        let run_started_at = clock.now();
        let run_started = Instant::now();
        let total = self
            .sync_chunks(&chunks, entities, SyncRunKind::Backfill, ChunkMode::Initial)
            .await?;

        let Some(max) = store.max_instant(entities).await? else {
            return Err(AppError::Backfill("upstream returned no data".to_string()));
        };
        let through = calendar.date_of(max);
        store.mark_initial_sync_completed(through).await?;

        let summary = SyncRun::started(SyncRunKind::Backfill, run_started_at)
            .finish(SyncRunStatus::Success, clock.now(), run_started.elapsed().as_millis() as i64)
            .with_records(total)
            .with_details(json!({ "chunks": chunks.len(), "through": through.to_string() }));
        store.record_run(&summary).await?;

        info!(through = %through, created = total.created, "[Backfill] initial sync complete");
        Ok(BackfillSummary { chunks: chunks.len(), records: total, through })
    }

    /// Re-fetch `[start, end]` for `entities` (all tracked when empty) in
    /// half-year chunks. The range is clamped to the provider's earliest date and
    /// today + horizon; what is left must be non-empty.
    pub async fn run_range(&self, start: NaiveDate, end: NaiveDate, entities: &[Entity]) -> Result<BackfillSummary> {
        let tracked = self.engine.entities();
        if let Some(unknown) = entities.iter().find(|e| !tracked.contains(e)) {
            return Err(AppError::BadRequest(format!("entity '{unknown}' is not tracked")));
        }
        let entities = if entities.is_empty() { tracked } else { entities };

        let clock = self.engine.clock();
        let horizon = self.engine.calendar().today(clock.now()) + TimeDelta::days(HORIZON_DAYS);
        let (from, to) = (start.max(self.earliest), end.min(horizon));
        if from > to {
            return Err(AppError::BadRequest(format!(
                "range {start}..{end} is outside {}..{horizon}",
                self.earliest
            )));
        }

        let Some(_guard) = self.engine.try_acquire() else {
            return Err(AppError::Busy("a reconciliation is in flight".to_string()));
        };

        let chunks = split_half_year_chunks(from, to);
        info!(chunks = chunks.len(), entities = ?entities, "[Backfill] resyncing {from}..{to}");

        let run_started_at = clock.now();
        let run_started = Instant::now();
        let total = self
            .sync_chunks(&chunks, entities, SyncRunKind::Historical, ChunkMode::Resync)
            .await?;

        let summary = SyncRun::started(SyncRunKind::Historical, run_started_at)
            .finish(SyncRunStatus::Success, clock.now(), run_started.elapsed().as_millis() as i64)
            .with_records(total)
            .with_details(json!({
                "start": from.to_string(),
                "end": to.to_string(),
                "chunks": chunks.len(),
                "entities": entities,
            }));
        self.engine.store().record_run(&summary).await?;

        info!(created = total.created, updated = total.updated, "[Backfill] resync {from}..{to} complete");
        Ok(BackfillSummary { chunks: chunks.len(), records: total, through: to })
    }

    /// Fetch and commit each chunk in order, logging a `backfill_chunk` run per
    /// chunk. The first failure also logs a failed `summary` run and stops.
    async fn sync_chunks(
        &self,
        chunks: &[(NaiveDate, NaiveDate)],
        entities: &[Entity],
        summary: SyncRunKind,
        mode: ChunkMode,
    ) -> Result<IngestStats> {
        let store = self.engine.store();
        let clock = self.engine.clock();
        let run_started_at = clock.now();
        let run_started = Instant::now();
        let mut total = IngestStats::default();

        for (i, (chunk_start, chunk_end)) in chunks.iter().copied().enumerate() {
            if i > 0 && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            let started_at = clock.now();
            let started = Instant::now();
            let result = async {
                let batch = self.engine.source().fetch_range(chunk_start, chunk_end, entities).await?;
                match mode {
                    ChunkMode::Initial => {
                        let progress = ChunkProgress {
                            last_completed_chunk_end: chunk_end,
                            records_in_chunk: batch.values().map(Vec::len).sum::<usize>() as u64,
                        };
                        self.engine.ingestor().ingest_chunk(batch, entities, &progress).await
                    }
                    ChunkMode::Resync => self.engine.ingestor().ingest(batch, entities).await,
                }
            }
            .await;

            let details = json!({ "start": chunk_start.to_string(), "end": chunk_end.to_string() });
            match result {
                Ok(stats) => {
                    info!(
                        chunk = i + 1,
                        of = chunks.len(),
                        created = stats.created,
                        "[Backfill] chunk {chunk_start}..{chunk_end} committed"
                    );
                    total.merge(stats);
                    let run = SyncRun::started(SyncRunKind::BackfillChunk, started_at)
                        .finish(SyncRunStatus::Success, clock.now(), started.elapsed().as_millis() as i64)
                        .with_records(stats)
                        .with_details(details);
                    store.record_run(&run).await?;
                }
                Err(e) => {
                    error!("[Backfill] chunk {chunk_start}..{chunk_end} failed: {e}");
                    let chunk_run = SyncRun::started(SyncRunKind::BackfillChunk, started_at)
                        .finish(SyncRunStatus::Error, clock.now(), started.elapsed().as_millis() as i64)
                        .with_error(e.to_string())
                        .with_details(details);
                    let summary_run = SyncRun::started(summary, run_started_at)
                        .finish(SyncRunStatus::Error, clock.now(), run_started.elapsed().as_millis() as i64)
                        .with_records(total)
                        .with_error(e.to_string());
                    for run in [chunk_run, summary_run] {
                        if let Err(log_err) = store.record_run(&run).await {
                            error!("[Backfill] failed to record run: {log_err}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::engine::tests::{date, harness};
    use crate::sync::oracle::tests::day_records;

    #[test]
    fn chunks_follow_half_years() {
        let chunks = split_half_year_chunks(date("2012-07-01"), date("2013-08-15"));
        assert_eq!(
            chunks,
            vec![
                (date("2012-07-01"), date("2012-12-31")),
                (date("2013-01-01"), date("2013-06-30")),
                (date("2013-07-01"), date("2013-08-15")),
            ]
        );
    }

    #[test]
    fn chunk_from_mid_half_ends_at_boundary() {
        let chunks = split_half_year_chunks(date("2024-05-01"), date("2024-05-03"));
        assert_eq!(chunks, vec![(date("2024-05-01"), date("2024-05-03"))]);
        assert!(split_half_year_chunks(date("2024-05-03"), date("2024-05-01")).is_empty());
    }

    #[tokio::test]
    async fn interrupted_backfill_resumes_at_next_chunk() {
        let h = harness("lt", "2024-05-01").await;
        h.clock.set("2025-02-10T12:00:00Z".parse().unwrap());
        let lt = Entity::new("lt");
        for d in crate::calendar::dates_inclusive(date("2024-05-01"), date("2025-02-11")) {
            h.upstream.add(day_records(&lt, d, 24, 3_600));
        }
        let backfill = Backfill::new(
            &Config { earliest_date: date("2024-05-01"), backfill_chunk_delay_ms: 0, ..Config::default() },
            h.engine.clone(),
        );

        h.upstream.fail_on_call(2);
        assert!(backfill.run().await.is_err());
        let progress = h.store.chunk_progress().await.unwrap().unwrap();
        assert_eq!(progress.last_completed_chunk_end, date("2024-06-30"));
        assert_eq!(h.store.initial_sync_completed().await.unwrap(), None);
        assert!(!h.engine.is_busy());

        let summary = backfill.run().await.unwrap();
        assert_eq!(summary.chunks, 2);
        // Nominal end is 2025-02-12; the last published day wins.
        assert_eq!(summary.through, date("2025-02-11"));
        assert_eq!(h.store.initial_sync_completed().await.unwrap(), Some(date("2025-02-11")));

        let requested = h.upstream.requested_ranges();
        let first_chunk = (date("2024-05-01"), date("2024-06-30"));
        assert_eq!(requested.iter().filter(|r| **r == first_chunk).count(), 1);
        assert_eq!(requested.last(), Some(&(date("2025-01-01"), date("2025-02-12"))));

        let days = (date("2025-02-11") - date("2024-05-01")).num_days() + 1;
        assert_eq!(h.store.price_count().await.unwrap(), days * 24);
    }

    fn resync_backfill(h: &crate::sync::engine::tests::Harness, earliest: &str) -> Backfill {
        Backfill::new(
            &Config { earliest_date: date(earliest), backfill_chunk_delay_ms: 0, ..Config::default() },
            h.engine.clone(),
        )
    }

    #[tokio::test]
    async fn range_resync_leaves_initial_sync_state_alone() {
        let h = harness("lt,ee", "2024-05-01").await;
        h.clock.set("2025-02-10T12:00:00Z".parse().unwrap());
        let lt = Entity::new("lt");
        for d in crate::calendar::dates_inclusive(date("2024-06-20"), date("2024-07-10")) {
            h.upstream.add(day_records(&lt, d, 24, 3_600));
            h.upstream.add(day_records(&Entity::new("ee"), d, 24, 3_600));
        }
        let backfill = resync_backfill(&h, "2024-05-01");

        let summary = backfill
            .run_range(date("2024-06-20"), date("2024-07-10"), std::slice::from_ref(&lt))
            .await
            .unwrap();
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.records.created, 21 * 24);
        assert_eq!(summary.through, date("2024-07-10"));
        assert_eq!(
            h.upstream.requested_ranges(),
            vec![(date("2024-06-20"), date("2024-06-30")), (date("2024-07-01"), date("2024-07-10"))]
        );
        // Only the requested entity is written.
        assert_eq!(h.store.price_count().await.unwrap(), 21 * 24);

        assert_eq!(h.store.chunk_progress().await.unwrap(), None);
        assert_eq!(h.store.initial_sync_completed().await.unwrap(), None);
        let chunk_runs = h.store.recent_runs(10, Some(SyncRunKind::BackfillChunk)).await.unwrap();
        assert_eq!(chunk_runs.len(), 2);
        let summaries = h.store.recent_runs(10, Some(SyncRunKind::Historical)).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, SyncRunStatus::Success);
    }

    #[tokio::test]
    async fn range_resync_clamps_and_validates() {
        let h = harness("lt", "2024-05-01").await;
        h.clock.set("2025-02-10T12:00:00Z".parse().unwrap());
        let backfill = resync_backfill(&h, "2024-05-01");

        // Whole year 2024 starts at the provider's earliest date.
        backfill.run_range(date("2024-01-01"), date("2024-12-31"), &[]).await.unwrap();
        assert_eq!(
            h.upstream.requested_ranges(),
            vec![(date("2024-05-01"), date("2024-06-30")), (date("2024-07-01"), date("2024-12-31"))]
        );

        let before = h.upstream.range_calls();
        for (start, end) in [("2024-03-01", "2024-02-01"), ("2023-01-01", "2023-12-31"), ("2026-01-01", "2026-12-31")] {
            let err = backfill.run_range(date(start), date(end), &[]).await.unwrap_err();
            assert!(matches!(err, AppError::BadRequest(_)), "{start}..{end}: {err}");
        }
        let err = backfill
            .run_range(date("2024-06-01"), date("2024-06-02"), &[Entity::new("xx")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(h.upstream.range_calls(), before);
    }

    #[tokio::test]
    async fn range_resync_refuses_while_busy_and_logs_failures() {
        let h = harness("lt", "2024-05-01").await;
        h.clock.set("2025-02-10T12:00:00Z".parse().unwrap());
        let backfill = resync_backfill(&h, "2024-05-01");

        {
            let _held = h.engine.try_acquire().unwrap();
            let err = backfill.run_range(date("2024-06-01"), date("2024-06-02"), &[]).await.unwrap_err();
            assert!(matches!(err, AppError::Busy(_)));
            assert_eq!(h.upstream.range_calls(), 0);
        }

        h.upstream.fail_next(1);
        assert!(backfill.run_range(date("2024-06-01"), date("2024-06-02"), &[]).await.is_err());
        assert!(!h.engine.is_busy());
        let summaries = h.store.recent_runs(10, Some(SyncRunKind::Historical)).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, SyncRunStatus::Error);
    }
}
