use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::db::Store;
use crate::error::AppError;
use crate::scheduler::Scheduler;
use crate::sync::backfill::Backfill;
use crate::sync::engine::ReconcileEngine;
use crate::types::{
    from_unix, ChunkProgress, DateCompleteness, Entity, ScheduleStatus, SyncRun, SyncRunKind, SyncRunStatus,
    SyncWatermark,
};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub scheduler: Arc<Scheduler>,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub backfill: Arc<Backfill>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/sync/status", get(get_sync_status))
        .route("/sync/trigger", post(post_sync_trigger))
        .route("/sync/completeness/:date", get(get_completeness))
        .route("/sync/watermarks", get(get_watermarks))
        .route("/sync/runs", get(get_runs))
        .route("/sync/initial", get(get_initial_sync))
        .route("/sync/reset-initial", post(post_reset_initial))
        .route("/sync/historical", post(post_sync_historical))
        .route("/sync/year", post(post_sync_year))
        .route("/sync/years", post(post_sync_years))
        .route("/sync/recent-completeness", get(get_recent_completeness))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request structs
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    pub entities: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct HistoricalRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub entities: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct YearRequest {
    pub year: i32,
    pub entities: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct YearsRequest {
    pub start_year: i32,
    pub end_year: i32,
    pub entities: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<i64>,
    pub kind: Option<String>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct LatencyResponse {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub schedule_state: String,
    pub reconcile_in_flight: bool,
    pub last_reconcile_at: Option<DateTime<Utc>>,
    pub last_reconcile_ok: bool,
    pub last_ingested: u64,
    pub reconcile_runs: u64,
    pub reconcile_errors: u64,
    pub wake_events: u64,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub price_count: i64,
    pub upstream_latency: LatencyResponse,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub schedule: ScheduleStatus,
    pub reconcile_in_flight: bool,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub status: SyncRunStatus,
    pub ingested: u64,
    pub created: u64,
    pub updated: u64,
    pub entities: Vec<Entity>,
    pub today_complete: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoricalResponse {
    pub chunks: usize,
    pub through: NaiveDate,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub cleared: u64,
}

#[derive(Debug, Serialize)]
pub struct RecentCompletenessResponse {
    pub today: DateCompleteness,
    pub yesterday: DateCompleteness,
    pub needs_sync: bool,
}

#[derive(Debug, Serialize)]
pub struct InitialSyncResponse {
    pub completed_through: Option<NaiveDate>,
    pub chunk_progress: Option<ChunkProgress>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Result<Json<HealthResponse>, AppError> {
    let health = &state.health;
    let last_reconcile_at = from_unix(health.last_reconcile_at() as i64).filter(|_| health.last_reconcile_at() > 0);
    let last_health_check_at =
        from_unix(health.last_health_check_at() as i64).filter(|_| health.last_health_check_at() > 0);
    let (p50_ms, p95_ms, p99_ms) = state.latency.percentiles();
    let status = if last_reconcile_at.is_some() && !health.last_reconcile_ok() {
        "degraded"
    } else {
        "ok"
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        schedule_state: state.scheduler.status().state.to_string(),
        reconcile_in_flight: state.scheduler.engine().is_busy(),
        last_reconcile_at,
        last_reconcile_ok: health.last_reconcile_ok(),
        last_ingested: health.last_ingested(),
        reconcile_runs: health.reconcile_runs(),
        reconcile_errors: health.reconcile_errors(),
        wake_events: health.wake_events(),
        last_health_check_at,
        price_count: state.store.price_count().await?,
        upstream_latency: LatencyResponse { samples: state.latency.len(), p50_ms, p95_ms, p99_ms },
    }))
}

async fn get_sync_status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, AppError> {
    let last_success_at = state.store.last_success_at(&SyncRunKind::RECONCILE).await?;
    Ok(Json(StatusResponse {
        schedule: state.scheduler.status(),
        reconcile_in_flight: state.scheduler.engine().is_busy(),
        last_success_at,
    }))
}

async fn post_sync_trigger(
    State(state): State<ApiState>,
    body: Option<Json<TriggerRequest>>,
) -> Result<Json<TriggerResponse>, AppError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let engine = state.scheduler.engine();
    let requested = tracked_entities(engine, request.entities)?;

    info!(entities = ?requested, "[Reconcile] manual trigger");
    let outcome = engine.trigger(SyncRunKind::Manual, Some(requested.as_slice())).await;
    Ok(Json(TriggerResponse {
        status: outcome.status,
        ingested: outcome.ingested(),
        created: outcome.records.created,
        updated: outcome.records.updated,
        entities: outcome.synced,
        today_complete: outcome.today_complete,
        error: outcome.error,
    }))
}

async fn get_completeness(
    State(state): State<ApiState>,
    Path(date): Path<String>,
) -> Result<Json<DateCompleteness>, AppError> {
    let date = date
        .parse::<NaiveDate>()
        .map_err(|_| AppError::BadRequest(format!("'{date}' is not a YYYY-MM-DD date")))?;
    let completeness = state.scheduler.engine().oracle().is_date_complete(date).await?;
    Ok(Json(completeness))
}

async fn get_watermarks(State(state): State<ApiState>) -> Result<Json<Vec<SyncWatermark>>, AppError> {
    Ok(Json(state.store.all_watermarks().await?))
}

async fn get_runs(
    State(state): State<ApiState>,
    Query(params): Query<RunsQuery>,
) -> Result<Json<Vec<SyncRun>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let kind = match params.kind.as_deref() {
        None | Some("") => None,
        Some(k) => Some(
            SyncRunKind::parse(k).ok_or_else(|| AppError::BadRequest(format!("unknown run kind '{k}'")))?,
        ),
    };
    Ok(Json(state.store.recent_runs(limit, kind).await?))
}

async fn get_initial_sync(State(state): State<ApiState>) -> Result<Json<InitialSyncResponse>, AppError> {
    Ok(Json(InitialSyncResponse {
        completed_through: state.store.initial_sync_completed().await?,
        chunk_progress: state.store.chunk_progress().await?,
    }))
}

async fn post_reset_initial(State(state): State<ApiState>) -> Result<Json<ResetResponse>, AppError> {
    let cleared = state.store.reset_initial_sync().await?;
    info!(cleared, "[Backfill] initial sync state reset");
    Ok(Json(ResetResponse { cleared }))
}

async fn post_sync_historical(
    State(state): State<ApiState>,
    Json(request): Json<HistoricalRequest>,
) -> Result<Json<HistoricalResponse>, AppError> {
    resync(&state, request.start, request.end, request.entities).await
}

async fn post_sync_year(
    State(state): State<ApiState>,
    Json(request): Json<YearRequest>,
) -> Result<Json<HistoricalResponse>, AppError> {
    let (start, end) = (year_start(request.year)?, year_end(request.year)?);
    resync(&state, start, end, request.entities).await
}

async fn post_sync_years(
    State(state): State<ApiState>,
    Json(request): Json<YearsRequest>,
) -> Result<Json<HistoricalResponse>, AppError> {
    if request.start_year > request.end_year {
        return Err(AppError::BadRequest(format!(
            "start_year {} is after end_year {}",
            request.start_year, request.end_year
        )));
    }
    let (start, end) = (year_start(request.start_year)?, year_end(request.end_year)?);
    resync(&state, start, end, request.entities).await
}

async fn get_recent_completeness(
    State(state): State<ApiState>,
) -> Result<Json<RecentCompletenessResponse>, AppError> {
    let engine = state.scheduler.engine();
    let today = engine.calendar().today(engine.clock().now());
    let oracle = engine.oracle();
    let yesterday = oracle.is_date_complete(today - TimeDelta::days(1)).await?;
    let today = oracle.is_date_complete(today).await?;
    Ok(Json(RecentCompletenessResponse { needs_sync: !yesterday.is_complete, today, yesterday }))
}

async fn resync(
    state: &ApiState,
    start: NaiveDate,
    end: NaiveDate,
    entities: Option<Vec<String>>,
) -> Result<Json<HistoricalResponse>, AppError> {
    let requested = tracked_entities(state.backfill.engine(), entities)?;
    info!(entities = ?requested, "[Backfill] historical resync {start}..{end} requested");
    let summary = state.backfill.run_range(start, end, &requested).await?;
    Ok(Json(HistoricalResponse {
        chunks: summary.chunks,
        through: summary.through,
        processed: summary.records.processed,
        created: summary.records.created,
        updated: summary.records.updated,
    }))
}

/// Requested entity names, all of which must be tracked. Empty means all.
fn tracked_entities(engine: &ReconcileEngine, names: Option<Vec<String>>) -> Result<Vec<Entity>, AppError> {
    let requested: Vec<Entity> = names.unwrap_or_default().iter().map(|e| Entity::new(e)).collect();
    if let Some(unknown) = requested.iter().find(|e| !engine.entities().contains(e)) {
        return Err(AppError::BadRequest(format!("entity '{unknown}' is not tracked")));
    }
    Ok(requested)
}

fn year_start(year: i32) -> Result<NaiveDate, AppError> {
    NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(|| AppError::BadRequest(format!("bad year {year}")))
}

fn year_end(year: i32) -> Result<NaiveDate, AppError> {
    NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(|| AppError::BadRequest(format!("bad year {year}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sync::engine::tests::{date, harness, publish, Harness};
    use crate::sync::oracle::tests::day_records;

    fn api_state(h: &Harness) -> ApiState {
        let health = Arc::new(HealthState::new());
        let cfg = Config { earliest_date: date("2025-06-05"), backfill_chunk_delay_ms: 0, ..Config::default() };
        ApiState {
            store: h.store.clone(),
            scheduler: Arc::new(Scheduler::new(&cfg, h.engine.clone(), health.clone())),
            health,
            latency: Arc::new(LatencyStats::new()),
            backfill: Arc::new(Backfill::new(&cfg, h.engine.clone())),
        }
    }

    #[tokio::test]
    async fn trigger_without_body_syncs_everything() {
        let h = harness("lt,ee", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        publish(&h.upstream, "ee", "2025-06-05", "2025-06-11");

        let Json(resp) = post_sync_trigger(State(api_state(&h)), None).await.unwrap();
        assert_eq!(resp.status, SyncRunStatus::Success);
        assert_eq!(resp.created, 2 * 7 * 96);
        assert_eq!(resp.entities.len(), 2);

        let runs = h.store.recent_runs(10, Some(SyncRunKind::Manual)).await.unwrap();
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn trigger_rejects_untracked_entity() {
        let h = harness("lt", "2025-06-05").await;
        let body = TriggerRequest { entities: Some(vec!["xx".to_string()]) };
        let err = post_sync_trigger(State(api_state(&h)), Some(Json(body))).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(h.upstream.range_calls(), 0);
    }

    #[tokio::test]
    async fn completeness_endpoint_validates_date() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let state = api_state(&h);
        h.engine.trigger(SyncRunKind::Manual, None).await;

        let Json(c) = get_completeness(State(state.clone()), Path("2025-06-10".to_string())).await.unwrap();
        assert_eq!(c.date, date("2025-06-10"));
        assert!(c.is_complete);

        let err = get_completeness(State(state), Path("10/06/2025".to_string())).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn runs_endpoint_filters_by_kind() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let state = api_state(&h);
        h.engine.trigger(SyncRunKind::Manual, None).await;
        h.engine.trigger(SyncRunKind::Weekly, None).await;

        let query = RunsQuery { limit: None, kind: Some("weekly".to_string()) };
        let Json(runs) = get_runs(State(state.clone()), Query(query)).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].kind, SyncRunKind::Weekly);

        let query = RunsQuery { limit: Some(1), kind: None };
        let Json(runs) = get_runs(State(state.clone()), Query(query)).await.unwrap();
        assert_eq!(runs.len(), 1);

        let query = RunsQuery { limit: None, kind: Some("hourly".to_string()) };
        assert!(get_runs(State(state), Query(query)).await.is_err());
    }

    #[tokio::test]
    async fn health_reports_last_reconcile() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let state = api_state(&h);

        let Json(before) = get_health(State(state.clone())).await.unwrap();
        assert_eq!(before.status, "ok");
        assert_eq!(before.last_reconcile_at, None);
        assert_eq!(before.schedule_state, "idle");

        let Json(status) = get_sync_status(State(state)).await.unwrap();
        assert_eq!(status.last_success_at, None);
        assert!(!status.reconcile_in_flight);
    }

    #[tokio::test]
    async fn historical_resync_covers_requested_entities_only() {
        let h = harness("lt,ee", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        publish(&h.upstream, "ee", "2025-06-05", "2025-06-11");
        let state = api_state(&h);

        let body = HistoricalRequest {
            start: date("2025-06-06"),
            end: date("2025-06-07"),
            entities: Some(vec!["ee".to_string()]),
        };
        let Json(resp) = post_sync_historical(State(state.clone()), Json(body)).await.unwrap();
        assert_eq!(resp.chunks, 1);
        assert_eq!(resp.created, 2 * 96);
        assert_eq!(resp.through, date("2025-06-07"));
        assert_eq!(h.store.price_count().await.unwrap(), 2 * 96);
        assert_eq!(h.upstream.requested_ranges(), vec![(date("2025-06-06"), date("2025-06-07"))]);

        let body = HistoricalRequest {
            start: date("2025-06-06"),
            end: date("2025-06-07"),
            entities: Some(vec!["xx".to_string()]),
        };
        let err = post_sync_historical(State(state), Json(body)).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(h.upstream.range_calls(), 1);
    }

    #[tokio::test]
    async fn year_routes_clamp_to_provider_coverage() {
        let h = harness("lt", "2025-06-05").await;
        publish(&h.upstream, "lt", "2025-06-05", "2025-06-11");
        let state = api_state(&h);

        let Json(resp) = post_sync_year(State(state.clone()), Json(YearRequest { year: 2025, entities: None }))
            .await
            .unwrap();
        assert_eq!(resp.chunks, 1);
        assert_eq!(resp.created, 7 * 96);
        assert_eq!(h.upstream.requested_ranges()[0].0, date("2025-06-05"));

        let body = YearsRequest { start_year: 2026, end_year: 2025, entities: None };
        let err = post_sync_years(State(state.clone()), Json(body)).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));

        let body = YearsRequest { start_year: 2020, end_year: 2024, entities: None };
        let err = post_sync_years(State(state), Json(body)).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(h.upstream.range_calls(), 1);
    }

    #[tokio::test]
    async fn reset_initial_clears_flag_and_progress() {
        let h = harness("lt", "2025-06-05").await;
        let state = api_state(&h);
        h.store.mark_initial_sync_completed(date("2025-06-11")).await.unwrap();

        let Json(resp) = post_reset_initial(State(state.clone())).await.unwrap();
        assert_eq!(resp.cleared, 1);
        let Json(initial) = get_initial_sync(State(state)).await.unwrap();
        assert_eq!(initial.completed_through, None);
        assert_eq!(initial.chunk_progress, None);
    }

    #[tokio::test]
    async fn recent_completeness_flags_missing_yesterday() {
        let h = harness("lt", "2025-06-05").await;
        let lt = Entity::new("lt");
        h.store.upsert_prices(&day_records(&lt, date("2025-06-10"), 96, 900)).await.unwrap();
        let state = api_state(&h);

        let Json(resp) = get_recent_completeness(State(state)).await.unwrap();
        assert_eq!(resp.today.date, date("2025-06-10"));
        assert!(resp.today.is_complete);
        assert_eq!(resp.yesterday.date, date("2025-06-09"));
        assert!(!resp.yesterday.is_complete);
        assert!(resp.needs_sync);
    }
}
