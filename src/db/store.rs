use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use crate::db::models::{SyncRunRow, WatermarkRow};
use crate::error::{AppError, Result};
use crate::types::{
    from_unix, ChunkProgress, Entity, IngestStats, PriceRecord, SyncRun, SyncRunKind, SyncRunStatus,
    SyncWatermark,
};

const KEY_CHUNK_PROGRESS: &str = "initial_sync_last_chunk";
const KEY_INITIAL_SYNC: &str = "initial_sync_completed";

/// Read/write contract over SQLite. Cheap to clone; every clone shares the pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // -----------------------------------------------------------------------
    // Prices
    // -----------------------------------------------------------------------

    /// Upsert a batch in one transaction. Any failure rolls back the whole batch.
    pub async fn upsert_prices(&self, records: &[PriceRecord]) -> Result<IngestStats> {
        let mut tx = self.pool.begin().await?;
        let stats = upsert_rows(&mut tx, records).await?;
        tx.commit().await?;
        Ok(stats)
    }

    /// Upsert a backfill chunk and advance chunk progress in the same transaction.
    pub async fn upsert_chunk(&self, records: &[PriceRecord], progress: &ChunkProgress) -> Result<IngestStats> {
        let mut tx = self.pool.begin().await?;
        let stats = upsert_rows(&mut tx, records).await?;
        put_setting(&mut tx, KEY_CHUNK_PROGRESS, &serde_json::to_string(progress)?).await?;
        tx.commit().await?;
        Ok(stats)
    }

    pub async fn latest_instant(&self, entity: &Entity) -> Result<Option<DateTime<Utc>>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(slot_start) FROM prices WHERE entity = ?")
            .bind(entity.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(max.and_then(from_unix))
    }

    /// Latest instant across several entities.
    pub async fn max_instant(&self, entities: &[Entity]) -> Result<Option<DateTime<Utc>>> {
        let mut best = None;
        for e in entities {
            if let Some(t) = self.latest_instant(e).await? {
                best = best.max(Some(t));
            }
        }
        Ok(best)
    }

    /// Records with `start <= slot_start < end`.
    pub async fn count_in_range(&self, entity: &Entity, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM prices WHERE entity = ? AND slot_start >= ? AND slot_start < ?",
        )
        .bind(entity.as_str())
        .bind(start.timestamp())
        .bind(end.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// First `limit` stored instants in `[start, end)`, ascending.
    pub async fn sample_instants(
        &self,
        entity: &Entity,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT slot_start FROM prices
            WHERE entity = ? AND slot_start >= ? AND slot_start < ?
            ORDER BY slot_start ASC
            LIMIT ?
            "#,
        )
        .bind(entity.as_str())
        .bind(start.timestamp())
        .bind(end.timestamp())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().filter_map(from_unix).collect())
    }

    pub async fn price_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prices")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    #[cfg(test)]
    pub async fn delete_prices_in_range(&self, entity: &Entity, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM prices WHERE entity = ? AND slot_start >= ? AND slot_start < ?")
            .bind(entity.as_str())
            .bind(start.timestamp())
            .bind(end.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    // -----------------------------------------------------------------------
    // Watermarks
    // -----------------------------------------------------------------------

    pub async fn get_watermark(&self, entity: &Entity) -> Result<Option<SyncWatermark>> {
        let row: Option<WatermarkRow> = sqlx::query_as(
            r#"
            SELECT entity, last_complete_date, last_complete_instant, trustworthy, updated_at
            FROM sync_watermarks WHERE entity = ?
            "#,
        )
        .bind(entity.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(SyncWatermark::try_from).transpose()
    }

    pub async fn all_watermarks(&self) -> Result<Vec<SyncWatermark>> {
        let rows: Vec<WatermarkRow> = sqlx::query_as(
            r#"
            SELECT entity, last_complete_date, last_complete_instant, trustworthy, updated_at
            FROM sync_watermarks ORDER BY entity
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SyncWatermark::try_from).collect()
    }

    pub async fn set_watermark(&self, wm: &SyncWatermark) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_watermarks (entity, last_complete_date, last_complete_instant, trustworthy, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(entity) DO UPDATE SET
                last_complete_date    = excluded.last_complete_date,
                last_complete_instant = excluded.last_complete_instant,
                trustworthy           = excluded.trustworthy,
                updated_at            = excluded.updated_at
            "#,
        )
        .bind(wm.entity.as_str())
        .bind(wm.last_complete_date.to_string())
        .bind(wm.last_complete_instant.map(|t| t.timestamp()))
        .bind(i64::from(wm.trustworthy))
        .bind(wm.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns false when a watermark already existed.
    pub async fn insert_watermark_if_absent(&self, wm: &SyncWatermark) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT OR IGNORE INTO sync_watermarks
                (entity, last_complete_date, last_complete_instant, trustworthy, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(wm.entity.as_str())
        .bind(wm.last_complete_date.to_string())
        .bind(wm.last_complete_instant.map(|t| t.timestamp()))
        .bind(i64::from(wm.trustworthy))
        .bind(wm.updated_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    // -----------------------------------------------------------------------
    // Run log
    // -----------------------------------------------------------------------

    pub async fn record_run(&self, run: &SyncRun) -> Result<i64> {
        let details = run.details.as_ref().map(serde_json::to_string).transpose()?;
        let res = sqlx::query(
            r#"
            INSERT INTO sync_runs (
                kind, status, records_processed, records_created, records_updated,
                error_message, details, started_at, completed_at, duration_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.kind.as_str())
        .bind(run.status.as_str())
        .bind(run.records.processed as i64)
        .bind(run.records.created as i64)
        .bind(run.records.updated as i64)
        .bind(run.error_message.as_deref())
        .bind(details)
        .bind(run.started_at.timestamp())
        .bind(run.completed_at.map(|t| t.timestamp()))
        .bind(run.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn recent_runs(&self, limit: i64, kind: Option<SyncRunKind>) -> Result<Vec<SyncRun>> {
        let rows: Vec<SyncRunRow> = match kind {
            Some(k) => {
                sqlx::query_as(
                    r#"
                    SELECT id, kind, status, records_processed, records_created, records_updated,
                           error_message, details, started_at, completed_at, duration_ms
                    FROM sync_runs WHERE kind = ?
                    ORDER BY id DESC LIMIT ?
                    "#,
                )
                .bind(k.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, kind, status, records_processed, records_created, records_updated,
                           error_message, details, started_at, completed_at, duration_ms
                    FROM sync_runs
                    ORDER BY id DESC LIMIT ?
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(SyncRun::try_from).collect()
    }

    /// Completion time of the latest successful run among `kinds`.
    pub async fn last_success_at(&self, kinds: &[SyncRunKind]) -> Result<Option<DateTime<Utc>>> {
        let mut best: Option<i64> = None;
        for kind in kinds {
            let at: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(completed_at) FROM sync_runs WHERE kind = ? AND status = ?",
            )
            .bind(kind.as_str())
            .bind(SyncRunStatus::Success.as_str())
            .fetch_one(&self.pool)
            .await?;
            best = best.max(at);
        }
        Ok(best.and_then(from_unix))
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        put_setting(&mut conn, key, value).await
    }

    pub async fn chunk_progress(&self) -> Result<Option<ChunkProgress>> {
        match self.get_setting(KEY_CHUNK_PROGRESS).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Date recorded when the bulk backfill finished, if it has.
    pub async fn initial_sync_completed(&self) -> Result<Option<NaiveDate>> {
        match self.get_setting(KEY_INITIAL_SYNC).await? {
            Some(raw) => raw
                .parse::<NaiveDate>()
                .map(Some)
                .map_err(|_| AppError::InvalidData(format!("{KEY_INITIAL_SYNC} has bad date '{raw}'"))),
            None => Ok(None),
        }
    }

    pub async fn mark_initial_sync_completed(&self, through: NaiveDate) -> Result<()> {
        self.set_setting(KEY_INITIAL_SYNC, &through.to_string()).await
    }

    /// Forget the initial-sync flag and chunk progress so the next startup backfills
    /// from the earliest date again. Prices are kept.
    pub async fn reset_initial_sync(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM settings WHERE key IN (?, ?)")
            .bind(KEY_INITIAL_SYNC)
            .bind(KEY_CHUNK_PROGRESS)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Rows per INSERT statement. Four binds per row keeps well under SQLite's bind limit.
const UPSERT_BATCH: usize = 500;

/// Batched upsert. Unchanged prices are not rewritten; created rows are the
/// growth of the touched key ranges, updated rows the rest of the affected ones.
async fn upsert_rows(conn: &mut SqliteConnection, records: &[PriceRecord]) -> Result<IngestStats> {
    if records.is_empty() {
        return Ok(IngestStats::default());
    }
    let now = Utc::now().timestamp();

    let mut spans: BTreeMap<&str, (i64, i64)> = BTreeMap::new();
    for r in records {
        let slot = r.slot_start.timestamp();
        spans
            .entry(r.entity.as_str())
            .and_modify(|(lo, hi)| {
                *lo = (*lo).min(slot);
                *hi = (*hi).max(slot);
            })
            .or_insert((slot, slot));
    }

    let before = count_spans(conn, &spans).await?;
    let mut affected = 0u64;
    for batch in records.chunks(UPSERT_BATCH) {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("INSERT INTO prices (entity, slot_start, price, updated_at) ");
        qb.push_values(batch, |mut b, r| {
            b.push_bind(r.entity.as_str())
                .push_bind(r.slot_start.timestamp())
                .push_bind(r.price)
                .push_bind(now);
        });
        qb.push(
            " ON CONFLICT (entity, slot_start) DO UPDATE SET \
             price = excluded.price, \
             updated_at = excluded.updated_at \
             WHERE prices.price != excluded.price",
        );
        affected += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    let after = count_spans(conn, &spans).await?;

    let created = after.saturating_sub(before);
    Ok(IngestStats {
        processed: records.len() as u64,
        created,
        updated: affected.saturating_sub(created),
    })
}

async fn count_spans(conn: &mut SqliteConnection, spans: &BTreeMap<&str, (i64, i64)>) -> Result<u64> {
    let mut total = 0i64;
    for (entity, (lo, hi)) in spans {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM prices WHERE entity = ? AND slot_start >= ? AND slot_start <= ?",
        )
        .bind(*entity)
        .bind(*lo)
        .bind(*hi)
        .fetch_one(&mut *conn)
        .await?;
        total += n;
    }
    Ok(total as u64)
}

async fn put_setting(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// In-memory store with migrations applied.
#[cfg(test)]
pub async fn memory_store() -> Store {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");
    Store::new(pool)
}
