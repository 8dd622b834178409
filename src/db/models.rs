/// Database row types matching migrations/0001_init.sql.
/// Used by sqlx for typed queries.
use chrono::NaiveDate;

use crate::error::{AppError, Result};
use crate::types::{from_unix, Entity, IngestStats, SyncRun, SyncRunKind, SyncRunStatus, SyncWatermark};

#[derive(Debug, sqlx::FromRow)]
pub struct WatermarkRow {
    pub entity: String,
    pub last_complete_date: String,
    pub last_complete_instant: Option<i64>,
    pub trustworthy: i64,
    pub updated_at: i64,
}

impl TryFrom<WatermarkRow> for SyncWatermark {
    type Error = AppError;

    fn try_from(row: WatermarkRow) -> Result<Self> {
        let last_complete_date = row.last_complete_date.parse::<NaiveDate>().map_err(|_| {
            AppError::InvalidData(format!(
                "watermark for {} has bad date '{}'",
                row.entity, row.last_complete_date
            ))
        })?;
        Ok(SyncWatermark {
            entity: Entity::new(&row.entity),
            last_complete_date,
            last_complete_instant: row.last_complete_instant.and_then(from_unix),
            trustworthy: row.trustworthy != 0,
            updated_at: from_unix(row.updated_at).unwrap_or_default(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct SyncRunRow {
    pub id: i64,
    pub kind: String,
    pub status: String,
    pub records_processed: i64,
    pub records_created: i64,
    pub records_updated: i64,
    pub error_message: Option<String>,
    pub details: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl TryFrom<SyncRunRow> for SyncRun {
    type Error = AppError;

    fn try_from(row: SyncRunRow) -> Result<Self> {
        let kind = SyncRunKind::parse(&row.kind)
            .ok_or_else(|| AppError::InvalidData(format!("run {} has unknown kind '{}'", row.id, row.kind)))?;
        let status = SyncRunStatus::parse(&row.status)
            .ok_or_else(|| AppError::InvalidData(format!("run {} has unknown status '{}'", row.id, row.status)))?;
        Ok(SyncRun {
            kind,
            status,
            records: IngestStats {
                processed: row.records_processed.max(0) as u64,
                created: row.records_created.max(0) as u64,
                updated: row.records_updated.max(0) as u64,
            },
            error_message: row.error_message,
            details: row.details.and_then(|d| serde_json::from_str(&d).ok()),
            started_at: from_unix(row.started_at).unwrap_or_default(),
            completed_at: row.completed_at.and_then(from_unix),
            duration_ms: row.duration_ms,
        })
    }
}
