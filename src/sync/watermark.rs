use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;

use crate::db::Store;
use crate::error::Result;
use crate::types::{Entity, SyncWatermark};

/// Per-entity sync cursors. Only the reconcile engine writes through this.
#[derive(Clone)]
pub struct WatermarkStore {
    store: Store,
}

impl WatermarkStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, entity: &Entity) -> Result<Option<SyncWatermark>> {
        self.store.get_watermark(entity).await
    }

    pub async fn set(
        &self,
        entity: &Entity,
        date: NaiveDate,
        instant: Option<DateTime<Utc>>,
        trustworthy: bool,
        now: DateTime<Utc>,
    ) -> Result<SyncWatermark> {
        let wm = SyncWatermark {
            entity: entity.clone(),
            last_complete_date: date,
            last_complete_instant: instant,
            trustworthy,
            updated_at: now,
        };
        self.store.set_watermark(&wm).await?;
        info!(entity = %entity, %date, trustworthy, "[Watermark] updated");
        Ok(wm)
    }

    /// Seed a watermark unless one exists. Returns whatever is stored afterwards.
    pub async fn initialize_if_absent(
        &self,
        entity: &Entity,
        date: NaiveDate,
        instant: Option<DateTime<Utc>>,
        trustworthy: bool,
        now: DateTime<Utc>,
    ) -> Result<SyncWatermark> {
        let wm = SyncWatermark {
            entity: entity.clone(),
            last_complete_date: date,
            last_complete_instant: instant,
            trustworthy,
            updated_at: now,
        };
        if self.store.insert_watermark_if_absent(&wm).await? {
            info!(entity = %entity, %date, trustworthy, "[Watermark] initialized");
            return Ok(wm);
        }
        Ok(self.store.get_watermark(entity).await?.unwrap_or(wm))
    }
}
