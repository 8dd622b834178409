use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::db::Store;
use crate::error::Result;
use crate::types::{ChunkProgress, Entity, IngestStats, PriceRecord};

/// Idempotent writes keyed by (entity, slot start).
#[derive(Clone)]
pub struct Ingestor {
    store: Store,
}

impl Ingestor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Ingest one fetched batch, restricted to `only`, in a single transaction.
    pub async fn ingest(&self, batch: HashMap<Entity, Vec<PriceRecord>>, only: &[Entity]) -> Result<IngestStats> {
        let records = flatten(batch, only);
        if records.is_empty() {
            return Ok(IngestStats::default());
        }
        let stats = self.store.upsert_prices(&records).await?;
        info!(
            processed = stats.processed,
            created = stats.created,
            updated = stats.updated,
            "[Ingest] batch committed"
        );
        Ok(stats)
    }

    /// Ingest a backfill chunk together with its progress marker.
    pub async fn ingest_chunk(
        &self,
        batch: HashMap<Entity, Vec<PriceRecord>>,
        only: &[Entity],
        progress: &ChunkProgress,
    ) -> Result<IngestStats> {
        let records = flatten(batch, only);
        self.store.upsert_chunk(&records, progress).await
    }
}

/// Flatten into one list with at most one record per (entity, slot); the last seen price wins.
fn flatten(batch: HashMap<Entity, Vec<PriceRecord>>, only: &[Entity]) -> Vec<PriceRecord> {
    let mut by_key: BTreeMap<(Entity, DateTime<Utc>), f64> = BTreeMap::new();
    for (entity, records) in batch {
        if !only.contains(&entity) {
            continue;
        }
        for r in records {
            by_key.insert((entity.clone(), r.slot_start), r.price);
        }
    }
    by_key
        .into_iter()
        .map(|((entity, slot_start), price)| PriceRecord { entity, slot_start, price })
        .collect()
}
