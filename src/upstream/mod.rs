pub mod client;
#[cfg(test)]
pub mod fake;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use tracing::{debug, warn};

use crate::calendar::MarketCalendar;
use crate::error::Result;
use crate::sync::oracle::CompletenessBounds;
use crate::types::{Entity, PriceRecord};

pub use client::EleringClient;

/// The external day-ahead price provider.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Records for every local day in `[start, end]`, keyed by entity.
    /// Requested entities with no data map to an empty vec.
    async fn fetch_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        entities: &[Entity],
    ) -> Result<HashMap<Entity, Vec<PriceRecord>>>;

    /// Newest slot the provider has published for `entity`.
    async fn latest_timestamp(&self, entity: &Entity) -> Result<Option<DateTime<Utc>>>;

    /// Latest date the provider has data for, or None when it has nothing newer
    /// than `local_latest`.
    async fn latest_available_date(
        &self,
        entity: &Entity,
        scan_from: NaiveDate,
        max_days_ahead: u32,
        local_latest: Option<DateTime<Utc>>,
    ) -> Result<Option<NaiveDate>>;
}

/// Shared resolution of the provider's latest available date.
///
/// The latest endpoint answers first. If it is unavailable or older than
/// `scan_from`, days are fetched one at a time: a likely-complete day advances
/// the answer, a partial day is accepted and ends the scan, an empty day or an
/// error ends it.
#[allow(clippy::too_many_arguments)]
pub async fn scan_latest_available<S: PriceSource + ?Sized>(
    source: &S,
    calendar: &MarketCalendar,
    bounds: &CompletenessBounds,
    entity: &Entity,
    scan_from: NaiveDate,
    max_days_ahead: u32,
    local_latest: Option<DateTime<Utc>>,
    delay: Duration,
) -> Result<Option<NaiveDate>> {
    match source.latest_timestamp(entity).await {
        Ok(Some(latest)) => {
            if local_latest.is_some_and(|ours| latest <= ours) {
                debug!(entity = %entity, upstream = %latest, "[Upstream] nothing newer than local data");
                return Ok(None);
            }
            let latest_date = calendar.date_of(latest);
            if latest_date >= scan_from {
                return Ok(Some(latest_date));
            }
        }
        Ok(None) => {}
        Err(e) => warn!(entity = %entity, "[Upstream] latest endpoint failed, scanning by day: {e}"),
    }

    let single = std::slice::from_ref(entity);
    let mut found = None;
    for offset in 0..max_days_ahead {
        let day = scan_from + TimeDelta::days(i64::from(offset));
        if offset > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let count = match source.fetch_range(day, day, single).await {
            Ok(mut data) => data.remove(entity).map(|v| v.len()).unwrap_or(0) as i64,
            Err(e) => {
                warn!(entity = %entity, %day, "[Upstream] scan failed: {e}");
                break;
            }
        };
        if count == 0 {
            break;
        }
        found = Some(day);
        if !bounds.looks_complete(count) {
            debug!(entity = %entity, %day, count, "[Upstream] partial day, stopping scan");
            break;
        }
    }

    if let (Some(day), Some(ours)) = (found, local_latest) {
        if calendar.day_end_instant(day) <= ours {
            return Ok(None);
        }
    }
    Ok(found)
}

/// Split `[start, end]` into consecutive inclusive ranges of at most `max_days` days.
pub fn split_request_ranges(start: NaiveDate, end: NaiveDate, max_days: i64) -> Vec<(NaiveDate, NaiveDate)> {
    let mut out = Vec::new();
    if end < start || max_days <= 0 {
        return out;
    }
    let mut cursor = start;
    while cursor <= end {
        let chunk_end = (cursor + TimeDelta::days(max_days - 1)).min(end);
        out.push((cursor, chunk_end));
        cursor = chunk_end + TimeDelta::days(1);
    }
    out
}
