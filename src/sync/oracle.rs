//! Completeness oracle: decides whether a calendar day's data is fully present.
//!
//! Counts are taken over the local day in the reference timezone, so a
//! quarter-hour series has 92 slots on spring-forward days and 100 on fall-back
//! days. Hourly series have 23 to 25. Granularity is inferred from the data.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::MarketCalendar;
use crate::db::Store;
use crate::error::Result;
use crate::types::{DateCompleteness, Entity, EntityCompleteness, Granularity};

/// Samples inspected when the count alone cannot tell the granularity.
const GAP_SAMPLE_SIZE: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletenessBounds {
    /// A count at or above this is assumed to be quarter-hour data.
    pub quarter_hour_threshold: i64,
    pub quarter_hour_min: i64,
    pub quarter_hour_max: i64,
    pub hourly_min: i64,
    pub hourly_max: i64,
}

impl Default for CompletenessBounds {
    fn default() -> Self {
        Self {
            quarter_hour_threshold: 90,
            quarter_hour_min: 92,
            quarter_hour_max: 100,
            hourly_min: 23,
            hourly_max: 25,
        }
    }
}

impl CompletenessBounds {
    pub fn expected(&self, granularity: Granularity) -> (i64, i64) {
        match granularity {
            Granularity::QuarterHour => (self.quarter_hour_min, self.quarter_hour_max),
            Granularity::Hourly => (self.hourly_min, self.hourly_max),
        }
    }

    /// Cheap check on a raw count, used when probing upstream days.
    pub fn looks_complete(&self, count: i64) -> bool {
        count >= self.quarter_hour_threshold || (self.hourly_min..=self.hourly_max).contains(&count)
    }

    /// Full classification of one entity-day.
    pub fn evaluate(&self, entity: &Entity, count: i64, samples: &[DateTime<Utc>]) -> EntityCompleteness {
        let granularity = if count >= self.quarter_hour_threshold {
            Some(Granularity::QuarterHour)
        } else if count > 0 {
            Some(modal_granularity(samples).unwrap_or(Granularity::Hourly))
        } else {
            None
        };
        let (expected_min, expected_max) = self.expected(granularity.unwrap_or(Granularity::Hourly));
        EntityCompleteness {
            entity: entity.clone(),
            count,
            granularity,
            expected_min,
            expected_max,
            is_complete: count > 0 && (expected_min..=expected_max).contains(&count),
        }
    }
}

/// Most frequent gap between consecutive instants, mapped to a granularity.
/// None when there are fewer than two samples or the modal gap is neither 15 nor 60 minutes.
pub fn modal_granularity(samples: &[DateTime<Utc>]) -> Option<Granularity> {
    let mut freq: HashMap<i64, usize> = HashMap::new();
    for pair in samples.windows(2) {
        let gap = (pair[1] - pair[0]).num_seconds();
        if gap > 0 {
            *freq.entry(gap).or_default() += 1;
        }
    }
    let (gap, _) = freq
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))?;
    Granularity::from_gap_secs(gap)
}

#[derive(Clone)]
pub struct CompletenessOracle {
    store: Store,
    calendar: MarketCalendar,
    bounds: CompletenessBounds,
    entities: Vec<Entity>,
}

impl CompletenessOracle {
    pub fn new(store: Store, calendar: MarketCalendar, bounds: CompletenessBounds, entities: Vec<Entity>) -> Self {
        Self { store, calendar, bounds, entities }
    }

    pub async fn entity_completeness(&self, entity: &Entity, date: NaiveDate) -> Result<EntityCompleteness> {
        let (start, end) = self.calendar.day_bounds(date);
        let count = self.store.count_in_range(entity, start, end).await?;
        let samples = if count > 0 && count < self.bounds.quarter_hour_threshold {
            self.store.sample_instants(entity, start, end, GAP_SAMPLE_SIZE).await?
        } else {
            Vec::new()
        };
        Ok(self.bounds.evaluate(entity, count, &samples))
    }

    /// Completeness over every tracked entity.
    pub async fn is_date_complete(&self, date: NaiveDate) -> Result<DateCompleteness> {
        self.is_date_complete_for(date, &self.entities).await
    }

    pub async fn is_date_complete_for(&self, date: NaiveDate, entities: &[Entity]) -> Result<DateCompleteness> {
        let mut per_entity = Vec::with_capacity(entities.len());
        for e in entities {
            per_entity.push(self.entity_completeness(e, date).await?);
        }
        let is_complete = !per_entity.is_empty() && per_entity.iter().all(|c| c.is_complete);
        Ok(DateCompleteness { date, entities: per_entity, is_complete })
    }

    /// Most recent complete date in `[from - (lookback - 1), from]`, newest first.
    pub async fn latest_complete_date(
        &self,
        from: NaiveDate,
        lookback_days: u32,
        entities: &[Entity],
        floor: NaiveDate,
    ) -> Result<Option<NaiveDate>> {
        let mut date = from;
        for _ in 0..lookback_days {
            if date < floor {
                break;
            }
            if self.is_date_complete_for(date, entities).await?.is_complete {
                return Ok(Some(date));
            }
            date -= TimeDelta::days(1);
        }
        Ok(None)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::store::memory_store;
    use crate::types::PriceRecord;

    pub(crate) fn vilnius() -> MarketCalendar {
        MarketCalendar::new(chrono_tz::Europe::Vilnius)
    }

    /// `count` consecutive slots of `step_secs` starting at local midnight.
    pub(crate) fn day_records(entity: &Entity, date: NaiveDate, count: i64, step_secs: i64) -> Vec<PriceRecord> {
        let start = vilnius().day_start(date);
        (0..count)
            .map(|i| PriceRecord {
                entity: entity.clone(),
                slot_start: start + TimeDelta::seconds(i * step_secs),
                price: 10.0 + i as f64,
            })
            .collect()
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    async fn oracle_with(entities: &[&str]) -> (Store, CompletenessOracle) {
        let store = memory_store().await;
        let entities: Vec<Entity> = entities.iter().map(|e| Entity::new(e)).collect();
        let oracle = CompletenessOracle::new(store.clone(), vilnius(), CompletenessBounds::default(), entities);
        (store, oracle)
    }

    #[test]
    fn modal_gap_picks_most_common() {
        let base = vilnius().day_start(date("2025-01-01"));
        let mut samples: Vec<_> = (0..6).map(|i| base + TimeDelta::minutes(15 * i)).collect();
        samples.push(base + TimeDelta::hours(5));
        assert_eq!(modal_granularity(&samples), Some(Granularity::QuarterHour));

        let hourly: Vec<_> = (0..4).map(|i| base + TimeDelta::hours(i)).collect();
        assert_eq!(modal_granularity(&hourly), Some(Granularity::Hourly));
        assert_eq!(modal_granularity(&hourly[..1]), None);
    }

    #[test]
    fn odd_gaps_fall_back_to_hourly() {
        let lt = Entity::new("lt");
        let base = vilnius().day_start(date("2025-01-01"));
        let samples: Vec<_> = (0..5).map(|i| base + TimeDelta::minutes(30 * i)).collect();
        let c = CompletenessBounds::default().evaluate(&lt, 24, &samples);
        assert_eq!(c.granularity, Some(Granularity::Hourly));
        assert!(c.is_complete);
    }

    #[tokio::test]
    async fn ninety_six_records_on_spring_forward_day_is_complete() {
        let (store, oracle) = oracle_with(&["lt"]).await;
        let lt = Entity::new("lt");
        let d = date("2025-03-30");
        // The 23h day has room for 92 quarter-hours; 14-minute spacing fits 96.
        store.upsert_prices(&day_records(&lt, d, 96, 840)).await.unwrap();
        let c = oracle.entity_completeness(&lt, d).await.unwrap();
        assert_eq!(c.count, 96);
        assert_eq!(c.granularity, Some(Granularity::QuarterHour));
        assert!(c.is_complete);
    }

    #[test]
    fn bounds_from_counts() {
        let lt = Entity::new("lt");
        let b = CompletenessBounds::default();
        assert!(b.evaluate(&lt, 96, &[]).is_complete);
        assert!(b.evaluate(&lt, 92, &[]).is_complete);
        assert!(b.evaluate(&lt, 100, &[]).is_complete);
        assert!(!b.evaluate(&lt, 91, &[]).is_complete);
        assert!(!b.evaluate(&lt, 101, &[]).is_complete);
        assert!(!b.evaluate(&lt, 0, &[]).is_complete);
    }

    #[tokio::test]
    async fn fall_back_day_with_92_is_complete() {
        let (store, oracle) = oracle_with(&["lt"]).await;
        let lt = Entity::new("lt");
        let d = date("2025-10-26");
        store.upsert_prices(&day_records(&lt, d, 92, 900)).await.unwrap();
        assert!(oracle.is_date_complete(d).await.unwrap().is_complete);
    }

    #[tokio::test]
    async fn too_many_records_is_incomplete() {
        let (store, oracle) = oracle_with(&["lt"]).await;
        let lt = Entity::new("lt");
        let d = date("2025-10-26");
        // 25h day holds 100 quarter-hours; squeeze 101 in at 14-minute spacing.
        store.upsert_prices(&day_records(&lt, d, 101, 840)).await.unwrap();
        let c = oracle.entity_completeness(&lt, d).await.unwrap();
        assert_eq!(c.count, 101);
        assert!(!c.is_complete);
    }

    #[tokio::test]
    async fn ninety_one_quarter_hours_is_incomplete() {
        let (store, oracle) = oracle_with(&["lt"]).await;
        let lt = Entity::new("lt");
        let d = date("2025-03-30");
        store.upsert_prices(&day_records(&lt, d, 91, 900)).await.unwrap();
        let c = oracle.entity_completeness(&lt, d).await.unwrap();
        assert_eq!(c.granularity, Some(Granularity::QuarterHour));
        assert!(!c.is_complete);
    }

    #[tokio::test]
    async fn partial_quarter_hour_day_is_classified_by_gap() {
        let (store, oracle) = oracle_with(&["lt"]).await;
        let lt = Entity::new("lt");
        let d = date("2025-06-01");
        // 24 quarter-hours would pass the hourly bounds if the gap were ignored.
        store.upsert_prices(&day_records(&lt, d, 24, 900)).await.unwrap();
        let c = oracle.entity_completeness(&lt, d).await.unwrap();
        assert_eq!(c.granularity, Some(Granularity::QuarterHour));
        assert!(!c.is_complete);
    }

    #[tokio::test]
    async fn every_entity_must_be_complete() {
        let (store, oracle) = oracle_with(&["lt", "ee"]).await;
        let d = date("2025-06-01");
        store.upsert_prices(&day_records(&Entity::new("lt"), d, 24, 3_600)).await.unwrap();
        assert!(!oracle.is_date_complete(d).await.unwrap().is_complete);

        store.upsert_prices(&day_records(&Entity::new("ee"), d, 24, 3_600)).await.unwrap();
        let status = oracle.is_date_complete(d).await.unwrap();
        assert!(status.is_complete);
        assert_eq!(status.entities.len(), 2);
    }

    #[tokio::test]
    async fn latest_complete_date_walks_back() {
        let (store, oracle) = oracle_with(&["lt"]).await;
        let lt = Entity::new("lt");
        store.upsert_prices(&day_records(&lt, date("2025-06-01"), 96, 900)).await.unwrap();
        store.upsert_prices(&day_records(&lt, date("2025-06-03"), 40, 900)).await.unwrap();

        let found = oracle
            .latest_complete_date(date("2025-06-03"), 7, &[lt.clone()], date("2012-07-01"))
            .await
            .unwrap();
        assert_eq!(found, Some(date("2025-06-01")));

        let none = oracle
            .latest_complete_date(date("2025-06-03"), 2, &[lt], date("2012-07-01"))
            .await
            .unwrap();
        assert_eq!(none, None);
    }
}
