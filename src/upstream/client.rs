use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, TimeDelta, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use super::{scan_latest_available, split_request_ranges, PriceSource};
use crate::api::latency::LatencyStats;
use crate::calendar::MarketCalendar;
use crate::config::{Config, HTTP_TIMEOUT_SECS, UPSTREAM_MAX_RANGE_DAYS};
use crate::error::{AppError, Result};
use crate::sync::oracle::CompletenessBounds;
use crate::types::{from_unix, Entity, PriceRecord};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: HashMap<String, Vec<RawPrice>>,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<RawPrice>,
}

#[derive(Debug, Deserialize)]
struct RawPrice {
    timestamp: i64,
    price: Option<f64>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// HTTP client for the Elering NPS price API.
pub struct EleringClient {
    http: reqwest::Client,
    base_url: String,
    calendar: MarketCalendar,
    bounds: CompletenessBounds,
    chunk_delay: Duration,
    scan_delay: Duration,
    latency: Arc<LatencyStats>,
}

impl EleringClient {
    pub fn new(cfg: &Config, latency: Arc<LatencyStats>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.upstream_url.clone(),
            calendar: MarketCalendar::new(cfg.reference_tz),
            bounds: cfg.bounds,
            chunk_delay: Duration::from_millis(cfg.upstream_chunk_delay_ms),
            scan_delay: Duration::from_millis(cfg.scan_delay_ms),
            latency,
        })
    }

    /// One request; caller guarantees the range fits the provider limit.
    async fn fetch_chunk(&self, start: NaiveDate, end: NaiveDate) -> Result<RangeResponse> {
        let (from, _) = self.calendar.day_bounds(start);
        let (_, to) = self.calendar.day_bounds(end);
        let to = to - TimeDelta::milliseconds(1);

        let started = Instant::now();
        let resp = self
            .http
            .get(&self.base_url)
            .query(&[
                ("start", from.to_rfc3339_opts(SecondsFormat::Millis, true)),
                ("end", to.to_rfc3339_opts(SecondsFormat::Millis, true)),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: RangeResponse = resp.json().await?;
        self.latency.record(started.elapsed());

        if !body.success {
            return Err(AppError::Upstream(format!("range {start}..{end} returned success=false")));
        }
        Ok(body)
    }
}

#[async_trait]
impl PriceSource for EleringClient {
    async fn fetch_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        entities: &[Entity],
    ) -> Result<HashMap<Entity, Vec<PriceRecord>>> {
        let mut out: HashMap<Entity, Vec<PriceRecord>> =
            entities.iter().map(|e| (e.clone(), Vec::new())).collect();

        let ranges = split_request_ranges(start, end, UPSTREAM_MAX_RANGE_DAYS);
        if ranges.len() > 1 {
            info!(chunks = ranges.len(), "[Upstream] splitting {start}..{end} into yearly requests");
        }

        for (i, (chunk_start, chunk_end)) in ranges.iter().enumerate() {
            if i > 0 && !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            let body = self.fetch_chunk(*chunk_start, *chunk_end).await?;
            for (code, raw) in body.data {
                let entity = Entity::new(&code);
                let Some(bucket) = out.get_mut(&entity) else {
                    continue;
                };
                bucket.extend(raw.into_iter().filter_map(|p| {
                    Some(PriceRecord {
                        entity: entity.clone(),
                        slot_start: from_unix(p.timestamp)?,
                        price: p.price?,
                    })
                }));
            }
        }

        debug!(
            start = %start,
            end = %end,
            records = out.values().map(Vec::len).sum::<usize>(),
            "[Upstream] range fetched"
        );
        Ok(out)
    }

    async fn latest_timestamp(&self, entity: &Entity) -> Result<Option<DateTime<Utc>>> {
        let url = format!("{}/{}/latest", self.base_url, entity.upstream_code());
        let started = Instant::now();
        let body: LatestResponse = self.http.get(&url).send().await?.error_for_status()?.json().await?;
        self.latency.record(started.elapsed());

        if !body.success {
            return Ok(None);
        }
        Ok(body.data.iter().map(|p| p.timestamp).max().and_then(from_unix))
    }

    async fn latest_available_date(
        &self,
        entity: &Entity,
        scan_from: NaiveDate,
        max_days_ahead: u32,
        local_latest: Option<DateTime<Utc>>,
    ) -> Result<Option<NaiveDate>> {
        scan_latest_available(
            self,
            &self.calendar,
            &self.bounds,
            entity,
            scan_from,
            max_days_ahead,
            local_latest,
            self.scan_delay,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_response_parses_and_skips_null_prices() {
        let raw = r#"{
            "success": true,
            "data": {
                "lt": [{"timestamp": 1735689600, "price": 85.5}, {"timestamp": 1735690500, "price": null}],
                "ee": []
            }
        }"#;
        let body: RangeResponse = serde_json::from_str(raw).unwrap();
        assert!(body.success);
        assert_eq!(body.data["lt"].len(), 2);
        assert_eq!(body.data["lt"][1].price, None);
    }

    #[test]
    fn latest_response_tolerates_missing_data() {
        let body: LatestResponse = serde_json::from_str(r#"{"success": false}"#).unwrap();
        assert!(!body.success);
        assert!(body.data.is_empty());
    }
}
