//! In-memory provider for tests. Serves whatever records were added, counts calls,
//! and can be told to fail.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::{scan_latest_available, PriceSource};
use crate::calendar::MarketCalendar;
use crate::error::{AppError, Result};
use crate::sync::oracle::CompletenessBounds;
use crate::types::{Entity, PriceRecord};

pub struct FakeUpstream {
    calendar: MarketCalendar,
    data: Mutex<HashMap<Entity, BTreeMap<DateTime<Utc>, f64>>>,
    range_calls: AtomicUsize,
    fail_next_ranges: AtomicUsize,
    fail_on_call: AtomicUsize,
    latest_disabled: AtomicBool,
    requested: Mutex<Vec<(NaiveDate, NaiveDate)>>,
}

impl FakeUpstream {
    pub fn new(calendar: MarketCalendar) -> Self {
        Self {
            calendar,
            data: Mutex::new(HashMap::new()),
            range_calls: AtomicUsize::new(0),
            fail_next_ranges: AtomicUsize::new(0),
            fail_on_call: AtomicUsize::new(0),
            latest_disabled: AtomicBool::new(false),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, records: Vec<PriceRecord>) {
        let mut data = self.data.lock().unwrap();
        for r in records {
            data.entry(r.entity).or_default().insert(r.slot_start, r.price);
        }
    }

    pub fn latest_of(&self, entity: &Entity) -> Option<DateTime<Utc>> {
        self.data
            .lock()
            .unwrap()
            .get(entity)
            .and_then(|m| m.keys().next_back().copied())
    }

    /// The next `n` range fetches fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next_ranges.store(n, Ordering::SeqCst);
    }

    /// Range fetch number `n` (1-based, counted from creation) fails.
    pub fn fail_on_call(&self, n: usize) {
        self.fail_on_call.store(n, Ordering::SeqCst);
    }

    pub fn disable_latest_endpoint(&self) {
        self.latest_disabled.store(true, Ordering::SeqCst);
    }

    pub fn range_calls(&self) -> usize {
        self.range_calls.load(Ordering::SeqCst)
    }

    pub fn requested_ranges(&self) -> Vec<(NaiveDate, NaiveDate)> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl PriceSource for FakeUpstream {
    async fn fetch_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        entities: &[Entity],
    ) -> Result<HashMap<Entity, Vec<PriceRecord>>> {
        let call = self.range_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requested.lock().unwrap().push((start, end));
        if call == self.fail_on_call.load(Ordering::SeqCst) {
            return Err(AppError::Upstream(format!("injected failure on call {call}")));
        }
        let pending = self.fail_next_ranges.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next_ranges.store(pending - 1, Ordering::SeqCst);
            return Err(AppError::Upstream("injected failure".to_string()));
        }

        let from = self.calendar.day_bounds(start).0;
        let to = self.calendar.day_bounds(end).1;
        let data = self.data.lock().unwrap();
        let mut out = HashMap::new();
        for e in entities {
            let records = data
                .get(e)
                .map(|series| {
                    series
                        .range(from..to)
                        .map(|(t, p)| PriceRecord { entity: e.clone(), slot_start: *t, price: *p })
                        .collect()
                })
                .unwrap_or_default();
            out.insert(e.clone(), records);
        }
        Ok(out)
    }

    async fn latest_timestamp(&self, entity: &Entity) -> Result<Option<DateTime<Utc>>> {
        if self.latest_disabled.load(Ordering::SeqCst) {
            return Err(AppError::Upstream("latest endpoint disabled".to_string()));
        }
        Ok(self.latest_of(entity))
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
            &CompletenessBounds::default(),
            entity,
            scan_from,
            max_days_ahead,
            local_latest,
            Duration::ZERO,
        )
        .await
    }
}
