//! Timezone-aware calendar. All "which day is this" questions go through here so
//! DST short and long days are handled in one place.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketCalendar {
    tz: Tz,
}

impl MarketCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Local midnight of `date` as a UTC instant.
    pub fn day_start(&self, date: NaiveDate) -> DateTime<Utc> {
        self.at(date, NaiveTime::MIN)
    }

    /// Half-open `[start, end)` covering the local calendar day.
    /// 23 hours long on spring-forward days, 25 on fall-back days.
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.day_start(date);
        let end = date
            .succ_opt()
            .map(|next| self.day_start(next))
            .unwrap_or_else(|| start + TimeDelta::hours(24));
        (start, end)
    }

    /// Last whole second of the local day.
    pub fn day_end_instant(&self, date: NaiveDate) -> DateTime<Utc> {
        self.day_bounds(date).1 - TimeDelta::seconds(1)
    }

    pub fn date_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.tz).date_naive()
    }

    pub fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        self.date_of(now)
    }

    /// Local wall time on `date` as a UTC instant. Times inside a DST gap resolve
    /// forward to the first valid instant; ambiguous times take the earlier one.
    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        resolve_local(self.tz, date.and_time(time))
    }
}

fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    let mut candidate = naive;
    for _ in 0..=12 {
        if let Some(t) = tz.from_local_datetime(&candidate).earliest() {
            return t.with_timezone(&Utc);
        }
        candidate += TimeDelta::minutes(15);
    }
    Utc.from_utc_datetime(&naive)
}

/// Every date in `[start, end]`.
pub fn dates_inclusive(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}
