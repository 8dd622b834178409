use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;

use crate::error::{AppError, Result};
use crate::sync::oracle::CompletenessBounds;
use crate::types::Entity;

pub const UPSTREAM_URL: &str = "https://dashboard.elering.ee/api/nps/price";
pub const DEFAULT_ENTITIES: &str = "lt,ee,lv,fi";
pub const REFERENCE_TZ: &str = "Europe/Vilnius";
pub const WINDOW_TZ: &str = "Europe/Paris";
pub const WINDOW_OPEN: &str = "12:45";
pub const WINDOW_CLOSE: &str = "15:55";

/// First date the provider has prices for.
pub const EARLIEST_DATE: &str = "2012-07-01";

/// Re-arm delay while polling inside the publication window (seconds).
pub const POLL_INTERVAL_SECS: i64 = 300;

/// Watchdog tick (seconds).
pub const WATCHDOG_INTERVAL_SECS: u64 = 600;

/// A pending run further out than this while inside the window counts as stuck (seconds).
pub const STUCK_THRESHOLD_SECS: i64 = 600;

/// Watchdog forces a check when the last one is older than this (seconds).
pub const FORCE_CHECK_AFTER_SECS: i64 = 900;

/// Fallback poller tick (seconds).
pub const FALLBACK_INTERVAL_SECS: u64 = 900;

/// Fallback poller forces a run when the last check is older than this (seconds).
pub const FALLBACK_STALE_SECS: i64 = 600;

/// Health check tick (seconds).
pub const HEALTH_INTERVAL_SECS: u64 = 3600;

/// Suspend detection: wall-clock gap threshold and maximum process-local advance (seconds).
pub const SUSPEND_WALL_GAP_SECS: i64 = 300;
pub const SUSPEND_PROCESS_MAX_SECS: i64 = 60;

/// How far ahead the upstream scan looks (days).
pub const SCAN_DAYS_AHEAD: u32 = 7;

/// How far back the oracle walks looking for a complete date (days).
pub const COMPLETE_LOOKBACK_DAYS: u32 = 7;

/// Watermarks never run past today + this many days.
pub const HORIZON_DAYS: i64 = 2;

/// Upstream rejects ranges longer than this (days).
pub const UPSTREAM_MAX_RANGE_DAYS: i64 = 365;

pub const BACKFILL_CHUNK_DELAY_MS: u64 = 1_000;
pub const UPSTREAM_CHUNK_DELAY_MS: u64 = 2_000;
pub const SCAN_DELAY_MS: u64 = 500;
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Health check schedules a catch-up when an entity is missing more than this many hours.
pub const CATCH_UP_MISSING_HOURS: i64 = 24;
pub const CATCH_UP_MAX_ATTEMPTS: usize = 3;
pub const CATCH_UP_BASE_DELAY_MS: u64 = 2_000;

/// Next-day check, in window time.
pub const NEXT_DAY_CHECK_HOUR: u32 = 13;
pub const NEXT_DAY_CHECK_MINUTE: u32 = 30;

/// Weekly full sync: Sunday at this hour, reference time.
pub const WEEKLY_SYNC_HOUR: u32 = 2;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    pub upstream_url: String,
    /// Tracked entities (ENTITIES, comma-separated).
    pub entities: Vec<Entity>,
    /// Timezone that defines calendar days (REFERENCE_TZ).
    pub reference_tz: Tz,
    /// Timezone the publication window is expressed in (WINDOW_TZ).
    pub window_tz: Tz,
    pub window_open: NaiveTime,
    pub window_close: NaiveTime,
    pub earliest_date: NaiveDate,
    pub bounds: CompletenessBounds,
    pub backfill_chunk_delay_ms: u64,
    pub upstream_chunk_delay_ms: u64,
    pub scan_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            db_path: "prices.db".to_string(),
            api_port: 3000,
            upstream_url: UPSTREAM_URL.to_string(),
            entities: parse_entities(DEFAULT_ENTITIES),
            reference_tz: chrono_tz::Europe::Vilnius,
            window_tz: chrono_tz::Europe::Paris,
            window_open: NaiveTime::from_hms_opt(12, 45, 0).unwrap_or_default(),
            window_close: NaiveTime::from_hms_opt(15, 55, 0).unwrap_or_default(),
            earliest_date: NaiveDate::from_ymd_opt(2012, 7, 1).unwrap_or_default(),
            bounds: CompletenessBounds::default(),
            backfill_chunk_delay_ms: BACKFILL_CHUNK_DELAY_MS,
            upstream_chunk_delay_ms: UPSTREAM_CHUNK_DELAY_MS,
            scan_delay_ms: SCAN_DELAY_MS,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = CompletenessBounds::default();
        let entities = parse_entities(
            &std::env::var("ENTITIES").unwrap_or_else(|_| DEFAULT_ENTITIES.to_string()),
        );
        if entities.is_empty() {
            return Err(AppError::Config("ENTITIES must name at least one entity".to_string()));
        }

        let cfg = Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "prices.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            upstream_url: std::env::var("UPSTREAM_URL")
                .unwrap_or_else(|_| UPSTREAM_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            entities,
            reference_tz: parse_tz("REFERENCE_TZ", REFERENCE_TZ)?,
            window_tz: parse_tz("WINDOW_TZ", WINDOW_TZ)?,
            window_open: parse_time("WINDOW_OPEN", WINDOW_OPEN)?,
            window_close: parse_time("WINDOW_CLOSE", WINDOW_CLOSE)?,
            earliest_date: std::env::var("EARLIEST_DATE")
                .unwrap_or_else(|_| EARLIEST_DATE.to_string())
                .parse::<NaiveDate>()
                .map_err(|_| AppError::Config("EARLIEST_DATE must be YYYY-MM-DD".to_string()))?,
            bounds: CompletenessBounds {
                quarter_hour_threshold: env_i64("QUARTER_HOUR_THRESHOLD", defaults.quarter_hour_threshold),
                quarter_hour_min: env_i64("QUARTER_HOUR_MIN", defaults.quarter_hour_min),
                quarter_hour_max: env_i64("QUARTER_HOUR_MAX", defaults.quarter_hour_max),
                hourly_min: env_i64("HOURLY_MIN", defaults.hourly_min),
                hourly_max: env_i64("HOURLY_MAX", defaults.hourly_max),
            },
            backfill_chunk_delay_ms: BACKFILL_CHUNK_DELAY_MS,
            upstream_chunk_delay_ms: UPSTREAM_CHUNK_DELAY_MS,
            scan_delay_ms: SCAN_DELAY_MS,
        };

        if cfg.window_open >= cfg.window_close {
            return Err(AppError::Config("WINDOW_OPEN must be earlier than WINDOW_CLOSE".to_string()));
        }
        if cfg.bounds.quarter_hour_min > cfg.bounds.quarter_hour_max
            || cfg.bounds.hourly_min > cfg.bounds.hourly_max
        {
            return Err(AppError::Config("completeness bounds have min above max".to_string()));
        }

        Ok(cfg)
    }
}

pub fn parse_entities(raw: &str) -> Vec<Entity> {
    let mut out: Vec<Entity> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Entity::new)
        .collect();
    out.dedup();
    out
}

fn parse_tz(var: &str, default: &str) -> Result<Tz> {
    let raw = std::env::var(var).unwrap_or_else(|_| default.to_string());
    raw.parse::<Tz>()
        .map_err(|_| AppError::Config(format!("{var} '{raw}' is not a known timezone")))
}

fn parse_time(var: &str, default: &str) -> Result<NaiveTime> {
    let raw = std::env::var(var).unwrap_or_else(|_| default.to_string());
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .map_err(|_| AppError::Config(format!("{var} must be HH:MM, got '{raw}'")))
}

fn env_i64(var: &str, default: i64) -> i64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_entities_normalizes_and_skips_blanks() {
        let entities = parse_entities(" LT, ee,,lv ");
        let codes: Vec<&str> = entities.iter().map(|e| e.as_str()).collect();
        assert_eq!(codes, vec!["lt", "ee", "lv"]);
    }

    #[test]
    fn default_window_is_afternoon_publication() {
        let cfg = Config::default();
        assert_eq!(cfg.window_open, NaiveTime::from_hms_opt(12, 45, 0).unwrap());
        assert_eq!(cfg.window_close, NaiveTime::from_hms_opt(15, 55, 0).unwrap());
        assert_eq!(cfg.entities.len(), 4);
        assert_eq!(cfg.earliest_date, NaiveDate::from_ymd_opt(2012, 7, 1).unwrap());
    }
}
