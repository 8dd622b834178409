use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A market area with its own price series (e.g. "lt", "fi"). Stored lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(String);

impl Entity {
    pub fn new(code: &str) -> Self {
        Self(code.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Code as the provider spells it in path segments ("LT").
    pub fn upstream_code(&self) -> String {
        self.0.to_ascii_uppercase()
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub entity: Entity,
    pub slot_start: DateTime<Utc>,
    pub price: f64,
}

/// Width of one time-slot. Never stored; inferred from spacing between instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    QuarterHour,
    Hourly,
}

impl Granularity {
    pub fn from_gap_secs(gap: i64) -> Option<Self> {
        match gap {
            900 => Some(Granularity::QuarterHour),
            3_600 => Some(Granularity::Hourly),
            _ => None,
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Granularity::QuarterHour => "15m",
            Granularity::Hourly => "60m",
        };
        write!(f, "{s}")
    }
}

/// Counts from one ingest transaction. Unchanged rows count as processed only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
}

impl IngestStats {
    /// Rows that actually changed the store.
    pub fn ingested(&self) -> u64 {
        self.created + self.updated
    }

    pub fn merge(&mut self, other: IngestStats) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
    }
}

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWatermark {
    pub entity: Entity,
    pub last_complete_date: NaiveDate,
    pub last_complete_instant: Option<DateTime<Utc>>,
    /// When true every date up to `last_complete_date` is known complete.
    pub trustworthy: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCompleteness {
    pub entity: Entity,
    pub count: i64,
    pub granularity: Option<Granularity>,
    pub expected_min: i64,
    pub expected_max: i64,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateCompleteness {
    pub date: NaiveDate,
    pub entities: Vec<EntityCompleteness>,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub last_completed_chunk_end: NaiveDate,
    pub records_in_chunk: u64,
}

// ---------------------------------------------------------------------------
// Run log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunKind {
    Scheduled,
    Fallback,
    Watchdog,
    WakeRecovery,
    Startup,
    Manual,
    CatchUp,
    Weekly,
    NextDay,
    WatchdogCheck,
    FallbackCheck,
    DailyCheck,
    HealthCheck,
    Backfill,
    BackfillChunk,
    Historical,
}

impl SyncRunKind {
    /// Kinds that run a reconciliation pass.
    pub const RECONCILE: [SyncRunKind; 9] = [
        SyncRunKind::Scheduled,
        SyncRunKind::Fallback,
        SyncRunKind::Watchdog,
        SyncRunKind::WakeRecovery,
        SyncRunKind::Startup,
        SyncRunKind::Manual,
        SyncRunKind::CatchUp,
        SyncRunKind::Weekly,
        SyncRunKind::NextDay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncRunKind::Scheduled => "scheduled",
            SyncRunKind::Fallback => "fallback",
            SyncRunKind::Watchdog => "watchdog",
            SyncRunKind::WakeRecovery => "wake_recovery",
            SyncRunKind::Startup => "startup",
            SyncRunKind::Manual => "manual",
            SyncRunKind::CatchUp => "catch_up",
            SyncRunKind::Weekly => "weekly",
            SyncRunKind::NextDay => "next_day",
            SyncRunKind::WatchdogCheck => "watchdog_check",
            SyncRunKind::FallbackCheck => "fallback_check",
            SyncRunKind::DailyCheck => "daily_check",
            SyncRunKind::HealthCheck => "health_check",
            SyncRunKind::Backfill => "backfill",
            SyncRunKind::BackfillChunk => "backfill_chunk",
            SyncRunKind::Historical => "historical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            SyncRunKind::Scheduled,
            SyncRunKind::Fallback,
            SyncRunKind::Watchdog,
            SyncRunKind::WakeRecovery,
            SyncRunKind::Startup,
            SyncRunKind::Manual,
            SyncRunKind::CatchUp,
            SyncRunKind::Weekly,
            SyncRunKind::NextDay,
            SyncRunKind::WatchdogCheck,
            SyncRunKind::FallbackCheck,
            SyncRunKind::DailyCheck,
            SyncRunKind::HealthCheck,
            SyncRunKind::Backfill,
            SyncRunKind::BackfillChunk,
            SyncRunKind::Historical,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for SyncRunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Started,
    Success,
    Error,
    Skipped,
}

impl SyncRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncRunStatus::Started => "started",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Error => "error",
            SyncRunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(SyncRunStatus::Started),
            "success" => Some(SyncRunStatus::Success),
            "error" => Some(SyncRunStatus::Error),
            "skipped" => Some(SyncRunStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub kind: SyncRunKind,
    pub status: SyncRunStatus,
    pub records: IngestStats,
    pub error_message: Option<String>,
    pub details: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl SyncRun {
    pub fn started(kind: SyncRunKind, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            status: SyncRunStatus::Started,
            records: IngestStats::default(),
            error_message: None,
            details: None,
            started_at: at,
            completed_at: None,
            duration_ms: None,
        }
    }

    /// Close the run. Duration comes from the caller's monotonic measurement.
    pub fn finish(mut self, status: SyncRunStatus, at: DateTime<Utc>, duration_ms: i64) -> Self {
        self.status = status;
        self.completed_at = Some(at);
        self.duration_ms = Some(duration_ms.max(0));
        self
    }

    pub fn with_records(mut self, records: IngestStats) -> Self {
        self.records = records;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub status: SyncRunStatus,
    pub records: IngestStats,
    pub synced: Vec<Entity>,
    /// Inclusive date range fetched from upstream, if any.
    pub fetched: Option<(NaiveDate, NaiveDate)>,
    /// Whether today (reference calendar) is complete after the pass.
    pub today_complete: bool,
    pub error: Option<String>,
}

impl ReconcileOutcome {
    pub fn skipped() -> Self {
        Self {
            status: SyncRunStatus::Skipped,
            records: IngestStats::default(),
            synced: Vec::new(),
            fetched: None,
            today_complete: false,
            error: None,
        }
    }

    pub fn failed(message: String) -> Self {
        Self {
            status: SyncRunStatus::Error,
            error: Some(message),
            ..Self::skipped()
        }
    }

    pub fn ingested(&self) -> u64 {
        self.records.ingested()
    }
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Idle,
    ArmedPreWindow,
    ActivePolling,
    Suppressed,
    Stopped,
}

impl std::fmt::Display for ScheduleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleState::Idle => "idle",
            ScheduleState::ArmedPreWindow => "armed_pre_window",
            ScheduleState::ActivePolling => "active_polling",
            ScheduleState::Suppressed => "suppressed",
            ScheduleState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub state: ScheduleState,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub suppressed_date: Option<NaiveDate>,
    pub watchdog_active: bool,
    pub fallback_active: bool,
}

pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_is_case_insensitive() {
        assert_eq!(Entity::new("LT"), Entity::new(" lt "));
        assert_eq!(Entity::new("fi").upstream_code(), "FI");
    }

    #[test]
    fn run_kind_names_round_trip() {
        for kind in SyncRunKind::RECONCILE {
            assert_eq!(SyncRunKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(SyncRunKind::parse("health_check"), Some(SyncRunKind::HealthCheck));
        assert_eq!(SyncRunKind::parse("nope"), None);
    }

    #[test]
    fn gap_classification() {
        assert_eq!(Granularity::from_gap_secs(900), Some(Granularity::QuarterHour));
        assert_eq!(Granularity::from_gap_secs(3_600), Some(Granularity::Hourly));
        assert_eq!(Granularity::from_gap_secs(1_800), None);
    }
}
