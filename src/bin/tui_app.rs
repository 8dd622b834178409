use serde::Deserialize;

// ---------------------------------------------------------------------------
// API response types (mirror routes.rs shapes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct StatusResponse {
    pub state: String,
    pub next_run_at: Option<String>,
    pub last_check_at: Option<String>,
    pub suppressed_date: Option<String>,
    pub watchdog_active: bool,
    pub fallback_active: bool,
    pub reconcile_in_flight: bool,
    pub last_success_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatermarkResponse {
    pub entity: String,
    pub last_complete_date: String,
    pub last_complete_instant: Option<String>,
    pub trustworthy: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct RunRecords {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunResponse {
    pub kind: String,
    pub status: String,
    #[serde(default)]
    pub records: RunRecords,
    pub error_message: Option<String>,
    pub started_at: String,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct LatencyResponse {
    pub samples: u64,
    pub p50_ms: Option<u64>,
    pub p95_ms: Option<u64>,
    pub p99_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[allow(dead_code)]
pub struct HealthResponse {
    pub status: String,
    pub last_reconcile_ok: bool,
    pub reconcile_runs: u64,
    pub reconcile_errors: u64,
    pub wake_events: u64,
    pub price_count: i64,
    pub upstream_latency: LatencyResponse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerResponse {
    pub status: String,
    pub ingested: u64,
    pub today_complete: bool,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connected,
    Error(String),
    Connecting,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub status: ConnectionStatus,
    pub sync: StatusResponse,
    pub watermarks: Vec<WatermarkResponse>,
    pub runs: Vec<RunResponse>,
    pub health: HealthResponse,
    /// Result line of the last manual trigger.
    pub last_trigger: Option<String>,
    pub last_refresh: std::time::Instant,
    pub base_url: String,
}

impl AppState {
    pub fn new(base_url: String) -> Self {
        Self {
            status: ConnectionStatus::Connecting,
            sync: StatusResponse::default(),
            watermarks: Vec::new(),
            runs: Vec::new(),
            health: HealthResponse::default(),
            last_trigger: None,
            last_refresh: std::time::Instant::now(),
            base_url,
        }
    }

    pub async fn refresh(&mut self, client: &reqwest::Client) {
        let status_url = format!("{}/sync/status", self.base_url);
        let watermarks_url = format!("{}/sync/watermarks", self.base_url);
        let runs_url = format!("{}/sync/runs?limit=50", self.base_url);
        let health_url = format!("{}/health", self.base_url);

        let (status_res, watermarks_res, runs_res, health_res) = tokio::join!(
            client.get(&status_url).send(),
            client.get(&watermarks_url).send(),
            client.get(&runs_url).send(),
            client.get(&health_url).send(),
        );

        let (status_resp, watermarks_resp, runs_resp) = match (status_res, watermarks_res, runs_res) {
            (Ok(s), Ok(w), Ok(r)) => (s, w, r),
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                self.status = ConnectionStatus::Error(format!("{e}"));
                return;
            }
        };

        let (sync, watermarks, runs) = tokio::join!(
            status_resp.json::<StatusResponse>(),
            watermarks_resp.json::<Vec<WatermarkResponse>>(),
            runs_resp.json::<Vec<RunResponse>>(),
        );

        match (sync, watermarks, runs) {
            (Ok(s), Ok(w), Ok(r)) => {
                self.sync = s;
                self.watermarks = w;
                self.runs = r;
                self.status = ConnectionStatus::Connected;
                self.last_refresh = std::time::Instant::now();

                if let Ok(h) = health_res {
                    if let Ok(health) = h.json::<HealthResponse>().await {
                        self.health = health;
                    }
                }
            }
            (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                self.status = ConnectionStatus::Error(format!("parse error: {e}"));
            }
        }
    }

    /// POST /sync/trigger for every tracked entity. Blocks until the server finishes the run.
    pub async fn trigger(&mut self, client: &reqwest::Client) {
        let url = format!("{}/sync/trigger", self.base_url);
        let result = match client.post(&url).json(&serde_json::json!({})).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<TriggerResponse>().await {
                Ok(t) => format_trigger(&t),
                Err(e) => format!("trigger: parse error: {e}"),
            },
            Ok(resp) => format!("trigger: HTTP {}", resp.status()),
            Err(e) => format!("trigger: {e}"),
        };
        self.last_trigger = Some(result);
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

pub fn format_trigger(t: &TriggerResponse) -> String {
    match &t.error {
        Some(e) => format!("trigger {}: {}", t.status, truncate(e, 60)),
        None => format!(
            "trigger {}: {} records, today {}",
            t.status,
            t.ingested,
            if t.today_complete { "complete" } else { "incomplete" }
        ),
    }
}

/// RFC 3339 timestamp to "MM-DD HH:MM:SS" (UTC). Falls back to the raw string.
pub fn format_timestamp(ts: &str) -> String {
    match chrono::DateTime::parse_from_rfc3339(ts) {
        Ok(t) => t.with_timezone(&chrono::Utc).format("%m-%d %H:%M:%S").to_string(),
        Err(_) => ts.to_string(),
    }
}

pub fn format_opt_timestamp(ts: Option<&str>) -> String {
    ts.map_or("—".to_string(), format_timestamp)
}

pub fn format_duration(ms: Option<i64>) -> String {
    match ms {
        Some(d) if d >= 1000 => format!("{:.1}s", d as f64 / 1000.0),
        Some(d) => format!("{d}ms"),
        None => "—".to_string(),
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_render_in_utc() {
        assert_eq!(format_timestamp("2025-06-10T14:05:09+02:00"), "06-10 12:05:09");
        assert_eq!(format_timestamp("garbage"), "garbage");
        assert_eq!(format_opt_timestamp(None), "—");
    }

    #[test]
    fn truncate_counts_chars() {
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(truncate("ąčę", 3), "ąčę");
    }

    #[test]
    fn run_parses_from_api_shape() {
        let raw = r#"{"kind":"daily","status":"success","records":{"processed":96,"created":96,"updated":0},
            "error_message":null,"details":null,"started_at":"2025-06-10T12:00:00Z",
            "completed_at":"2025-06-10T12:00:01Z","duration_ms":1200}"#;
        let run: RunResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(run.kind, "daily");
        assert_eq!(run.records.created, 96);
        assert_eq!(format_duration(run.duration_ms), "1.2s");
    }
}
