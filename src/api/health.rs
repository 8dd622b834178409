//! Shared health state for the /health endpoint.
//! Updated by the reconcile engine and the health check, read by the API.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct HealthState {
    /// Unix seconds of the last finished reconciliation (0 = none).
    pub last_reconcile_at: AtomicU64,
    pub last_reconcile_ok: AtomicBool,
    pub last_ingested: AtomicU64,
    pub reconcile_runs: AtomicU64,
    pub reconcile_errors: AtomicU64,
    /// Suspend/resume events detected by the hourly tick.
    pub wake_events: AtomicU64,
    /// Unix seconds of the last hourly health tick (0 = none).
    pub last_health_check_at: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reconcile(&self, at_secs: i64, ok: bool, ingested: u64) {
        self.last_reconcile_at.store(at_secs.max(0) as u64, Ordering::Relaxed);
        self.last_reconcile_ok.store(ok, Ordering::Relaxed);
        self.last_ingested.store(ingested, Ordering::Relaxed);
        self.reconcile_runs.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.reconcile_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_wake_events(&self) {
        self.wake_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_health_check_at(&self, at_secs: i64) {
        self.last_health_check_at.store(at_secs.max(0) as u64, Ordering::Relaxed);
    }

    pub fn last_reconcile_at(&self) -> u64 {
        self.last_reconcile_at.load(Ordering::Relaxed)
    }

    pub fn last_reconcile_ok(&self) -> bool {
        self.last_reconcile_ok.load(Ordering::Relaxed)
    }

    pub fn last_ingested(&self) -> u64 {
        self.last_ingested.load(Ordering::Relaxed)
    }

    pub fn reconcile_runs(&self) -> u64 {
        self.reconcile_runs.load(Ordering::Relaxed)
    }

    pub fn reconcile_errors(&self) -> u64 {
        self.reconcile_errors.load(Ordering::Relaxed)
    }

    pub fn wake_events(&self) -> u64 {
        self.wake_events.load(Ordering::Relaxed)
    }

    pub fn last_health_check_at(&self) -> u64 {
        self.last_health_check_at.load(Ordering::Relaxed)
    }
}
