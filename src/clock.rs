#[cfg(test)]
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(test)]
use chrono::TimeDelta;
use chrono::{DateTime, Utc};

/// Wall-clock and process-local time. Process time stops while the host is
/// suspended on most platforms; wall time does not.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Time the process has been running.
    fn uptime(&self) -> Duration;
}

pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { started: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Manually driven clock for tests.
#[cfg(test)]
pub struct FakeClock {
    inner: Mutex<(DateTime<Utc>, Duration)>,
}

#[cfg(test)]
impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { inner: Mutex::new((now, Duration::ZERO)) }
    }

    /// Both clocks move together.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut g) = self.inner.lock() {
            g.0 += TimeDelta::from_std(d).unwrap_or_default();
            g.1 += d;
        }
    }

    /// Wall clock jumps, process time does not (host suspended).
    pub fn suspend(&self, d: Duration) {
        if let Ok(mut g) = self.inner.lock() {
            g.0 += TimeDelta::from_std(d).unwrap_or_default();
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut g) = self.inner.lock() {
            g.0 = now;
        }
    }
}

#[cfg(test)]
impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().map(|g| g.0).unwrap_or_else(|_| Utc::now())
    }

    fn uptime(&self) -> Duration {
        self.inner.lock().map(|g| g.1).unwrap_or_default()
    }
}
