use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

/// Jittered exponential backoff for catch-up syncs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64, max_delay_ms: u64, jitter_pct: f64) -> Self {
        let base = base_delay_ms.max(1);
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base,
            max_delay_ms: max_delay_ms.max(base),
            jitter_pct: jitter_pct.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt + 1`: base * 2^attempt, capped, then jittered.
    pub fn next_delay(&self, attempt: usize) -> Duration {
        let exp = 2_u64.saturating_pow(attempt as u32);
        let delay = self.base_delay_ms.saturating_mul(exp).min(self.max_delay_ms);
        if self.jitter_pct <= 0.0 {
            return Duration::from_millis(delay);
        }
        let spread = (delay as f64 * self.jitter_pct) as i64;
        let delta = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis(delay.saturating_add_signed(delta))
    }

    /// Run `op` until it succeeds or attempts run out. `op` receives the attempt index.
    pub async fn retry_async<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(err);
                    }
                    sleep(self.next_delay(attempt - 1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::new(5, 2_000, 8_000, 0.0);
        let delays: Vec<_> = (0..4).map(|a| policy.next_delay(a)).collect();
        assert_eq!(delays[0], Duration::from_secs(2));
        assert_eq!(delays[1], Duration::from_secs(4));
        assert_eq!(delays[2], Duration::from_secs(8));
        assert_eq!(delays[3], Duration::from_secs(8));
    }

    #[test]
    fn new_clamps() {
        let policy = RetryPolicy::new(0, 0, 0, 3.0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.base_delay_ms, 1);
        assert_eq!(policy.jitter_pct, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, 10, 10, 0.0);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), &str> = policy
            .retry_async(|_| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("down")
                }
            })
            .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_second_attempt() {
        let policy = RetryPolicy::new(3, 10, 10, 0.0);
        let result: Result<usize, &str> = policy
            .retry_async(|attempt| async move { if attempt == 0 { Err("first") } else { Ok(attempt) } })
            .await;
        assert_eq!(result, Ok(1));
    }
}
