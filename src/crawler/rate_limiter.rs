//! Global request pacing
//!
//! One limiter is shared by every worker of every task. It enforces a minimum
//! gap between consecutive upstream requests, drawn at random from a small band
//! so the request cadence is not perfectly regular.

use crate::config::RateLimitConfig;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Minimum-interval gate shared by all workers
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    max_interval: Duration,
    /// When the last caller was let through
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter with an interval drawn from `[min_interval, max_interval]`
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            min_interval,
            max_interval: max_interval.max(min_interval),
            last_call: Mutex::new(None),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_interval_ms),
            Duration::from_millis(config.max_interval_ms),
        )
    }

    /// A limiter that never waits
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Waits until the interval since the previous caller has elapsed
    ///
    /// The lock is held across the sleep, so callers pass the gate one at a
    /// time. The first call never waits.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;

        if let Some(last) = *last_call {
            let ready_at = last + self.next_interval();
            let now = Instant::now();
            if ready_at > now {
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last_call = Some(Instant::now());
    }

    fn next_interval(&self) -> Duration {
        let spread = self.max_interval - self.min_interval;
        if spread.is_zero() {
            return self.min_interval;
        }
        self.min_interval + spread.mul_f64(fastrand::f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_first_call_does_not_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(5), Duration::from_secs(5));
        let started = std::time::Instant::now();
        limiter.wait().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_consecutive_calls_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(50), Duration::from_millis(80));
        let started = std::time::Instant::now();
        for _ in 0..4 {
            limiter.wait().await;
        }
        // Three gaps of at least 50ms each
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_gate_is_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(
            Duration::from_millis(40),
            Duration::from_millis(40),
        ));
        let started = std::time::Instant::now();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.wait().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(started.elapsed() >= Duration::from_millis(160));
    }

    #[test]
    fn test_interval_stays_in_band() {
        let limiter = RateLimiter::new(Duration::from_millis(1000), Duration::from_millis(1500));
        for _ in 0..100 {
            let interval = limiter.next_interval();
            assert!(interval >= Duration::from_millis(1000));
            assert!(interval <= Duration::from_millis(1500));
        }
    }
}
