use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Time between two requests of one worker: `1s / qps`, truncated to whole
/// nanoseconds.
pub fn period_for_qps(qps: u32) -> Duration {
    Duration::from_nanos(NANOS_PER_SECOND / u64::from(qps.max(1)))
}

/// Fixed-period ticker driving a single worker.
///
/// At most one tick is ever pending. A caller that is still busy when ticks
/// come due loses them instead of queueing them, so a slow backend lowers the
/// sustained send rate rather than building a backlog.
pub struct RateLimiter {
    ticks: Interval,
    period: Duration,
}

impl RateLimiter {
    pub fn new(qps: u32) -> Self {
        let period = period_for_qps(qps);
        // First tick one period from now, not immediately.
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { ticks, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick.
    pub async fn acquire(&mut self) {
        self.ticks.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_period(qps: u32, expected_nanos: u64) {
        assert_eq!(period_for_qps(qps), Duration::from_nanos(expected_nanos), "qps={}", qps);
    }

    #[test]
    fn test_period_calculation() {
        check_period(100, 10_000_000);
        check_period(1000, 1_000_000);
        check_period(150, 6_666_666);
        check_period(134, 7_462_686);
        assert_eq!(period_for_qps(1), Duration::from_secs(1));
    }

    #[test]
    fn test_period_is_inverse_of_qps() {
        for qps in [1u32, 3, 7, 150, 999, 10_000] {
            let period = period_for_qps(qps).as_secs_f64();
            assert!((period - 1.0 / qps as f64).abs() < 1e-9, "qps={}", qps);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_period() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(100);
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(limiter.period(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_consumer_skips_ticks() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(100);
        limiter.acquire().await;

        // Busy for several periods: ticks at 20..60ms are missed.
        tokio::time::advance(Duration::from_millis(55)).await;
        let stalled_at = start.elapsed();

        // Exactly one tick is pending.
        limiter.acquire().await;
        assert_eq!(start.elapsed(), stalled_at);

        limiter.acquire().await;
        let resumed = start.elapsed();
        assert!(resumed > stalled_at, "second tick must wait");
        assert!(resumed <= stalled_at + Duration::from_millis(10));
    }
}
