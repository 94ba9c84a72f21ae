use crate::config::LatencyUnit;
use hdrhistogram::{CreationError, Histogram};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Significant figures kept by every latency histogram.
const SIGFIGS: u8 = 3;

/// Statuses in `[200, 500)` count as good, 4xx included: only server errors
/// and transport failures count against the backend.
pub fn is_good(status: u16) -> bool {
    (200..500).contains(&status)
}

/// Requests expected per interval across all workers.
///
/// Fractional interval seconds are honoured and the result rounded down.
pub fn traffic_target(qps: u32, concurrency: u32, interval: Duration) -> u64 {
    let per_second = f64::from(qps) * f64::from(concurrency);
    (per_second * interval.as_secs_f64()).floor() as u64
}

/// Share of the traffic target that produced a response, capped at 100.
pub fn percent_achieved(good: u64, bad: u64, target: u64) -> u64 {
    let answered = good.saturating_add(bad);
    if target == 0 {
        return if answered > 0 { 100 } else { 0 };
    }
    let pct = (answered as f64 / target as f64) * 100.0;
    pct.clamp(0.0, 100.0) as u64
}

/// Latency distribution in a fixed unit, bounded to one day.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    inner: Histogram<u64>,
}

impl LatencyHistogram {
    pub fn new(unit: LatencyUnit) -> Result<Self, CreationError> {
        let inner = Histogram::new_with_bounds(1, unit.day().max(2), SIGFIGS)?;
        Ok(Self { inner })
    }

    /// Values beyond the upper bound are clamped to it.
    pub fn record(&mut self, value: u64) {
        self.inner.saturating_record(value);
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// `quantile` in `[0, 1]`; zero when nothing was recorded.
    pub fn value_at_quantile(&self, quantile: f64) -> u64 {
        if self.inner.is_empty() {
            return 0;
        }
        self.inner.value_at_quantile(quantile)
    }

    pub fn quantiles(&self) -> Quantiles {
        Quantiles {
            p50: self.value_at_quantile(0.50),
            p75: self.value_at_quantile(0.75),
            p90: self.value_at_quantile(0.90),
            p95: self.value_at_quantile(0.95),
            p99: self.value_at_quantile(0.99),
            p999: self.value_at_quantile(0.999),
        }
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }

    /// Non-empty buckets, lowest first.
    pub fn distribution(&self) -> Vec<Bucket> {
        self.inner
            .iter_recorded()
            .map(|v| {
                let value = v.value_iterated_to();
                Bucket {
                    from: self.inner.lowest_equivalent(value),
                    to: self.inner.highest_equivalent(value),
                    count: v.count_at_value(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub from: u64,
    pub to: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantiles {
    pub p50: u64,
    pub p75: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
}

/// Counters for the current reporting interval.
///
/// Owned by the aggregator alone and reset after each report.
#[derive(Debug, Clone)]
pub struct IntervalStats {
    pub count: u64,
    pub good: u64,
    pub bad: u64,
    pub failed: u64,
    pub bytes: u64,
    pub hash_failures: u64,
    min: u64,
    pub max: u64,
    pub histogram: LatencyHistogram,
}

impl IntervalStats {
    pub fn new(unit: LatencyUnit) -> Result<Self, CreationError> {
        Ok(Self {
            count: 0,
            good: 0,
            bad: 0,
            failed: 0,
            bytes: 0,
            hash_failures: 0,
            min: u64::MAX,
            max: 0,
            histogram: LatencyHistogram::new(unit)?,
        })
    }

    /// Record a completed exchange; `latency` is already in the report unit.
    /// Returns whether the status counted as good.
    pub fn record_response(&mut self, status: u16, latency: u64, size: u64, hash_failed: bool) -> bool {
        self.count += 1;
        self.bytes = self.bytes.saturating_add(size);
        if hash_failed {
            self.hash_failures += 1;
        }
        let good = is_good(status);
        if good {
            self.good += 1;
        } else {
            self.bad += 1;
        }
        self.min = self.min.min(latency);
        self.max = self.max.max(latency);
        self.histogram.record(latency);
        good
    }

    pub fn record_failure(&mut self) {
        self.count += 1;
        self.failed += 1;
    }

    /// Smallest latency seen, or zero when every request failed.
    pub fn min(&self) -> u64 {
        if self.min == u64::MAX {
            0
        } else {
            self.min
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.good = 0;
        self.bad = 0;
        self.failed = 0;
        self.bytes = 0;
        self.hash_failures = 0;
        self.min = u64::MAX;
        self.max = 0;
        self.histogram.reset();
    }
}

/// Whole-run counters; never reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub requests: u64,
    pub good: u64,
    pub bad: u64,
    pub failed: u64,
    pub bytes: u64,
    pub hash_failures: u64,
}

impl RunTotals {
    pub fn absorb(&mut self, interval: &IntervalStats) {
        self.requests += interval.count;
        self.good += interval.good;
        self.bad += interval.bad;
        self.failed += interval.failed;
        self.bytes = self.bytes.saturating_add(interval.bytes);
        self.hash_failures += interval.hash_failures;
    }
}
