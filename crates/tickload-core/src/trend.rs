use std::collections::VecDeque;

pub const DEFAULT_TREND_CAPACITY: usize = 5;

/// Bounded history of recent per-interval p99 values.
///
/// Once full, each push evicts the oldest value.
#[derive(Debug, Clone)]
pub struct TrendWindow {
    items: VecDeque<u64>,
    capacity: usize,
}

impl TrendWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: u64) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(value);
    }

    /// Retained values, oldest first.
    pub fn items(&self) -> Vec<u64> {
        self.items.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mean(&self) -> f64 {
        mean(self.items.iter().copied())
    }

    /// Indicator for `latest` against the retained history.
    pub fn indicator(&self, latest: u64) -> &'static str {
        change_indicator(self.mean(), latest)
    }
}

impl Default for TrendWindow {
    fn default() -> Self {
        Self::new(DEFAULT_TREND_CAPACITY)
    }
}

/// Arithmetic mean, zero for no values.
pub fn mean(values: impl IntoIterator<Item = u64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0f64, 0u64), |(sum, n), v| (sum + v as f64, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// One sign per order of magnitude between `latest` and `mean`, at most three.
///
/// The magnitude truncates toward zero, so `latest` has to be at least ten
/// times above (or a tenth below) the mean to be flagged.
pub fn change_indicator(mean: f64, latest: u64) -> &'static str {
    const UP: [&str; 4] = ["", "+", "++", "+++"];
    const DOWN: [&str; 4] = ["", "-", "--", "---"];

    let latest = latest as f64;
    match (mean > 0.0, latest > 0.0) {
        (false, false) => "",
        (false, true) => "+",
        (true, false) => "-",
        (true, true) => {
            let raw = latest.log10() - mean.log10();
            // Absorb rounding at exact powers of ten.
            let diff = (raw + raw.signum() * 1e-9).trunc().clamp(-3.0, 3.0);
            let magnitude = diff.abs() as usize;
            if diff >= 0.0 {
                UP[magnitude]
            } else {
                DOWN[magnitude]
            }
        }
    }
}
