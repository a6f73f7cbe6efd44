use std::collections::VecDeque;

/// A timestamped value held by the rolling window.
#[derive(Clone, Copy, Debug)]
pub struct TimedValue {
    pub ts_ms: u64,
    pub value: f64,
}

/// Rolling window over timestamped samples.
///
/// Capacity is bounded by an optional sample count and an optional age;
/// whichever is configured evicts from the front on push. A running sum
/// keeps `mean()` O(1).
#[derive(Clone, Debug, Default)]
pub struct RollingWindow {
    values: VecDeque<TimedValue>,
    sum: f64,
    max_samples: Option<usize>,
    max_age_ms: Option<u64>,
}

impl RollingWindow {
    /// Window bounded to the most recent `n` samples (moving averages,
    /// volume baselines).
    pub fn with_max_samples(n: usize) -> Self {
        Self {
            max_samples: Some(n.max(1)),
            ..Self::default()
        }
    }

    /// Window bounded to samples younger than `ms` (rate-of-change anchors).
    pub fn with_max_age(ms: u64) -> Self {
        Self {
            max_age_ms: Some(ms.max(1)),
            ..Self::default()
        }
    }

    pub fn push(&mut self, ts_ms: u64, value: f64) {
        self.values.push_back(TimedValue { ts_ms, value });
        self.sum += value;

        if let Some(n) = self.max_samples {
            while self.values.len() > n {
                if let Some(old) = self.values.pop_front() {
                    self.sum -= old.value;
                }
            }
        }

        if let Some(age) = self.max_age_ms {
            while let Some(front) = self.values.front() {
                if ts_ms.saturating_sub(front.ts_ms) > age {
                    if let Some(old) = self.values.pop_front() {
                        self.sum -= old.value;
                    }
                } else {
                    break;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.sum / self.values.len() as f64)
        }
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.back().map(|v| v.value)
    }

    pub fn oldest(&self) -> Option<f64> {
        self.values.front().map(|v| v.value)
    }

    /// Newest sample whose timestamp is at or before `ts_ms`.
    ///
    /// Used as the baseline for rate-of-change over a horizon: the window
    /// retains more history than the horizon, so the anchor exists once the
    /// stream is old enough.
    pub fn value_at_or_before(&self, ts_ms: u64) -> Option<f64> {
        self.values
            .iter()
            .rev()
            .find(|v| v.ts_ms <= ts_ms)
            .map(|v| v.value)
    }

    /// Time covered by the window, newest minus oldest timestamp.
    pub fn span_ms(&self) -> u64 {
        match (self.values.front(), self.values.back()) {
            (Some(f), Some(b)) => b.ts_ms.saturating_sub(f.ts_ms),
            _ => 0,
        }
    }
}
