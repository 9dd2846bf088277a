//! Sliding-window latency quantile tracker (C1, spec §4.1).

const CAPACITY: usize = 100;

/// FIFO ring of up to 100 latency samples with a lazily-rebuilt sorted
/// cache, the same `dirty`-flag pattern the teacher's history tracker uses
/// to avoid re-sorting on every write.
pub struct PercentileTracker {
    ring: Vec<f64>,
    sorted: Vec<f64>,
    dirty: bool,
}

impl PercentileTracker {
    pub fn new() -> Self {
        Self {
            ring: Vec::with_capacity(CAPACITY),
            sorted: Vec::new(),
            dirty: false,
        }
    }

    /// Appends a latency sample, evicting the oldest if the ring is full.
    /// Negative values are rejected (not recorded) rather than propagated
    /// as an error — latency recording must never fail a caller's hot path.
    pub fn record(&mut self, value_ms: f64) {
        if value_ms < 0.0 {
            return;
        }
        if self.ring.len() == CAPACITY {
            self.ring.remove(0);
        }
        self.ring.push(value_ms);
        self.dirty = true;
    }

    /// Returns the value at the given quantile, `p` clamped to `[0, 1]`.
    /// Empty-sample queries return 0.0.
    pub fn quantile(&mut self, p: f64) -> f64 {
        if self.ring.is_empty() {
            return 0.0;
        }
        if self.dirty {
            self.sorted = self.ring.clone();
            self.sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            self.dirty = false;
        }
        let p = p.clamp(0.0, 1.0);
        let idx = ((self.sorted.len() as f64) * p).floor() as usize;
        let idx = idx.min(self.sorted.len() - 1);
        self.sorted[idx]
    }

    pub fn p50(&mut self) -> f64 {
        self.quantile(0.50)
    }

    pub fn p95(&mut self) -> f64 {
        self.quantile(0.95)
    }

    pub fn p99(&mut self) -> f64 {
        self.quantile(0.99)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn reset(&mut self) {
        self.ring.clear();
        self.sorted.clear();
        self.dirty = false;
    }
}

impl Default for PercentileTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_tracker_returns_zero() {
        let mut t = PercentileTracker::new();
        assert_eq!(t.quantile(0.95), 0.0);
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let mut t = PercentileTracker::new();
        for i in 0..150 {
            t.record(i as f64);
        }
        assert_eq!(t.len(), 100);
        // oldest 50 values (0..50) should have been evicted
        assert!(t.quantile(0.0) >= 50.0);
    }

    #[test]
    fn negative_samples_are_not_recorded() {
        let mut t = PercentileTracker::new();
        t.record(-1.0);
        assert!(t.is_empty());
    }

    #[test]
    fn quantile_within_observed_bounds() {
        let mut t = PercentileTracker::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            t.record(v);
        }
        let q = t.quantile(0.5);
        assert!((10.0..=50.0).contains(&q));
    }

    #[test]
    fn reset_clears_ring_and_cache() {
        let mut t = PercentileTracker::new();
        t.record(5.0);
        t.reset();
        assert_eq!(t.quantile(0.5), 0.0);
        assert!(t.is_empty());
    }

    proptest! {
        /// Every quantile query on a non-empty tracker lands within the
        /// range of values actually recorded into it.
        #[test]
        fn quantile_stays_within_recorded_bounds(values in prop::collection::vec(0.0f64..1_000_000.0, 1..200)) {
            let mut tracker = PercentileTracker::new();
            for v in &values {
                tracker.record(*v);
            }
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            for p in [0.0, 0.5, 0.95, 0.99, 1.0] {
                let q = tracker.quantile(p);
                prop_assert!(q >= min - 1e-9 && q <= max + 1e-9);
            }
        }

        /// Negative samples are never stored, regardless of how many land
        /// in a mixed positive/negative stream.
        #[test]
        fn negative_samples_are_never_recorded(values in prop::collection::vec(-1000.0f64..1000.0, 0..50)) {
            let mut tracker = PercentileTracker::new();
            for v in &values {
                tracker.record(*v);
            }
            let non_negative_count = values.iter().filter(|v| **v >= 0.0).count();
            prop_assert!(tracker.len() <= non_negative_count);
        }
    }
}
