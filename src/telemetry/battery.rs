//! Battery-level sampler with a 10-minute drain-rate window (C3, spec §4.3).

use std::fs;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

const WINDOW: Duration = Duration::from_secs(600);
pub const SAMPLE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct BatterySample {
    pub level: f32,
    pub at: Instant,
}

/// A source of raw battery level readings in `[0, 1]`.
pub trait BatterySource: Send + Sync {
    fn read(&self) -> Option<f32>;
}

pub struct UnavailableSource;

impl BatterySource for UnavailableSource {
    fn read(&self) -> Option<f32> {
        None
    }
}

/// Reads `/sys/class/power_supply/*/capacity`, taking the first supply with
/// a parseable reading. Reference implementation only.
pub struct LinuxSysfsBatterySource {
    power_supply_root: String,
}

impl Default for LinuxSysfsBatterySource {
    fn default() -> Self {
        Self { power_supply_root: "/sys/class/power_supply".to_string() }
    }
}

impl BatterySource for LinuxSysfsBatterySource {
    fn read(&self) -> Option<f32> {
        let entries = fs::read_dir(&self.power_supply_root).ok()?;
        for entry in entries.flatten() {
            let capacity_path = entry.path().join("capacity");
            if let Ok(raw) = fs::read_to_string(&capacity_path) {
                if let Ok(pct) = raw.trim().parse::<f32>() {
                    return Some((pct / 100.0).clamp(0.0, 1.0));
                }
            }
        }
        None
    }
}

/// Sliding window of battery samples retaining only entries within the last
/// 600 seconds.
pub struct BatterySampler {
    source: Box<dyn BatterySource>,
    samples: Mutex<Vec<BatterySample>>,
}

impl BatterySampler {
    pub fn new(source: Box<dyn BatterySource>) -> Self {
        Self { source, samples: Mutex::new(Vec::new()) }
    }

    pub fn is_supported(&self) -> bool {
        self.source.read().is_some()
    }

    /// Reads the battery level, appends a sample, and prunes entries older
    /// than the 600s window.
    pub fn sample(&self) {
        let Some(level) = self.source.read() else {
            debug!("battery read unavailable, skipping sample");
            return;
        };
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        samples.push(BatterySample { level, at: now });
        samples.retain(|s| now.duration_since(s.at) <= WINDOW);
    }

    /// `max(0, (first.level-last.level)/elapsed_s · 600 · 100)` percent per
    /// ten minutes. Requires ≥2 samples; negative (charging) clamps to 0.
    pub fn current_drain_rate(&self) -> Option<f32> {
        let samples = self.samples.lock().unwrap();
        if samples.len() < 2 {
            return None;
        }
        let first = samples.first().unwrap();
        let last = samples.last().unwrap();
        let elapsed_s = last.at.duration_since(first.at).as_secs_f32();
        if elapsed_s <= 0.0 {
            return None;
        }
        let rate = (first.level - last.level) / elapsed_s * 600.0 * 100.0;
        Some(rate.max(0.0))
    }

    /// Averages pairwise drain rates across the window. Requires ≥3
    /// samples; otherwise falls back to `current_drain_rate()`.
    pub fn average_drain_rate(&self) -> Option<f32> {
        let samples = self.samples.lock().unwrap();
        if samples.len() < 3 {
            drop(samples);
            return self.current_drain_rate();
        }
        let mut rates = Vec::with_capacity(samples.len() - 1);
        for pair in samples.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let elapsed_s = b.at.duration_since(a.at).as_secs_f32();
            if elapsed_s > 0.0 {
                let rate = (a.level - b.level) / elapsed_s * 600.0 * 100.0;
                rates.push(rate.max(0.0));
            }
        }
        if rates.is_empty() {
            return None;
        }
        Some(rates.iter().sum::<f32>() / rates.len() as f32)
    }

    pub fn reset(&self) {
        self.samples.lock().unwrap().clear();
    }
}
