//! Process RSS sampler with peak tracking (C4, spec §4.4).

use std::fs;
use std::time::Instant;

const CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct ResourceSnapshot {
    pub rss_mb: f64,
    pub at: Instant,
}

/// Reads the process's resident set size. A trait rather than a free
/// function for the same reason `ThermalSource`/`BatterySource` are traits
/// — so the ring/peak bookkeeping can be unit tested without depending on
/// `/proc`.
pub trait RssSource: Send + Sync {
    fn read_rss_mb(&self) -> Option<f64>;
}

/// Reads `VmRSS` from `/proc/self/status`.
pub struct LinuxProcRssSource;

impl RssSource for LinuxProcRssSource {
    fn read_rss_mb(&self) -> Option<f64> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: f64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
                return Some(kb / 1024.0);
            }
        }
        None
    }
}

/// Stub for targets without `/proc` — reads never fail visibly; on
/// primitive failure the sample is simply skipped.
pub struct UnavailableSource;

impl RssSource for UnavailableSource {
    fn read_rss_mb(&self) -> Option<f64> {
        None
    }
}

pub struct ResourceSampler {
    source: Box<dyn RssSource>,
    ring: Vec<ResourceSnapshot>,
    peak_rss_mb: f64,
}

impl ResourceSampler {
    pub fn new(source: Box<dyn RssSource>) -> Self {
        Self { source, ring: Vec::with_capacity(CAPACITY), peak_rss_mb: 0.0 }
    }

    /// Reads RSS and appends to the ring, updating the monotonic peak. A
    /// failed read is skipped silently.
    pub fn sample(&mut self) -> Option<f64> {
        let rss_mb = self.source.read_rss_mb()?;
        if self.ring.len() == CAPACITY {
            self.ring.remove(0);
        }
        self.ring.push(ResourceSnapshot { rss_mb, at: Instant::now() });
        self.peak_rss_mb = self.peak_rss_mb.max(rss_mb);
        Some(rss_mb)
    }

    /// Forces a fresh read before returning, independent of the ring.
    pub fn current_rss_mb(&self) -> Option<f64> {
        self.source.read_rss_mb()
    }

    pub fn peak_rss_mb(&self) -> f64 {
        self.peak_rss_mb
    }

    pub fn reset(&mut self) {
        self.ring.clear();
        self.peak_rss_mb = 0.0;
    }
}
