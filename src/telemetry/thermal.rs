//! Thermal state sampler (C2, spec §4.2).
//!
//! The raw OS notification is sourced through a small [`ThermalSource`]
//! trait rather than hardcoded platform calls — the host SDK compiles real
//! Apple/Android probes at the binding layer and injects them here; this
//! crate ships a Linux sysfs reference source and an `Unavailable`
//! fallback, so `is_supported()` stays meaningful without fabricating a
//! platform API this crate cannot actually call.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

/// Thermal pressure level, per spec §3. Monotonically observable, can move
/// either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThermalLevel {
    Unavailable = -1,
    Nominal = 0,
    Fair = 1,
    Serious = 2,
    Critical = 3,
}

impl ThermalLevel {
    fn from_raw(raw: i8) -> Self {
        match raw {
            0 => ThermalLevel::Nominal,
            1 => ThermalLevel::Fair,
            2 => ThermalLevel::Serious,
            3 => ThermalLevel::Critical,
            _ => ThermalLevel::Unavailable,
        }
    }

    fn to_raw(self) -> i8 {
        self as i8
    }
}

/// A source of raw thermal levels (0-3, or `None` when unsupported).
pub trait ThermalSource: Send + Sync {
    fn read(&self) -> Option<i8>;
    fn is_supported(&self) -> bool {
        self.read().is_some()
    }
}

/// Always-unsupported source, used on targets with no known probe.
pub struct UnavailableSource;

impl ThermalSource for UnavailableSource {
    fn read(&self) -> Option<i8> {
        None
    }
    fn is_supported(&self) -> bool {
        false
    }
}

/// Reads `/sys/class/thermal/thermal_zone*/{type,temp}` and thresholds the
/// hottest zone against fixed Celsius bands. Reference implementation only
/// — real mobile targets get their probes from the host binding layer.
pub struct LinuxSysfsThermalSource {
    zones_root: String,
}

impl Default for LinuxSysfsThermalSource {
    fn default() -> Self {
        Self { zones_root: "/sys/class/thermal".to_string() }
    }
}

impl ThermalSource for LinuxSysfsThermalSource {
    fn read(&self) -> Option<i8> {
        let root = Path::new(&self.zones_root);
        let entries = fs::read_dir(root).ok()?;
        let mut hottest_millidegrees: i64 = i64::MIN;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.file_name()?.to_str()?.starts_with("thermal_zone") {
                continue;
            }
            let temp_raw = fs::read_to_string(path.join("temp")).ok()?;
            if let Ok(millideg) = temp_raw.trim().parse::<i64>() {
                hottest_millidegrees = hottest_millidegrees.max(millideg);
            }
        }
        if hottest_millidegrees == i64::MIN {
            return None;
        }
        let celsius = hottest_millidegrees as f64 / 1000.0;
        let level = if celsius >= 95.0 {
            3
        } else if celsius >= 80.0 {
            2
        } else if celsius >= 65.0 {
            1
        } else {
            0
        };
        Some(level)
    }
}

type ListenerFn = Box<dyn Fn(ThermalLevel) + Send + Sync>;

/// Fire-and-forget listener registration handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    callback: ListenerFn,
}

/// Caches the latest mapped thermal level and dispatches change listeners.
pub struct ThermalSampler {
    source: Arc<dyn ThermalSource>,
    level: AtomicI8,
    next_listener_id: AtomicU64,
    listeners: Mutex<Vec<Listener>>,
}

impl ThermalSampler {
    pub fn new(source: Arc<dyn ThermalSource>) -> Self {
        let initial = source.read().map(ThermalLevel::from_raw).unwrap_or(ThermalLevel::Unavailable);
        Self {
            source,
            level: AtomicI8::new(initial.to_raw()),
            next_listener_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.source.is_supported()
    }

    pub fn current_level(&self) -> ThermalLevel {
        ThermalLevel::from_raw(self.level.load(Ordering::Relaxed))
    }

    pub fn should_throttle(&self) -> bool {
        self.current_level() as i8 >= ThermalLevel::Serious as i8
    }

    pub fn is_critical(&self) -> bool {
        self.current_level() as i8 >= ThermalLevel::Critical as i8
    }

    /// Polls the source; if the mapped level changed, updates the cache and
    /// dispatches registered listeners in registration order. Listeners
    /// must not block — this call is synchronous and fire-and-forget.
    pub fn poll(&self) {
        let new_level = self.source.read().map(ThermalLevel::from_raw).unwrap_or(ThermalLevel::Unavailable);
        let old_raw = self.level.swap(new_level.to_raw(), Ordering::Relaxed);
        if old_raw != new_level.to_raw() {
            debug!(from = old_raw, to = new_level.to_raw(), "thermal level changed");
            for listener in self.listeners.lock().unwrap().iter() {
                (listener.callback)(new_level);
            }
        }
    }

    pub fn on_change(&self, cb: impl Fn(ThermalLevel) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().unwrap().push(Listener { id, callback: Box::new(cb) });
        id
    }

    pub fn remove(&self, id: ListenerId) {
        self.listeners.lock().unwrap().retain(|l| l.id != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::Mutex as StdMutex;

    struct ScriptedSource {
        levels: StdMutex<Vec<i8>>,
    }

    impl ThermalSource for ScriptedSource {
        fn read(&self) -> Option<i8> {
            let mut levels = self.levels.lock().unwrap();
            if levels.is_empty() {
                None
            } else {
                Some(levels.remove(0))
            }
        }
    }

    #[test]
    fn unavailable_source_reports_unsupported() {
        let sampler = ThermalSampler::new(Arc::new(UnavailableSource));
        assert!(!sampler.is_supported());
        assert_eq!(sampler.current_level(), ThermalLevel::Unavailable);
    }

    #[test]
    fn should_throttle_and_is_critical_thresholds() {
        let source = Arc::new(ScriptedSource { levels: StdMutex::new(vec![2]) });
        let sampler = ThermalSampler::new(source);
        assert!(sampler.should_throttle());
        assert!(!sampler.is_critical());
    }

    #[test]
    fn thermal_violation_scenario_emits_one_change_event() {
        let source = Arc::new(ScriptedSource { levels: StdMutex::new(vec![0, 2]) });
        let sampler = ThermalSampler::new(source);
        let seen = Arc::new(AtomicI32::new(-100));
        let seen_clone = seen.clone();
        sampler.on_change(move |level| seen_clone.store(level as i32, Ordering::SeqCst));
        sampler.poll();
        assert_eq!(seen.load(Ordering::SeqCst), ThermalLevel::Serious as i32);
        assert_eq!(sampler.current_level(), ThermalLevel::Serious);
    }

    #[test]
    fn removed_listener_is_not_invoked() {
        let source = Arc::new(ScriptedSource { levels: StdMutex::new(vec![0, 3]) });
        let sampler = ThermalSampler::new(source);
        let seen = Arc::new(AtomicI32::new(0));
        let seen_clone = seen.clone();
        let id = sampler.on_change(move |_| seen_clone.fetch_add(1, Ordering::SeqCst));
        sampler.remove(id);
        sampler.poll();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    proptest! {
        /// Any raw reading, in or out of the documented 0-3 range, maps to
        /// one of the five `ThermalLevel` variants and never panics.
        #[test]
        fn from_raw_always_yields_a_valid_level(raw in any::<i8>()) {
            let level = ThermalLevel::from_raw(raw);
            prop_assert!(matches!(
                level,
                ThermalLevel::Unavailable
                    | ThermalLevel::Nominal
                    | ThermalLevel::Fair
                    | ThermalLevel::Serious
                    | ThermalLevel::Critical
            ));
        }

        /// After any sequence of polls, `current_level` is always one of the
        /// levels the scripted source actually produced (or `Unavailable`
        /// once the source is exhausted).
        #[test]
        fn current_level_after_polling_stays_in_range(raw_levels in prop::collection::vec(0i8..4, 0..10)) {
            let source = Arc::new(ScriptedSource { levels: StdMutex::new(raw_levels) });
            let sampler = ThermalSampler::new(source);
            for _ in 0..10 {
                sampler.poll();
                let level = sampler.current_level();
                prop_assert!((level as i8) >= ThermalLevel::Unavailable as i8);
                prop_assert!((level as i8) <= ThermalLevel::Critical as i8);
            }
        }
    }
}
