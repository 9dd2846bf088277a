//! Budget Engine: declared budgets, adaptive resolution, violation evaluation (C5, spec §4.5).

use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use crate::telemetry::ThermalLevel;

/// Adaptive profile, an orthogonal multiplier table applied to a measured
/// baseline rather than absolute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdaptiveProfile {
    Conservative,
    Balanced,
    Performance,
}

/// Declarative resource contract. An unresolved adaptive budget (fields all
/// `None`, `adaptive_profile` set) enforces nothing; a resolved budget has
/// all four fields filled from a measured baseline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Budget {
    pub p95_ms: Option<f64>,
    pub drain_per_600s: Option<f32>,
    pub max_thermal_level: Option<i8>,
    pub memory_ceiling_mb: Option<f64>,
    pub adaptive_profile: Option<AdaptiveProfile>,
}

/// A one-shot capture of device-specific measurements taken at warm-up.
#[derive(Debug, Clone, Copy)]
pub struct MeasuredBaseline {
    pub p95_ms: f64,
    pub drain_per_600s: Option<f32>,
    pub thermal_level: i8,
    pub rss_mb: f64,
    pub sample_count: usize,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Constraint {
    P95,
    Drain,
    Thermal,
    Memory,
}

/// A single budget violation event. `observe_only` is true iff
/// `constraint == Memory` — no QoS knob can shrink model weights, so memory
/// violations are reported, never mitigated.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub constraint: Constraint,
    pub measured: f64,
    pub budget: f64,
    pub mitigation_text: &'static str,
    pub mitigated: bool,
    pub observe_only: bool,
    /// Monotonic instant, used for in-process ordering; not serializable.
    #[serde(skip)]
    pub at: Instant,
    /// Wall-clock timestamp for host-side logging and serialized telemetry,
    /// since `Instant` carries no calendar meaning of its own.
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

/// Snapshot of sampler readings fed into `evaluate`. Plain data rather than
/// live sampler references so evaluation is deterministic and testable
/// without timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerReadings {
    pub p95_ms: Option<f64>,
    pub drain_per_600s: Option<f32>,
    pub thermal_level: Option<i8>,
    pub rss_mb: Option<f64>,
}

pub struct BudgetEngine {
    budget: Budget,
}

impl BudgetEngine {
    pub fn new() -> Self {
        Self { budget: Budget::default() }
    }

    pub fn get(&self) -> Budget {
        self.budget.clone()
    }

    /// Replaces the active budget, logging validation warnings for
    /// suspiciously tight thresholds. These are advisory only, never
    /// returned as errors.
    pub fn set(&mut self, budget: Budget) {
        if let Some(p95) = budget.p95_ms {
            if p95 < 500.0 {
                warn!(p95_ms = p95, "budget validation: p95_ms below 500 is unusually strict");
            }
        }
        if let Some(drain) = budget.drain_per_600s {
            if drain < 0.5 {
                warn!(drain_per_600s = drain, "budget validation: drain_per_600s below 0.5 is unusually strict");
            }
        }
        if let Some(mem) = budget.memory_ceiling_mb {
            if mem < 2000.0 {
                warn!(memory_ceiling_mb = mem, "budget validation: memory_ceiling_mb below 2000 is unusually strict");
            }
        }
        self.budget = budget;
    }

    /// Applies the fixed profile multiplier table against a measured
    /// baseline. Memory is always unset after resolution — observe-only, no
    /// mitigation can shrink model weights.
    pub fn resolve(profile: AdaptiveProfile, baseline: &MeasuredBaseline) -> Budget {
        let (p95_mult, drain_mult, thermal_cap): (f64, f32, i8) = match profile {
            AdaptiveProfile::Conservative => (2.0, 0.6, 1i8.max(baseline.thermal_level)),
            AdaptiveProfile::Balanced => (1.5, 1.0, 1),
            AdaptiveProfile::Performance => (1.1, 1.5, 3),
        };
        Budget {
            p95_ms: Some((baseline.p95_ms * p95_mult).round()),
            drain_per_600s: baseline.drain_per_600s.map(|d| d * drain_mult),
            max_thermal_level: Some(thermal_cap),
            memory_ceiling_mb: None,
            adaptive_profile: Some(profile),
        }
    }

    /// Compares each set budget field against the corresponding reading,
    /// emitting a `Violation` for every exceeded constraint. Missing
    /// budget fields are skipped, as are missing readings.
    pub fn evaluate(&self, readings: SamplerReadings) -> Vec<Violation> {
        let mut violations = Vec::new();
        let now = Instant::now();
        let occurred_at = chrono::Utc::now();

        if let (Some(budget_p95), Some(measured_p95)) = (self.budget.p95_ms, readings.p95_ms) {
            if measured_p95 > budget_p95 {
                violations.push(Violation {
                    constraint: Constraint::P95,
                    measured: measured_p95,
                    budget: budget_p95,
                    mitigation_text: "reduce frequency",
                    mitigated: false,
                    observe_only: false,
                    at: now,
                    occurred_at,
                });
            }
        }
        if let (Some(budget_drain), Some(measured_drain)) = (self.budget.drain_per_600s, readings.drain_per_600s) {
            if measured_drain > budget_drain {
                violations.push(Violation {
                    constraint: Constraint::Drain,
                    measured: measured_drain as f64,
                    budget: budget_drain as f64,
                    mitigation_text: "lower quality",
                    mitigated: false,
                    observe_only: false,
                    at: now,
                    occurred_at,
                });
            }
        }
        if let (Some(budget_thermal), Some(measured_thermal)) = (self.budget.max_thermal_level, readings.thermal_level) {
            if measured_thermal > budget_thermal {
                violations.push(Violation {
                    constraint: Constraint::Thermal,
                    measured: measured_thermal as f64,
                    budget: budget_thermal as f64,
                    mitigation_text: "pause high-priority",
                    mitigated: false,
                    observe_only: false,
                    at: now,
                    occurred_at,
                });
            }
        }
        if let (Some(budget_mem), Some(measured_mem)) = (self.budget.memory_ceiling_mb, readings.rss_mb) {
            if measured_mem > budget_mem {
                violations.push(Violation {
                    constraint: Constraint::Memory,
                    measured: measured_mem,
                    budget: budget_mem,
                    mitigation_text: "observe only",
                    mitigated: false,
                    observe_only: true,
                    at: now,
                    occurred_at,
                });
            }
        }
        violations
    }
}

impl Default for BudgetEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Used only so `ThermalLevel` stays imported for call sites that convert
/// sampler output into `SamplerReadings::thermal_level`.
pub fn thermal_level_as_i8(level: ThermalLevel) -> i8 {
    level as i8
}
