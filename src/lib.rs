//! Runtime Supervision Core: the priority-ordered scheduler, adaptive
//! budget resolver, percentile latency estimator, concurrent thermal/
//! battery/resource samplers, pluggable policy enforcer, and frame-level
//! backpressure queue that sit between an inference request and the
//! synchronous, blocking model-runtime C ABI this crate treats as an
//! external collaborator (spec §1, §2).
//!
//! This crate has no binary entry point — it is linked into host
//! applications (mobile bindings, desktop shells) that own the process
//! lifecycle and supply the actual backend shared library at link time.
//! [`RuntimeSupervisionCore`] is the composition root a host app builds
//! once: it owns the Scheduler, the signal samplers, and the shared
//! backend-initialization guard, and is the factory for every per-modality
//! Worker.

pub mod budget;
pub mod config;
pub mod error;
mod ffi;
pub mod handle;
pub mod scheduler;
pub mod telemetry;
pub mod workers;

use std::sync::Arc;

pub use budget::{AdaptiveProfile, Budget, BudgetEngine, Constraint, MeasuredBaseline, Violation};
pub use config::{Backend, KvCacheType, RuntimeConfig};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use handle::{ContextHandle, Modality};
pub use scheduler::queue::Priority;
pub use scheduler::{ListenerId, Scheduler, TaskOutcome};
pub use telemetry::{BatterySampler, PercentileTracker, ResourceSampler, TelemetryBus, TelemetryEvent, ThermalLevel, ThermalSampler};
pub use workers::guard::BackendGuard;
pub use workers::runtime::{BackendRuntime, ContextInitParams, ModelInitParams};

use telemetry::battery::BatterySource;
use telemetry::resource::RssSource;
use telemetry::thermal::ThermalSource;
use workers::image::ImageWorker;
use workers::speech::SpeechWorker;
use workers::text::TextWorker;
use workers::vision::VisionWorker;

/// Installs a `tracing` subscriber reading `RUST_LOG`, mirroring the
/// teacher's `main.rs` initialization. The crate itself never calls this —
/// only a host application's own startup path should, exactly once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

#[cfg(target_os = "linux")]
fn default_thermal_source() -> Arc<dyn ThermalSource> {
    Arc::new(telemetry::thermal::LinuxSysfsThermalSource::default())
}
#[cfg(not(target_os = "linux"))]
fn default_thermal_source() -> Arc<dyn ThermalSource> {
    Arc::new(telemetry::thermal::UnavailableSource)
}

#[cfg(target_os = "linux")]
fn default_battery_source() -> Box<dyn BatterySource> {
    Box::new(telemetry::battery::LinuxSysfsBatterySource::default())
}
#[cfg(not(target_os = "linux"))]
fn default_battery_source() -> Box<dyn BatterySource> {
    Box::new(telemetry::battery::UnavailableSource)
}

#[cfg(target_os = "linux")]
fn default_rss_source() -> Box<dyn RssSource> {
    Box::new(telemetry::resource::LinuxProcRssSource)
}
#[cfg(not(target_os = "linux"))]
fn default_rss_source() -> Box<dyn RssSource> {
    Box::new(telemetry::resource::UnavailableSource)
}

/// Composition root: owns the Scheduler, the signal samplers, the shared
/// backend guard, and the loaded `RuntimeConfig`. A host app builds one of
/// these per process (or per isolated inference session) and uses it to
/// spawn the Workers it needs.
pub struct RuntimeSupervisionCore {
    scheduler: Scheduler,
    guard: BackendGuard,
    config: RuntimeConfig,
}

impl RuntimeSupervisionCore {
    /// Acquires the backend (idempotent/re-entrant per spec §9) and starts
    /// the Scheduler's driver task plus the battery/thermal sampler tasks.
    /// Samplers run on the host's platform probes when available (Linux
    /// sysfs reference sources ship in this crate; real Apple/Android
    /// probes are injected by the host binding layer) and degrade to
    /// `Unavailable` elsewhere, matching `is_supported() == false` rather
    /// than fabricating readings.
    pub fn new(config: RuntimeConfig, backend: Arc<dyn BackendRuntime>) -> CoreResult<Self> {
        let guard = BackendGuard::acquire(backend)?;
        let thermal = Arc::new(ThermalSampler::new(default_thermal_source()));
        let battery = Arc::new(BatterySampler::new(default_battery_source()));
        let resource = ResourceSampler::new(default_rss_source());
        let scheduler = Scheduler::new(thermal, battery, resource);
        Ok(Self { scheduler, guard, config })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn context_init_params(&self) -> ContextInitParams {
        ContextInitParams {
            context_size: self.config.context_size,
            batch_size: self.config.batch_size,
            flash_attn: self.config.flash_attn,
            kv_cache_type_k: self.config.kv_cache_type_k as i32,
            kv_cache_type_v: self.config.kv_cache_type_v as i32,
        }
    }

    fn model_init_params(&self) -> ModelInitParams {
        ModelInitParams {
            num_threads: self.config.num_threads as i32,
            gpu_layers: self.config.gpu_layers,
            use_mmap: self.config.use_mmap,
            use_mlock: self.config.use_mlock,
            seed: self.config.seed,
        }
    }

    /// Loads a text/chat model and returns a [`TextWorker`] bound to it.
    /// The handle this worker owns is freed when the worker (and every
    /// clone of its handle) drops.
    pub fn spawn_text_worker(&self, model_path: &str, model_size_bytes: u64) -> CoreResult<TextWorker> {
        let backend = self.guard.backend().clone();
        let model = backend.load_model(model_path, &self.model_init_params())?;
        let ctx = backend.create_context(model, &self.context_init_params())?;
        let handle = ContextHandle::new_text(model_size_bytes, self.config.context_size, model, ctx, backend);
        Ok(TextWorker::new(handle, self.guard.clone(), self.config.batch_size))
    }

    /// Loads a vision-language model (plus its projector, assumed already
    /// baked into the same `model_path` by the host's model packaging —
    /// mmproj loading is an external-collaborator concern per spec §1) and
    /// returns a [`VisionWorker`] bound to it.
    pub fn spawn_vision_worker(&self, model_path: &str, model_size_bytes: u64) -> CoreResult<VisionWorker> {
        let backend = self.guard.backend().clone();
        let model = backend.load_model(model_path, &self.model_init_params())?;
        let ctx = backend.create_context(model, &self.context_init_params())?;
        let handle = ContextHandle::new_vision(model_size_bytes, self.config.context_size, model, ctx, backend);
        Ok(VisionWorker::new(handle, self.guard.clone(), self.config.batch_size))
    }

    /// Loads a diffusion model and returns an [`ImageWorker`] bound to it.
    pub fn spawn_image_worker(&self, model_path: &str, model_size_bytes: u64) -> CoreResult<ImageWorker> {
        let backend = self.guard.backend().clone();
        let model = backend.load_model(model_path, &self.model_init_params())?;
        let sd_ctx = backend.sd_context_init(model)?;
        let handle = ContextHandle::new_image(model_size_bytes, model, sd_ctx, backend);
        Ok(ImageWorker::new(handle, self.guard.clone()))
    }

    /// Loads a whisper-style speech model and returns a [`SpeechWorker`]
    /// bound to it.
    pub fn spawn_speech_worker(&self, model_path: &str, model_size_bytes: u64) -> CoreResult<SpeechWorker> {
        let backend = self.guard.backend().clone();
        let model = backend.load_model(model_path, &self.model_init_params())?;
        let ctx = backend.whisper_init(model_path)?;
        let handle = ContextHandle::new_speech(model_size_bytes, model, ctx, backend);
        Ok(SpeechWorker::new(handle, self.guard.clone()))
    }
}
