//! Operational surface for a runtime instance (spec §6).
//!
//! Mirrors the teacher's `AppConfig::from_env` idiom: every field has an
//! environment variable and a documented default, loaded once at process
//! start and cloned into whichever Worker needs it.

use crate::error::{CoreError, ErrorKind};

/// Compute backend selected for model execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Auto,
    Cpu,
    Metal,
    Vulkan,
}

impl Backend {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Backend::Auto),
            "cpu" => Some(Backend::Cpu),
            "metal" => Some(Backend::Metal),
            "vulkan" => Some(Backend::Vulkan),
            _ => None,
        }
    }

    /// Resolve `Auto` to a concrete backend using the host precedence table:
    /// Apple → Metal, Android → Vulkan, else CPU; builds lacking the chosen
    /// backend report `UnsupportedBackend` rather than silently falling
    /// back, except for the final "else" arm which *is* the fallback.
    pub fn resolve(self) -> Result<Backend, CoreError> {
        match self {
            Backend::Auto => Ok(detect_host_backend()),
            other => Ok(other),
        }
    }
}

#[cfg(target_vendor = "apple")]
fn detect_host_backend() -> Backend {
    Backend::Metal
}

#[cfg(target_os = "android")]
fn detect_host_backend() -> Backend {
    Backend::Vulkan
}

#[cfg(not(any(target_vendor = "apple", target_os = "android")))]
fn detect_host_backend() -> Backend {
    Backend::Cpu
}

/// KV-cache element type, per the backend runtime's quantization support.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCacheType {
    F16 = 1,
    Q8_0 = 8,
}

impl KvCacheType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "1" | "f16" | "F16" => Some(KvCacheType::F16),
            "8" | "q8_0" | "Q8_0" => Some(KvCacheType::Q8_0),
            _ => None,
        }
    }
}

/// Runtime configuration for a single process hosting this core.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub backend: Backend,
    /// 0 = auto-detect thread count from the host.
    pub num_threads: u32,
    pub context_size: u32,
    pub batch_size: u32,
    pub memory_limit_bytes: u64,
    /// Advisory only — see spec §9 ambiguity (a). No eviction is ever
    /// triggered by this flag; it exists so host apps can record intent.
    pub auto_unload_on_pressure: bool,
    /// -1 = offload all layers.
    pub gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    /// -1 = random seed chosen by the backend.
    pub seed: i64,
    /// -1 = auto, 0 = off, 1 = on.
    pub flash_attn: i8,
    pub kv_cache_type_k: KvCacheType,
    pub kv_cache_type_v: KvCacheType,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            backend: std::env::var("RSC_BACKEND")
                .ok()
                .and_then(|v| Backend::parse(&v))
                .unwrap_or(Backend::Auto),
            num_threads: std::env::var("RSC_NUM_THREADS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            context_size: std::env::var("RSC_CONTEXT_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4096),
            batch_size: std::env::var("RSC_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(512),
            memory_limit_bytes: std::env::var("RSC_MEMORY_LIMIT_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            auto_unload_on_pressure: std::env::var("RSC_AUTO_UNLOAD_ON_PRESSURE")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            gpu_layers: std::env::var("RSC_GPU_LAYERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1),
            use_mmap: std::env::var("RSC_USE_MMAP")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            use_mlock: std::env::var("RSC_USE_MLOCK")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            seed: std::env::var("RSC_SEED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1),
            flash_attn: std::env::var("RSC_FLASH_ATTN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1),
            kv_cache_type_k: std::env::var("RSC_KV_CACHE_TYPE_K")
                .ok()
                .and_then(|v| KvCacheType::parse(&v))
                .unwrap_or(KvCacheType::F16),
            kv_cache_type_v: std::env::var("RSC_KV_CACHE_TYPE_V")
                .ok()
                .and_then(|v| KvCacheType::parse(&v))
                .unwrap_or(KvCacheType::F16),
        }
    }

    /// Resolve `backend` against the host, normalizing unsupported
    /// combinations into `UnsupportedBackend` at init time rather than at
    /// the first inference call (spec §7 propagation policy).
    pub fn resolve_backend(&self) -> Result<Backend, CoreError> {
        self.backend.resolve().map_err(|e| {
            CoreError::new(
                ErrorKind::UnsupportedBackend,
                format!("failed to resolve backend: {e}"),
            )
        })
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Auto,
            num_threads: 0,
            context_size: 4096,
            batch_size: 512,
            memory_limit_bytes: 0,
            auto_unload_on_pressure: false,
            gpu_layers: -1,
            use_mmap: true,
            use_mlock: false,
            seed: -1,
            flash_attn: -1,
            kv_cache_type_k: KvCacheType::F16,
            kv_cache_type_v: KvCacheType::F16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_is_auto() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.backend, Backend::Auto);
    }

    #[test]
    fn auto_resolves_to_a_concrete_backend() {
        let resolved = Backend::Auto.resolve().unwrap();
        assert_ne!(resolved, Backend::Auto);
    }

    #[test]
    fn non_auto_resolves_to_itself() {
        assert_eq!(Backend::Cpu.resolve().unwrap(), Backend::Cpu);
        assert_eq!(Backend::Metal.resolve().unwrap(), Backend::Metal);
        assert_eq!(Backend::Vulkan.resolve().unwrap(), Backend::Vulkan);
    }

    #[test]
    fn kv_cache_type_parses_aliases() {
        assert_eq!(KvCacheType::parse("f16"), Some(KvCacheType::F16));
        assert_eq!(KvCacheType::parse("8"), Some(KvCacheType::Q8_0));
        assert_eq!(KvCacheType::parse("bogus"), None);
    }
}
