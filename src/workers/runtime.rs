//! `BackendRuntime`: the seam between Worker logic and the external C ABI.
//!
//! Spec §6 describes the backend as a handle-based, synchronous, blocking C
//! ABI. This trait is that ABI reshaped into safe Rust method calls; the
//! only implementor that actually crosses into `unsafe`/FFI territory is
//! [`FfiBackendRuntime`]. Everything else in this crate — Workers, the
//! Scheduler, tests — depends on `Arc<dyn BackendRuntime>`, so a fake
//! implementation can stand in without linking a real model-runtime shared
//! library.

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

use crate::error::{CoreError, CoreResult, ErrorKind};

/// Opaque model handle. The pointer is never dereferenced in Rust; it is
/// only ever threaded back into the backend that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawModel(pub(crate) *mut c_void);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawContext(pub(crate) *mut c_void);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSampler(pub(crate) *mut c_void);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBitmap(pub(crate) *mut c_void);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSdContext(pub(crate) *mut c_void);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawWhisperContext(pub(crate) *mut c_void);

// SAFETY: these wrap opaque backend pointers that are only ever passed back
// into the backend that produced them, through calls already serialized by
// the owning Worker's mutex (spec §4.7.5). No Rust code dereferences them.
unsafe impl Send for RawModel {}
unsafe impl Sync for RawModel {}
unsafe impl Send for RawContext {}
unsafe impl Sync for RawContext {}
unsafe impl Send for RawSampler {}
unsafe impl Send for RawBitmap {}
unsafe impl Send for RawSdContext {}
unsafe impl Send for RawWhisperContext {}

#[derive(Debug, Clone, Default)]
pub struct ModelInitParams {
    pub num_threads: i32,
    pub gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub seed: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ContextInitParams {
    pub context_size: u32,
    pub batch_size: u32,
    pub flash_attn: i8,
    pub kv_cache_type_k: i32,
    pub kv_cache_type_v: i32,
}

#[derive(Debug, Clone, Default)]
pub struct SamplerInitParams {
    pub max_tokens: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SdGenerateParams {
    pub width: i32,
    pub height: i32,
    pub steps: i32,
    pub cfg_scale: f32,
    pub sampler_kind: i32,
    pub schedule_kind: i32,
    pub seed: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCounters {
    pub load_ms: f64,
    pub prompt_eval_ms: f64,
    pub eval_ms: f64,
    pub n_p_eval: i32,
    pub n_eval: i32,
}

/// Safe surface over the external synchronous, blocking backend (spec §6).
///
/// Every method here may block the calling thread; callers are expected to
/// invoke these from a context allowed to block (spawn_blocking or a
/// dedicated worker task — see spec §5).
pub trait BackendRuntime: Send + Sync {
    fn init(&self) -> CoreResult<()>;
    fn teardown(&self);

    fn load_model(&self, path: &str, params: &ModelInitParams) -> CoreResult<RawModel>;
    fn free_model(&self, model: RawModel);

    fn create_context(&self, model: RawModel, params: &ContextInitParams) -> CoreResult<RawContext>;
    fn free_context(&self, ctx: RawContext);
    fn clear_kv(&self, ctx: RawContext);

    fn tokenize(&self, ctx: RawContext, text: &str) -> CoreResult<Vec<i32>>;
    fn decode_batch(&self, ctx: RawContext, tokens: &[i32]) -> CoreResult<()>;

    fn create_sampler(&self, params: &SamplerInitParams) -> CoreResult<RawSampler>;
    fn free_sampler(&self, sampler: RawSampler);
    fn sample(&self, ctx: RawContext, sampler: RawSampler) -> CoreResult<i32>;
    fn token_to_piece(&self, ctx: RawContext, token: i32) -> CoreResult<String>;
    fn is_eog(&self, ctx: RawContext, token: i32) -> bool;
    fn logits(&self, ctx: RawContext) -> CoreResult<Vec<f32>>;
    fn vocab_size(&self, ctx: RawContext) -> i32;
    fn perf(&self, ctx: RawContext) -> PerfCounters;

    fn bitmap_init(&self, rgb: &[u8], width: i32, height: i32) -> CoreResult<RawBitmap>;
    fn bitmap_free(&self, bitmap: RawBitmap);
    /// Evaluates one chunk of a mixed text/image sequence, advancing `pos`.
    /// `bitmap = None` means a text chunk; `Some` means an image chunk.
    fn eval_mixed_chunk(
        &self,
        ctx: RawContext,
        bitmap: Option<RawBitmap>,
        tokens: &[i32],
        pos: &mut i32,
    ) -> CoreResult<()>;

    fn sd_context_init(&self, model: RawModel) -> CoreResult<RawSdContext>;
    fn sd_context_free(&self, ctx: RawSdContext);
    #[allow(clippy::too_many_arguments)]
    fn sd_generate(
        &self,
        ctx: RawSdContext,
        prompt: &str,
        neg_prompt: &str,
        params: &SdGenerateParams,
        progress: Option<&dyn Fn(i32, i32)>,
    ) -> CoreResult<(Vec<u8>, i32, i32)>;

    fn whisper_init(&self, path: &str) -> CoreResult<RawWhisperContext>;
    fn whisper_free(&self, ctx: RawWhisperContext);
    fn whisper_transcribe(&self, ctx: RawWhisperContext, pcm: &[f32]) -> CoreResult<usize>;
    fn whisper_segment(&self, ctx: RawWhisperContext, index: i32) -> (String, i64, i64);
}

/// The only implementor of [`BackendRuntime`] that actually crosses into
/// `extern "C"` territory. Constructing one does not call `backend_init` —
/// that happens through the shared guard in `crate::workers::guard`, which
/// is the reference-counted init/teardown the spec requires (§4.7.5, §9).
#[derive(Debug, Default)]
pub struct FfiBackendRuntime;

impl BackendRuntime for FfiBackendRuntime {
    fn init(&self) -> CoreResult<()> {
        let code = unsafe { crate::ffi::backend::backend_init() };
        if code == 0 {
            Ok(())
        } else {
            Err(CoreError::from_backend_code(code, "backend_init"))
        }
    }

    fn teardown(&self) {
        unsafe { crate::ffi::backend::backend_teardown() }
    }

    fn load_model(&self, path: &str, params: &ModelInitParams) -> CoreResult<RawModel> {
        let c_path = CString::new(path)
            .map_err(|_| CoreError::new(ErrorKind::InvalidParameter, "model path contains NUL"))?;
        let raw_params = crate::ffi::backend::model_params {
            num_threads: params.num_threads,
            gpu_layers: params.gpu_layers,
            use_mmap: params.use_mmap,
            use_mlock: params.use_mlock,
            seed: params.seed,
        };
        let ptr = unsafe { crate::ffi::backend::model_load(c_path.as_ptr(), &raw_params) };
        if ptr.is_null() {
            Err(CoreError::new(
                ErrorKind::ModelLoadFailed,
                format!("model_load returned null for {path}"),
            ))
        } else {
            Ok(RawModel(ptr as *mut c_void))
        }
    }

    fn free_model(&self, model: RawModel) {
        unsafe { crate::ffi::backend::model_free(model.0 as *mut crate::ffi::backend::llama_model) }
    }

    fn create_context(&self, model: RawModel, params: &ContextInitParams) -> CoreResult<RawContext> {
        let raw_params = crate::ffi::backend::context_params {
            context_size: params.context_size,
            batch_size: params.batch_size,
            flash_attn: params.flash_attn as i32,
            kv_cache_type_k: params.kv_cache_type_k,
            kv_cache_type_v: params.kv_cache_type_v,
        };
        let ptr = unsafe {
            crate::ffi::backend::context_create(
                model.0 as *mut crate::ffi::backend::llama_model,
                &raw_params,
            )
        };
        if ptr.is_null() {
            Err(CoreError::new(ErrorKind::ContextInvalid, "context_create returned null"))
        } else {
            Ok(RawContext(ptr as *mut c_void))
        }
    }

    fn free_context(&self, ctx: RawContext) {
        unsafe { crate::ffi::backend::context_free(ctx.0 as *mut crate::ffi::backend::llama_context) }
    }

    fn clear_kv(&self, ctx: RawContext) {
        unsafe { crate::ffi::backend::context_clear_kv(ctx.0 as *mut crate::ffi::backend::llama_context) }
    }

    fn tokenize(&self, ctx: RawContext, text: &str) -> CoreResult<Vec<i32>> {
        let c_text = CString::new(text)
            .map_err(|_| CoreError::new(ErrorKind::InvalidParameter, "prompt contains NUL"))?;
        let raw_ctx = ctx.0 as *mut crate::ffi::backend::llama_context;
        let mut buf = vec![0i32; text.len() + 8];
        let n = unsafe {
            crate::ffi::backend::context_tokenize(
                raw_ctx,
                c_text.as_ptr(),
                buf.as_mut_ptr(),
                buf.len() as i32,
            )
        };
        if n >= 0 {
            buf.truncate(n as usize);
            return Ok(buf);
        }
        // resize-on-undersized-buffer contract: negative return is -(required length)
        let required = (-n) as usize;
        buf.resize(required, 0);
        let n2 = unsafe {
            crate::ffi::backend::context_tokenize(
                raw_ctx,
                c_text.as_ptr(),
                buf.as_mut_ptr(),
                buf.len() as i32,
            )
        };
        if n2 < 0 {
            return Err(CoreError::from_backend_code(n2, "context_tokenize retry failed"));
        }
        buf.truncate(n2 as usize);
        Ok(buf)
    }

    fn decode_batch(&self, ctx: RawContext, tokens: &[i32]) -> CoreResult<()> {
        let code = unsafe {
            crate::ffi::backend::context_decode_batch(
                ctx.0 as *mut crate::ffi::backend::llama_context,
                tokens.as_ptr(),
                tokens.len() as i32,
            )
        };
        if code == 0 {
            Ok(())
        } else {
            Err(CoreError::from_backend_code(code, "context_decode_batch"))
        }
    }

    fn create_sampler(&self, params: &SamplerInitParams) -> CoreResult<RawSampler> {
        let raw_params = crate::ffi::backend::sampler_params {
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            repeat_penalty: params.repeat_penalty,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
        };
        let ptr = unsafe { crate::ffi::backend::sampler_create(&raw_params) };
        if ptr.is_null() {
            Err(CoreError::new(ErrorKind::InvalidParameter, "sampler_create returned null"))
        } else {
            Ok(RawSampler(ptr as *mut c_void))
        }
    }

    fn free_sampler(&self, sampler: RawSampler) {
        unsafe { crate::ffi::backend::sampler_free(sampler.0 as *mut crate::ffi::backend::llama_sampler) }
    }

    fn sample(&self, ctx: RawContext, sampler: RawSampler) -> CoreResult<i32> {
        let mut token_out: i32 = 0;
        let code = unsafe {
            crate::ffi::backend::context_sample(
                ctx.0 as *mut crate::ffi::backend::llama_context,
                sampler.0 as *mut crate::ffi::backend::llama_sampler,
                &mut token_out,
            )
        };
        if code == 0 {
            Ok(token_out)
        } else {
            Err(CoreError::from_backend_code(code, "context_sample"))
        }
    }

    fn token_to_piece(&self, ctx: RawContext, token: i32) -> CoreResult<String> {
        let raw_ctx = ctx.0 as *mut crate::ffi::backend::llama_context;
        let mut buf = vec![0i8; 64];
        let n = unsafe {
            crate::ffi::backend::context_token_to_piece(raw_ctx, token, buf.as_mut_ptr(), buf.len() as i32)
        };
        let n = if n < 0 {
            let required = (-n) as usize;
            buf.resize(required, 0);
            unsafe {
                crate::ffi::backend::context_token_to_piece(raw_ctx, token, buf.as_mut_ptr(), buf.len() as i32)
            }
        } else {
            n
        };
        if n < 0 {
            return Err(CoreError::from_backend_code(n, "context_token_to_piece"));
        }
        // A zero-length piece is valid and must still be treated as decoded
        // output (spec §6): it keeps the KV cache consistent even though it
        // contributes nothing to the visible text.
        let bytes: Vec<u8> = buf[..n as usize].iter().map(|&b| b as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_eog(&self, ctx: RawContext, token: i32) -> bool {
        unsafe { crate::ffi::backend::context_is_eog(ctx.0 as *mut crate::ffi::backend::llama_context, token) }
    }

    fn logits(&self, ctx: RawContext) -> CoreResult<Vec<f32>> {
        let mut len: i32 = 0;
        let ptr = unsafe {
            crate::ffi::backend::context_logits(ctx.0 as *mut crate::ffi::backend::llama_context, &mut len)
        };
        if ptr.is_null() || len <= 0 {
            return Err(CoreError::new(ErrorKind::InferenceFailed, "context_logits returned empty"));
        }
        let slice = unsafe { std::slice::from_raw_parts(ptr, len as usize) };
        Ok(slice.to_vec())
    }

    fn vocab_size(&self, ctx: RawContext) -> i32 {
        unsafe { crate::ffi::backend::context_vocab_size(ctx.0 as *mut crate::ffi::backend::llama_context) }
    }

    fn perf(&self, ctx: RawContext) -> PerfCounters {
        let mut out = crate::ffi::backend::llama_perf_context_data {
            load_ms: 0.0,
            prompt_eval_ms: 0.0,
            eval_ms: 0.0,
            n_p_eval: 0,
            n_eval: 0,
        };
        unsafe {
            crate::ffi::backend::context_perf(ctx.0 as *mut crate::ffi::backend::llama_context, &mut out)
        };
        PerfCounters {
            load_ms: out.load_ms,
            prompt_eval_ms: out.prompt_eval_ms,
            eval_ms: out.eval_ms,
            n_p_eval: out.n_p_eval,
            n_eval: out.n_eval,
        }
    }

    fn bitmap_init(&self, rgb: &[u8], width: i32, height: i32) -> CoreResult<RawBitmap> {
        let ptr = unsafe { crate::ffi::backend::clip_bitmap_init(rgb.as_ptr(), width, height) };
        if ptr.is_null() {
            Err(CoreError::new(ErrorKind::InvalidParameter, "clip_bitmap_init returned null"))
        } else {
            Ok(RawBitmap(ptr as *mut c_void))
        }
    }

    fn bitmap_free(&self, bitmap: RawBitmap) {
        unsafe { crate::ffi::backend::clip_bitmap_free(bitmap.0 as *mut crate::ffi::backend::clip_bitmap) }
    }

    fn eval_mixed_chunk(
        &self,
        ctx: RawContext,
        bitmap: Option<RawBitmap>,
        tokens: &[i32],
        pos: &mut i32,
    ) -> CoreResult<()> {
        let (bitmap_ptr, is_image) = match bitmap {
            Some(b) => (b.0 as *mut crate::ffi::backend::clip_bitmap, true),
            None => (std::ptr::null_mut(), false),
        };
        let code = unsafe {
            crate::ffi::backend::context_eval_mixed_chunk(
                ctx.0 as *mut crate::ffi::backend::llama_context,
                bitmap_ptr,
                is_image,
                tokens.as_ptr(),
                tokens.len() as i32,
                pos,
            )
        };
        if code == 0 {
            Ok(())
        } else {
            Err(CoreError::from_backend_code(code, "context_eval_mixed_chunk"))
        }
    }

    fn sd_context_init(&self, model: RawModel) -> CoreResult<RawSdContext> {
        let ptr = unsafe { crate::ffi::backend::sd_context_init(model.0 as *mut crate::ffi::backend::llama_model) };
        if ptr.is_null() {
            Err(CoreError::new(ErrorKind::ContextInvalid, "sd_context_init returned null"))
        } else {
            Ok(RawSdContext(ptr as *mut c_void))
        }
    }

    fn sd_context_free(&self, ctx: RawSdContext) {
        unsafe { crate::ffi::backend::sd_context_free(ctx.0 as *mut crate::ffi::backend::sd_context) }
    }

    fn sd_generate(
        &self,
        ctx: RawSdContext,
        prompt: &str,
        neg_prompt: &str,
        params: &SdGenerateParams,
        progress: Option<&dyn Fn(i32, i32)>,
    ) -> CoreResult<(Vec<u8>, i32, i32)> {
        let c_prompt = CString::new(prompt)
            .map_err(|_| CoreError::new(ErrorKind::InvalidParameter, "prompt contains NUL"))?;
        let c_neg = CString::new(neg_prompt)
            .map_err(|_| CoreError::new(ErrorKind::InvalidParameter, "negative prompt contains NUL"))?;
        let raw_params = crate::ffi::backend::sd_generate_params {
            width: params.width,
            height: params.height,
            steps: params.steps,
            cfg_scale: params.cfg_scale,
            sampler_kind: params.sampler_kind,
            schedule_kind: params.schedule_kind,
            seed: params.seed,
        };
        // `progress` is threaded through crate::workers::image's thread-local
        // active-context slot (spec §9); this call site only forwards the
        // trampoline the image worker already installed.
        let _ = progress;
        let mut out_ptr: *mut u8 = std::ptr::null_mut();
        let mut out_len: i32 = 0;
        let code = unsafe {
            crate::ffi::backend::sd_generate(
                ctx.0 as *mut crate::ffi::backend::sd_context,
                c_prompt.as_ptr(),
                c_neg.as_ptr(),
                &raw_params,
                Some(crate::workers::image::progress_trampoline),
                std::ptr::null_mut(),
                &mut out_ptr,
                &mut out_len,
            )
        };
        if code != 0 {
            return Err(CoreError::from_backend_code(code, "sd_generate"));
        }
        if out_ptr.is_null() || out_len <= 0 {
            return Err(CoreError::new(ErrorKind::InferenceFailed, "sd_generate produced no pixels"));
        }
        let slice = unsafe { std::slice::from_raw_parts(out_ptr, out_len as usize) };
        let owned = slice.to_vec();
        unsafe { crate::ffi::backend::sd_free_image(out_ptr) };
        Ok((owned, params.width, params.height))
    }

    fn whisper_init(&self, path: &str) -> CoreResult<RawWhisperContext> {
        let c_path = CString::new(path)
            .map_err(|_| CoreError::new(ErrorKind::InvalidParameter, "model path contains NUL"))?;
        let ptr = unsafe { crate::ffi::backend::whisper_model_init(c_path.as_ptr()) };
        if ptr.is_null() {
            Err(CoreError::new(ErrorKind::ModelLoadFailed, "whisper_model_init returned null"))
        } else {
            Ok(RawWhisperContext(ptr as *mut c_void))
        }
    }

    fn whisper_free(&self, ctx: RawWhisperContext) {
        unsafe { crate::ffi::backend::whisper_model_free(ctx.0 as *mut crate::ffi::backend::whisper_context) }
    }

    fn whisper_transcribe(&self, ctx: RawWhisperContext, pcm: &[f32]) -> CoreResult<usize> {
        let code = unsafe {
            crate::ffi::backend::whisper_transcribe(
                ctx.0 as *mut crate::ffi::backend::whisper_context,
                pcm.as_ptr(),
                pcm.len() as i32,
            )
        };
        if code < 0 {
            return Err(CoreError::from_backend_code(code, "whisper_transcribe"));
        }
        let count = unsafe {
            crate::ffi::backend::whisper_segment_count(ctx.0 as *mut crate::ffi::backend::whisper_context)
        };
        Ok(count.max(0) as usize)
    }

    fn whisper_segment(&self, ctx: RawWhisperContext, index: i32) -> (String, i64, i64) {
        let raw_ctx = ctx.0 as *mut crate::ffi::backend::whisper_context;
        let text = unsafe {
            let ptr = crate::ffi::backend::whisper_segment_text(raw_ctx, index);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        };
        let t0_cs = unsafe { crate::ffi::backend::whisper_segment_t0(raw_ctx, index) };
        let t1_cs = unsafe { crate::ffi::backend::whisper_segment_t1(raw_ctx, index) };
        (text, t0_cs * 10, t1_cs * 10)
    }
}

/// In-memory stand-in for the backend. Gated behind `test-support` (in
/// addition to plain `cfg(test)`) so the `tests/scenarios.rs` integration
/// binary — which links this crate without `cfg(test)` — can build its own
/// workers against [`FakeBackend`] without a real model-runtime shared
/// library.
#[cfg(any(test, feature = "test-support"))]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// In-memory stand-in for the backend, used by every other module's
    /// unit tests so none of them need a real model file or linked library.
    pub struct FakeBackend {
        next_id: AtomicU64,
        vocab: usize,
        eog_token: i32,
        generated_tokens: Mutex<Vec<i32>>,
        sample_count: AtomicU64,
    }

    impl Default for FakeBackend {
        fn default() -> Self {
            Self {
                next_id: AtomicU64::new(1),
                vocab: 32,
                eog_token: 2,
                generated_tokens: Mutex::new(Vec::new()),
                sample_count: AtomicU64::new(0),
            }
        }
    }

    impl FakeBackend {
        fn next_ptr(&self) -> *mut c_void {
            self.next_id.fetch_add(1, Ordering::Relaxed) as *mut c_void
        }
    }

    impl BackendRuntime for FakeBackend {
        fn init(&self) -> CoreResult<()> {
            Ok(())
        }
        fn teardown(&self) {}

        fn load_model(&self, _path: &str, _params: &ModelInitParams) -> CoreResult<RawModel> {
            Ok(RawModel(self.next_ptr()))
        }
        fn free_model(&self, _model: RawModel) {}

        fn create_context(&self, _model: RawModel, _params: &ContextInitParams) -> CoreResult<RawContext> {
            Ok(RawContext(self.next_ptr()))
        }
        fn free_context(&self, _ctx: RawContext) {}
        fn clear_kv(&self, _ctx: RawContext) {
            self.generated_tokens.lock().unwrap().clear();
            self.sample_count.store(0, Ordering::Relaxed);
        }

        fn tokenize(&self, _ctx: RawContext, text: &str) -> CoreResult<Vec<i32>> {
            Ok(text.split_whitespace().enumerate().map(|(i, _)| (i as i32 % 16) + 3).collect())
        }
        fn decode_batch(&self, _ctx: RawContext, tokens: &[i32]) -> CoreResult<()> {
            self.generated_tokens.lock().unwrap().extend_from_slice(tokens);
            Ok(())
        }

        fn create_sampler(&self, _params: &SamplerInitParams) -> CoreResult<RawSampler> {
            Ok(RawSampler(self.next_ptr()))
        }
        fn free_sampler(&self, _sampler: RawSampler) {}
        fn sample(&self, _ctx: RawContext, _sampler: RawSampler) -> CoreResult<i32> {
            // A small delay stands in for a real backend's per-token cost,
            // so tests exercising concurrency windows (Busy rejection,
            // cancellation mid-stream) have something real to race against.
            std::thread::sleep(std::time::Duration::from_millis(15));
            let n = self.sample_count.fetch_add(1, Ordering::Relaxed);
            let next = if n >= 6 { self.eog_token } else { 10 + n as i32 };
            Ok(next)
        }
        fn token_to_piece(&self, _ctx: RawContext, token: i32) -> CoreResult<String> {
            if token == self.eog_token {
                Ok(String::new())
            } else {
                Ok(format!("t{token} "))
            }
        }
        fn is_eog(&self, _ctx: RawContext, token: i32) -> bool {
            token == self.eog_token
        }
        fn logits(&self, _ctx: RawContext) -> CoreResult<Vec<f32>> {
            Ok(vec![1.0; self.vocab])
        }
        fn vocab_size(&self, _ctx: RawContext) -> i32 {
            self.vocab as i32
        }
        fn perf(&self, _ctx: RawContext) -> PerfCounters {
            PerfCounters::default()
        }

        fn bitmap_init(&self, _rgb: &[u8], _width: i32, _height: i32) -> CoreResult<RawBitmap> {
            Ok(RawBitmap(self.next_ptr()))
        }
        fn bitmap_free(&self, _bitmap: RawBitmap) {}
        fn eval_mixed_chunk(
            &self,
            _ctx: RawContext,
            _bitmap: Option<RawBitmap>,
            tokens: &[i32],
            pos: &mut i32,
        ) -> CoreResult<()> {
            *pos += tokens.len().max(1) as i32;
            Ok(())
        }

        fn sd_context_init(&self, _model: RawModel) -> CoreResult<RawSdContext> {
            Ok(RawSdContext(self.next_ptr()))
        }
        fn sd_context_free(&self, _ctx: RawSdContext) {}
        fn sd_generate(
            &self,
            _ctx: RawSdContext,
            _prompt: &str,
            _neg_prompt: &str,
            params: &SdGenerateParams,
            progress: Option<&dyn Fn(i32, i32)>,
        ) -> CoreResult<(Vec<u8>, i32, i32)> {
            let total = params.steps.max(1);
            for step in 1..=total {
                // Stands in for a real backend's per-step diffusion cost,
                // same rationale as `sample`'s sleep: gives concurrency
                // tests (Busy rejection) a real window to race against.
                std::thread::sleep(std::time::Duration::from_millis(10));
                if let Some(cb) = progress {
                    cb(step, total);
                }
            }
            let n = (params.width.max(0) as usize) * (params.height.max(0) as usize) * 3;
            Ok((vec![128u8; n], params.width, params.height))
        }

        fn whisper_init(&self, _path: &str) -> CoreResult<RawWhisperContext> {
            Ok(RawWhisperContext(self.next_ptr()))
        }
        fn whisper_free(&self, _ctx: RawWhisperContext) {}
        fn whisper_transcribe(&self, _ctx: RawWhisperContext, pcm: &[f32]) -> CoreResult<usize> {
            if !pcm.is_empty() {
                // Stands in for a real pipeline's processing cost, same
                // rationale as `sample`'s sleep.
                std::thread::sleep(std::time::Duration::from_millis(30));
            }
            Ok(if pcm.is_empty() { 0 } else { 1 })
        }
        fn whisper_segment(&self, _ctx: RawWhisperContext, _index: i32) -> (String, i64, i64) {
            ("fake transcript".to_string(), 0, 100)
        }
    }
}
