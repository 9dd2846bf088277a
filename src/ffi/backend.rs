//! Raw declarations for the external model-runtime C ABI (spec §6).
//!
//! This module declares the shape of the backend library this crate is
//! linked against by the host application (the actual `.so`/`.dylib`/static
//! archive is supplied outside this crate — see §1's "out of scope"
//! boundary). Nothing in this crate calls these functions directly except
//! [`crate::workers::ffi_runtime::FfiBackendRuntime`]; every other module
//! goes through the [`crate::workers::BackendRuntime`] trait so the rest of
//! the core stays testable without a real native library linked in.
//!
//! Opaque handle types are modeled as zero-sized marker structs behind raw
//! pointers, the standard pattern for wrapping a C ABI's `void *` handles.

use libc::{c_char, c_float, c_int, c_void};

#[repr(C)]
pub struct llama_model {
    _private: [u8; 0],
}

#[repr(C)]
pub struct llama_context {
    _private: [u8; 0],
}

#[repr(C)]
pub struct llama_sampler {
    _private: [u8; 0],
}

#[repr(C)]
pub struct clip_bitmap {
    _private: [u8; 0],
}

#[repr(C)]
pub struct sd_context {
    _private: [u8; 0],
}

#[repr(C)]
pub struct whisper_context {
    _private: [u8; 0],
}

/// Performance counters reported by a context, per spec §6.
#[repr(C)]
pub struct llama_perf_context_data {
    pub load_ms: f64,
    pub prompt_eval_ms: f64,
    pub eval_ms: f64,
    pub n_p_eval: c_int,
    pub n_eval: c_int,
}

#[repr(C)]
pub struct model_params {
    pub num_threads: c_int,
    pub gpu_layers: c_int,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub seed: i64,
}

#[repr(C)]
pub struct context_params {
    pub context_size: u32,
    pub batch_size: u32,
    pub flash_attn: c_int,
    pub kv_cache_type_k: c_int,
    pub kv_cache_type_v: c_int,
}

#[repr(C)]
pub struct sampler_params {
    pub max_tokens: c_int,
    pub temperature: c_float,
    pub top_p: c_float,
    pub top_k: c_int,
    pub repeat_penalty: c_float,
    pub frequency_penalty: c_float,
    pub presence_penalty: c_float,
}

#[repr(C)]
pub struct sd_generate_params {
    pub width: c_int,
    pub height: c_int,
    pub steps: c_int,
    pub cfg_scale: c_float,
    pub sampler_kind: c_int,
    pub schedule_kind: c_int,
    pub seed: i64,
}

/// Signature of the diffusion progress callback the backend invokes during
/// `sd_generate`. The backend only exposes one *global* hook; per-call
/// routing is handled in Rust via a thread-local active-context pointer
/// (see `crate::workers::image`).
pub type ProgressCallback = extern "C" fn(step: c_int, total: c_int, user_data: *mut c_void);

extern "C" {
    // --- init / teardown ---
    pub fn backend_init() -> c_int;
    pub fn backend_teardown();

    // --- model load / free ---
    pub fn model_load(path: *const c_char, params: *const model_params) -> *mut llama_model;
    pub fn model_free(model: *mut llama_model);

    // --- context create / free ---
    pub fn context_create(
        model: *mut llama_model,
        params: *const context_params,
    ) -> *mut llama_context;
    pub fn context_free(ctx: *mut llama_context);
    pub fn context_clear_kv(ctx: *mut llama_context);

    // --- tokenize (resize-on-undersized-buffer contract) ---
    // Returns the number of tokens written, or a negative value equal to
    // -(required length) if `buf_len` was too small.
    pub fn context_tokenize(
        ctx: *mut llama_context,
        text: *const c_char,
        buf: *mut i32,
        buf_len: c_int,
    ) -> c_int;

    // --- decode / sample / piece conversion ---
    pub fn context_decode_batch(ctx: *mut llama_context, tokens: *const i32, n_tokens: c_int) -> c_int;
    pub fn context_sample(ctx: *mut llama_context, sampler: *mut llama_sampler, token_out: *mut i32) -> c_int;
    pub fn context_token_to_piece(
        ctx: *mut llama_context,
        token: i32,
        buf: *mut c_char,
        buf_len: c_int,
    ) -> c_int;
    pub fn context_is_eog(ctx: *mut llama_context, token: i32) -> bool;
    pub fn context_logits(ctx: *mut llama_context, out_len: *mut c_int) -> *const c_float;
    pub fn context_vocab_size(ctx: *mut llama_context) -> c_int;

    // --- sampler chain ---
    pub fn sampler_create(params: *const sampler_params) -> *mut llama_sampler;
    pub fn sampler_free(sampler: *mut llama_sampler);

    // --- perf counters ---
    pub fn context_perf(ctx: *mut llama_context, out: *mut llama_perf_context_data);

    // --- vision extensions ---
    pub fn clip_bitmap_init(rgb: *const u8, width: c_int, height: c_int) -> *mut clip_bitmap;
    pub fn clip_bitmap_free(bitmap: *mut clip_bitmap);
    pub fn context_eval_mixed_chunk(
        ctx: *mut llama_context,
        bitmap: *mut clip_bitmap,
        is_image: bool,
        tokens: *const i32,
        n_tokens: c_int,
        pos: *mut c_int,
    ) -> c_int;

    // --- diffusion extensions ---
    pub fn sd_context_init(model: *mut llama_model) -> *mut sd_context;
    pub fn sd_context_free(ctx: *mut sd_context);
    pub fn sd_generate(
        ctx: *mut sd_context,
        prompt: *const c_char,
        neg_prompt: *const c_char,
        params: *const sd_generate_params,
        progress: Option<ProgressCallback>,
        user_data: *mut c_void,
        out_rgb: *mut *mut u8,
        out_len: *mut c_int,
    ) -> c_int;
    pub fn sd_free_image(buf: *mut u8);

    // --- speech extensions ---
    pub fn whisper_model_init(path: *const c_char) -> *mut whisper_context;
    pub fn whisper_model_free(ctx: *mut whisper_context);
    pub fn whisper_transcribe(
        ctx: *mut whisper_context,
        pcm: *const c_float,
        n_samples: c_int,
    ) -> c_int;
    pub fn whisper_segment_count(ctx: *mut whisper_context) -> c_int;
    pub fn whisper_segment_text(ctx: *mut whisper_context, index: c_int) -> *const c_char;
    /// Centiseconds, per spec §4.7.4 — callers must multiply by 10 for ms.
    pub fn whisper_segment_t0(ctx: *mut whisper_context, index: c_int) -> i64;
    pub fn whisper_segment_t1(ctx: *mut whisper_context, index: c_int) -> i64;
}
