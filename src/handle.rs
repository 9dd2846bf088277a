//! `ContextHandle`: an owning reference to a loaded model (spec §3).
//!
//! The handle is more than an identity token: it owns the actual backend
//! objects (model + modality-specific context) and is the thing that frees
//! them, exactly once, when the last clone drops. "Workers own
//! ContextHandles and are the only components that invoke the external
//! model runtime" (spec §2) — the Worker holds one `ContextHandle` and
//! reaches through it for every backend call, but never frees its pieces
//! directly; that happens in `ContextHandleInner::drop`, never from a
//! destructor that could block on a cross-thread join (spec §3 lifecycle
//! note — the free calls here are themselves synchronous FFI calls, not
//! joins).
//!
//! The four modalities wrap different backend context types
//! (`llama_context` for text/vision, `sd_context` for diffusion,
//! `whisper_context` for speech), so the raw context is carried as an enum
//! rather than forcing one shape on all of them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::workers::runtime::{BackendRuntime, RawContext, RawModel, RawSdContext, RawWhisperContext};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Modality tag carried by a `ContextHandle`, per spec §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Text,
    Vision,
    Image,
    Speech,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Modality::Text => "text",
            Modality::Vision => "vision",
            Modality::Image => "image",
            Modality::Speech => "speech",
        };
        f.write_str(s)
    }
}

/// The modality-specific backend context a handle owns. Text and Vision
/// share `RawContext` (both ride on `llama_context`); Image and Speech each
/// have their own context type.
#[derive(Debug, Clone, Copy)]
pub enum RawContextKind {
    Llama(RawContext),
    Diffusion(RawSdContext),
    Whisper(RawWhisperContext),
}

struct ContextHandleInner {
    id: u64,
    modality: Modality,
    model_size_bytes: u64,
    context_window_tokens: u32,
    model: RawModel,
    context: RawContextKind,
    backend: Arc<dyn BackendRuntime>,
}

impl Drop for ContextHandleInner {
    fn drop(&mut self) {
        match self.context {
            RawContextKind::Llama(ctx) => self.backend.free_context(ctx),
            RawContextKind::Diffusion(ctx) => self.backend.sd_context_free(ctx),
            RawContextKind::Whisper(ctx) => self.backend.whisper_free(ctx),
        }
        self.backend.free_model(self.model);
    }
}

/// An owning, cheaply-clonable reference to a loaded model.
///
/// Created by a Worker during its initialization and destroyed exactly once
/// — when the last clone's `Arc<ContextHandleInner>` drops — on Worker
/// shutdown (spec §3). Comparable by identity, not by contents.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<ContextHandleInner>,
}

impl ContextHandle {
    fn new(
        modality: Modality,
        model_size_bytes: u64,
        context_window_tokens: u32,
        model: RawModel,
        context: RawContextKind,
        backend: Arc<dyn BackendRuntime>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextHandleInner {
                id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
                modality,
                model_size_bytes,
                context_window_tokens,
                model,
                context,
                backend,
            }),
        }
    }

    pub fn new_text(
        model_size_bytes: u64,
        context_window_tokens: u32,
        model: RawModel,
        context: RawContext,
        backend: Arc<dyn BackendRuntime>,
    ) -> Self {
        Self::new(Modality::Text, model_size_bytes, context_window_tokens, model, RawContextKind::Llama(context), backend)
    }

    pub fn new_vision(
        model_size_bytes: u64,
        context_window_tokens: u32,
        model: RawModel,
        context: RawContext,
        backend: Arc<dyn BackendRuntime>,
    ) -> Self {
        Self::new(Modality::Vision, model_size_bytes, context_window_tokens, model, RawContextKind::Llama(context), backend)
    }

    pub fn new_image(
        model_size_bytes: u64,
        model: RawModel,
        context: RawSdContext,
        backend: Arc<dyn BackendRuntime>,
    ) -> Self {
        Self::new(Modality::Image, model_size_bytes, 0, model, RawContextKind::Diffusion(context), backend)
    }

    pub fn new_speech(
        model_size_bytes: u64,
        model: RawModel,
        context: RawWhisperContext,
        backend: Arc<dyn BackendRuntime>,
    ) -> Self {
        Self::new(Modality::Speech, model_size_bytes, 0, model, RawContextKind::Whisper(context), backend)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn modality(&self) -> Modality {
        self.inner.modality
    }

    pub fn model_size_bytes(&self) -> u64 {
        self.inner.model_size_bytes
    }

    pub fn context_window_tokens(&self) -> u32 {
        self.inner.context_window_tokens
    }

    pub fn backend(&self) -> &Arc<dyn BackendRuntime> {
        &self.inner.backend
    }

    pub fn raw_model(&self) -> RawModel {
        self.inner.model
    }

    /// Panics if this handle was not constructed as a Text/Vision handle.
    /// Every call site is a Worker that only ever holds a handle it built
    /// itself through `new_text`/`new_vision`, so the mismatch this guards
    /// against is a programming error in this crate, not caller input.
    pub fn raw_context(&self) -> RawContext {
        match self.inner.context {
            RawContextKind::Llama(ctx) => ctx,
            _ => unreachable!("raw_context() called on a non-Llama ContextHandle"),
        }
    }

    pub fn raw_sd_context(&self) -> RawSdContext {
        match self.inner.context {
            RawContextKind::Diffusion(ctx) => ctx,
            _ => unreachable!("raw_sd_context() called on a non-Diffusion ContextHandle"),
        }
    }

    pub fn raw_whisper_context(&self) -> RawWhisperContext {
        match self.inner.context {
            RawContextKind::Whisper(ctx) => ctx,
            _ => unreachable!("raw_whisper_context() called on a non-Whisper ContextHandle"),
        }
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ContextHandle {}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.inner.id)
            .field("modality", &self.inner.modality)
            .finish()
    }
}
