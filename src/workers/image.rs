//! Image Generation Worker (C7.3, spec §4.7.3).

use std::cell::RefCell;
use std::os::raw::{c_int, c_void};

use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::handle::ContextHandle;
use crate::workers::guard::BackendGuard;
use crate::workers::runtime::SdGenerateParams;

/// Generated image, pixels memcpy'd into core-owned storage before the
/// runtime's own buffer is freed (spec §9).
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub rgb_bytes: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub channels: i32,
}

thread_local! {
    /// Acquire-on-call / clear-on-return active-context slot for the
    /// diffusion runtime's single global progress hook (spec §9). Only
    /// ever populated for the duration of one `sd_generate` call on this
    /// thread; never escapes the call site.
    static ACTIVE_PROGRESS: RefCell<Option<Box<dyn FnMut(i32, i32)>>> = const { RefCell::new(None) };
}

/// The trampoline registered with the backend's single global progress
/// hook. Dereferences whatever closure the calling thread installed.
pub extern "C" fn progress_trampoline(step: c_int, total: c_int, _user_data: *mut c_void) {
    ACTIVE_PROGRESS.with(|slot| {
        if let Some(cb) = slot.borrow_mut().as_mut() {
            cb(step, total);
        }
    });
}

fn with_active_progress<R>(cb: Box<dyn FnMut(i32, i32)>, f: impl FnOnce() -> R) -> R {
    ACTIVE_PROGRESS.with(|slot| *slot.borrow_mut() = Some(cb));
    let result = f();
    ACTIVE_PROGRESS.with(|slot| *slot.borrow_mut() = None);
    result
}

/// Owns a diffusion ContextHandle, created once at construction and freed
/// when the handle's last clone drops — not re-created per call. A
/// per-context progress callback is routed through the thread-local slot
/// above since the backend only exposes one global hook.
pub struct ImageWorker {
    handle: ContextHandle,
    _guard: BackendGuard,
    call_lock: AsyncMutex<()>,
}

impl ImageWorker {
    pub fn new(handle: ContextHandle, guard: BackendGuard) -> Self {
        Self { handle, _guard: guard, call_lock: AsyncMutex::new(()) }
    }

    #[instrument(skip(self, on_progress), fields(handle_id = self.handle.id()))]
    #[allow(clippy::too_many_arguments)]
    pub async fn generate(
        &self,
        prompt: &str,
        neg_prompt: &str,
        width: i32,
        height: i32,
        steps: i32,
        cfg_scale: f32,
        sampler_kind: i32,
        schedule_kind: i32,
        seed: i64,
        on_progress: impl Fn(i32, i32) + Send + 'static,
    ) -> CoreResult<GeneratedImage> {
        let _permit = self
            .call_lock
            .try_lock()
            .map_err(|_| CoreError::busy(format!("handle {} already has an invocation in flight", self.handle.id())))?;

        let backend = self.handle.backend().clone();
        let sd_ctx = self.handle.raw_sd_context();
        let prompt = prompt.to_string();
        let neg_prompt = neg_prompt.to_string();

        tokio::task::spawn_blocking(move || {
            let params = SdGenerateParams { width, height, steps, cfg_scale, sampler_kind, schedule_kind, seed };
            // Two handles to the same callback: one wired through the
            // thread-local trampoline for the real FFI backend (which only
            // exposes a single global hook, spec §9), one passed directly
            // through the trait's `progress` parameter for backends (real
            // test doubles) that can just take a Rust closure. Confined to
            // this blocking-task thread, so `Rc` rather than `Arc` is enough.
            let on_progress = std::rc::Rc::new(on_progress);
            let for_trampoline = on_progress.clone();
            let for_direct = on_progress.clone();
            let direct_cb = move |s: i32, t: i32| (for_direct)(s, t);
            let result = with_active_progress(
                Box::new(move |s, t| (for_trampoline)(s, t)),
                || backend.sd_generate(sd_ctx, &prompt, &neg_prompt, &params, Some(&direct_cb)),
            );
            let (rgb_bytes, w, h) = result?;
            Ok(GeneratedImage { rgb_bytes, width: w, height: h, channels: 3 })
        })
        .await
        .map_err(|e| CoreError::new(ErrorKind::InferenceFailed, format!("worker task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::runtime::tests::FakeBackend;
    use crate::workers::runtime::{BackendRuntime, ModelInitParams};
    use std::sync::Arc;

    fn fake_worker() -> ImageWorker {
        let backend: Arc<dyn BackendRuntime> = Arc::new(FakeBackend::default());
        let guard = BackendGuard::acquire(backend.clone()).unwrap();
        let model = backend.load_model("fake.gguf", &ModelInitParams::default()).unwrap();
        let sd_ctx = backend.sd_context_init(model).unwrap();
        let handle = ContextHandle::new_image(0, model, sd_ctx, backend);
        ImageWorker::new(handle, guard)
    }

    #[tokio::test]
    async fn generate_produces_pixels_sized_to_request() {
        let worker = fake_worker();
        let image = worker
            .generate("a cat", "", 8, 8, 4, 7.0, 0, 0, -1, |_step, _total| {})
            .await
            .unwrap();
        assert_eq!(image.rgb_bytes.len(), 8 * 8 * 3);
        assert_eq!(image.channels, 3);
    }

    #[tokio::test]
    async fn progress_callback_fires_once_per_step() {
        let worker = fake_worker();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _ = worker
            .generate("a dog", "", 4, 4, 3, 7.0, 0, 0, -1, move |step, total| {
                seen_clone.lock().unwrap().push((step, total));
            })
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn concurrent_generate_calls_reject_with_busy() {
        let worker = Arc::new(fake_worker());
        let w2 = worker.clone();
        let first = tokio::spawn(async move { w2.generate("a", "", 4, 4, 50, 7.0, 0, 0, -1, |_, _| {}).await });
        tokio::task::yield_now().await;
        let second = worker.generate("b", "", 4, 4, 4, 7.0, 0, 0, -1, |_, _| {}).await;
        let _ = first.await;
        assert!(second.is_err());
    }
}
