//! Vision Worker (C7.2, spec §4.7.2).

use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::handle::ContextHandle;
use crate::workers::guard::BackendGuard;
use crate::workers::runtime::SamplerInitParams;
use crate::workers::text::GenerationParams;

/// Media marker the runtime expects prepended to the prompt ahead of the
/// image chunk, matching the projector's mixed-sequence convention.
const MEDIA_MARKER: &str = "<image>";

/// Owns a ContextHandle encapsulating the VLM plus its multimodal
/// projector. `describe` clears KV, builds a mixed text/image chunk
/// sequence, evaluates it chunk-by-chunk (the projector encodes image
/// chunks, the runtime decodes text chunks), frees the tokenization
/// artifacts immediately after evaluation to keep memory bounded, then
/// runs the same sample/decode loop as the Text Worker.
pub struct VisionWorker {
    handle: ContextHandle,
    _guard: BackendGuard,
    call_lock: AsyncMutex<()>,
    batch_size: u32,
}

impl VisionWorker {
    pub fn new(handle: ContextHandle, guard: BackendGuard, batch_size: u32) -> Self {
        Self { handle, _guard: guard, call_lock: AsyncMutex::new(()), batch_size }
    }

    #[instrument(skip(self, rgb, params), fields(handle_id = self.handle.id()))]
    pub async fn describe(
        &self,
        rgb: &[u8],
        width: i32,
        height: i32,
        prompt: &str,
        params: &GenerationParams,
    ) -> CoreResult<String> {
        let _permit = self
            .call_lock
            .try_lock()
            .map_err(|_| CoreError::busy(format!("handle {} already has an invocation in flight", self.handle.id())))?;

        let backend = self.handle.backend().clone();
        let ctx = self.handle.raw_context();
        let rgb = rgb.to_vec();
        let prompt = format!("{MEDIA_MARKER}{prompt}");
        let params = params.clone();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            backend.clear_kv(ctx);
            let bitmap = backend.bitmap_init(&rgb, width, height)?;
            let text_tokens = backend.tokenize(ctx, &prompt)?;
            let mut pos: i32 = 0;

            // Image chunk first (projector encode), then text chunks
            // (runtime decode), matching the "alternates image-encode and
            // text-decode while advancing a position cursor" helper in §6.
            let image_result = backend.eval_mixed_chunk(ctx, Some(bitmap), &[], &mut pos);
            backend.bitmap_free(bitmap);
            image_result?;

            for chunk in text_tokens.chunks(batch_size.max(1) as usize) {
                backend.eval_mixed_chunk(ctx, None, chunk, &mut pos)?;
            }
            // tokenization artifacts (text_tokens, rgb) drop here, bounding
            // memory before the sample loop begins.

            let sampler_params = SamplerInitParams {
                max_tokens: params.max_tokens,
                temperature: params.temperature,
                top_p: params.top_p,
                top_k: params.top_k,
                repeat_penalty: params.repeat_penalty,
                frequency_penalty: params.frequency_penalty,
                presence_penalty: params.presence_penalty,
            };
            let sampler = backend.create_sampler(&sampler_params)?;
            let max_tokens = if params.max_tokens > 0 { params.max_tokens } else { i32::MAX };
            let result = (|| {
                let mut output = String::new();
                for _ in 0..max_tokens {
                    let token = backend.sample(ctx, sampler)?;
                    if backend.is_eog(ctx, token) {
                        break;
                    }
                    let piece = backend.token_to_piece(ctx, token)?;
                    output.push_str(&piece);
                    backend.decode_batch(ctx, &[token])?;
                }
                Ok(output)
            })();
            backend.free_sampler(sampler);
            result
        })
        .await
        .map_err(|e| CoreError::new(ErrorKind::InferenceFailed, format!("worker task panicked: {e}")))?
    }
}
