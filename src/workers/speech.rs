//! Speech Worker (C7.4, spec §4.7.4).

use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::handle::ContextHandle;
use crate::workers::guard::BackendGuard;

/// One transcribed span, timestamps already converted to milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub text: String,
    pub start_ms: i64,
    pub end_ms: i64,
}

/// Sampler-chain-adjacent parameters accepted by transcription. The
/// backend's whisper extension takes no sampler chain of its own, but
/// callers still need to say how much of the audio to process.
#[derive(Debug, Clone, Default)]
pub struct TranscribeParams {
    pub language: Option<String>,
    pub translate: bool,
}

/// Full transcription result, per spec §4.7.4.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<Segment>,
    pub process_ms: f64,
}

/// Owns a whisper `ContextHandle`. Like the other Workers, one invocation
/// in flight at a time; a second caller is rejected with `Busy`.
pub struct SpeechWorker {
    handle: ContextHandle,
    _guard: BackendGuard,
    call_lock: AsyncMutex<()>,
}

impl SpeechWorker {
    pub fn new(handle: ContextHandle, guard: BackendGuard) -> Self {
        Self { handle, _guard: guard, call_lock: AsyncMutex::new(()) }
    }

    /// Transcribes 16kHz mono f32 PCM. Segment text is owned by this call —
    /// the backend's `whisper_segment_text` strings are copied out before
    /// this returns, so nothing here aliases runtime-owned memory once the
    /// call completes (spec §4.7.4: "zeroing the result releases them" —
    /// in Rust that's just letting the returned `Transcript` drop).
    #[instrument(skip(self, pcm, _params), fields(handle_id = self.handle.id(), n_samples = pcm.len()))]
    pub async fn transcribe(&self, pcm: &[f32], _params: &TranscribeParams) -> CoreResult<Transcript> {
        let _permit = self
            .call_lock
            .try_lock()
            .map_err(|_| CoreError::busy(format!("handle {} already has an invocation in flight", self.handle.id())))?;

        let backend = self.handle.backend().clone();
        let ctx = self.handle.raw_whisper_context();
        let pcm = pcm.to_vec();

        tokio::task::spawn_blocking(move || {
            let start = std::time::Instant::now();
            let count = backend.whisper_transcribe(ctx, &pcm)?;
            let mut segments = Vec::with_capacity(count);
            let mut text = String::new();
            for i in 0..count {
                let (seg_text, start_ms, end_ms) = backend.whisper_segment(ctx, i as i32);
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(&seg_text);
                segments.push(Segment { text: seg_text, start_ms, end_ms });
            }
            let process_ms = start.elapsed().as_secs_f64() * 1000.0;
            Ok(Transcript { text, segments, process_ms })
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

    fn fake_worker() -> SpeechWorker {
        let backend: Arc<dyn BackendRuntime> = Arc::new(FakeBackend::default());
        let guard = BackendGuard::acquire(backend.clone()).unwrap();
        let model = backend.load_model("fake.gguf", &ModelInitParams::default()).unwrap();
        let ctx = backend.whisper_init("fake.bin").unwrap();
        let handle = ContextHandle::new_speech(0, model, ctx, backend);
        SpeechWorker::new(handle, guard)
    }

    #[tokio::test]
    async fn transcribe_empty_pcm_yields_no_segments() {
        let worker = fake_worker();
        let transcript = worker.transcribe(&[], &TranscribeParams::default()).await.unwrap();
        assert!(transcript.segments.is_empty());
        assert!(transcript.text.is_empty());
    }

    #[tokio::test]
    async fn transcribe_reports_segment_timestamps_in_milliseconds() {
        let worker = fake_worker();
        let pcm = vec![0.0f32; 16_000];
        let transcript = worker.transcribe(&pcm, &TranscribeParams::default()).await.unwrap();
        assert_eq!(transcript.segments.len(), 1);
        // The trait contract already reports milliseconds — the real
        // `FfiBackendRuntime` impl does the centiseconds-to-ms multiply by
        // 10 internally (spec §4.7.4); `FakeBackend` reports ms directly.
        assert_eq!(transcript.segments[0].start_ms, 0);
        assert_eq!(transcript.segments[0].end_ms, 100);
        assert!(transcript.process_ms >= 0.0);
    }

    #[tokio::test]
    async fn concurrent_transcribe_calls_reject_with_busy() {
        let worker = Arc::new(fake_worker());
        let pcm = vec![0.0f32; 16_000];
        let w2 = worker.clone();
        let pcm2 = pcm.clone();
        let first = tokio::spawn(async move { w2.transcribe(&pcm2, &TranscribeParams::default()).await });
        tokio::task::yield_now().await;
        let second = worker.transcribe(&pcm, &TranscribeParams::default()).await;
        let _ = first.await;
        assert!(second.is_err());
    }
}
