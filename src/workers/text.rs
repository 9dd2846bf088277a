//! Text/Streaming Worker (C7.1, spec §4.7.1).

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::instrument;

use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::handle::ContextHandle;
use crate::workers::guard::BackendGuard;
use crate::workers::runtime::{ContextInitParams, ModelInitParams, RawSampler, SamplerInitParams};

/// Sampler-chain parameters supplied by the caller (spec §6).
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub max_tokens: i32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub stop_sequences: Vec<String>,
    pub grammar_str: Option<String>,
    pub grammar_root: Option<String>,
    pub confidence_threshold: f32,
    /// Gate for the ambiguous stop-sequence behavior noted in spec §9(b):
    /// off by default since the source this spec was distilled from never
    /// wired matching into the generation loop.
    pub match_stop_sequences: bool,
}

impl GenerationParams {
    fn sampler_params(&self) -> SamplerInitParams {
        SamplerInitParams {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
        }
    }
}

/// Result of one pull from a [`StreamSession`].
#[derive(Debug, Clone, PartialEq)]
pub enum PullResult {
    Piece(String),
    /// Natural stop (end-of-generation token, max_tokens, or a matched stop
    /// sequence). Never represented as a `CoreError` — §7's propagation
    /// policy treats it as a normal terminal condition.
    Ended,
    Cancelled,
}

#[derive(Debug, Default, Clone, Copy)]
struct ConfidenceState {
    sum: f64,
    count: u32,
    last: f32,
}

impl ConfidenceState {
    fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }
}

/// Owned by a single streaming invocation; destroyed on completion or
/// cancellation. Holds the receiving half of a channel fed by the blocking
/// generation loop running on a dedicated thread.
pub struct StreamSession {
    receiver: mpsc::Receiver<PullResult>,
    cancel_flag: Arc<AtomicBool>,
    confidence: Arc<Mutex<ConfidenceState>>,
    confidence_threshold: f32,
    /// Held for the session's lifetime so the handle stays exclusively
    /// invoked until this session is dropped; released automatically then.
    _permit: OwnedMutexGuard<()>,
}

impl StreamSession {
    pub async fn pull(&mut self) -> PullResult {
        self.receiver.recv().await.unwrap_or(PullResult::Ended)
    }

    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn last_confidence(&self) -> Option<f32> {
        let state = self.confidence.lock().unwrap();
        if state.count == 0 {
            None
        } else {
            Some(state.last)
        }
    }

    pub fn avg_confidence(&self) -> f32 {
        self.confidence.lock().unwrap().mean()
    }

    pub fn confidence_count(&self) -> u32 {
        self.confidence.lock().unwrap().count
    }

    /// `true` once the running mean has dropped below the caller's
    /// threshold for at least 3 samples — an advisory bit only, it never
    /// alters generation (spec §4.7.1).
    pub fn handoff_signal(&self) -> bool {
        if self.confidence_threshold <= 0.0 {
            return false;
        }
        let state = self.confidence.lock().unwrap();
        state.count >= 3 && state.mean() < self.confidence_threshold
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }
}

/// Lets a host consumer drive a session with `StreamExt` combinators
/// (`.next()`, `.take_while()`, ...) instead of only the bespoke `pull()`
/// method. Ends the stream when the channel closes; unlike `pull()` it does
/// not surface `PullResult::Ended`/`Cancelled` as a final item.
impl Stream for StreamSession {
    type Item = PullResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Numerically stable softmax over `logits` followed by Shannon entropy,
/// normalized to `1 - H/ln(vocab)` (spec §4.7.1). Uniform logits yield
/// confidence 0 within 1e-6 since a uniform distribution has maximal
/// entropy.
pub fn softmax_confidence(logits: &[f32]) -> f32 {
    if logits.len() < 2 {
        return 1.0;
    }
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f64> = logits.iter().map(|&l| ((l - max) as f64).exp()).collect();
    let sum: f64 = exps.iter().sum();
    if sum <= 0.0 {
        return 0.0;
    }
    let probs: Vec<f64> = exps.iter().map(|&e| e / sum).collect();
    let entropy: f64 = probs.iter().filter(|&&p| p > 1e-10).map(|&p| -p * p.ln()).sum();
    let ln_vocab = (logits.len() as f64).ln();
    if ln_vocab <= 0.0 {
        return 1.0;
    }
    (1.0 - entropy / ln_vocab).clamp(0.0, 1.0) as f32
}

/// Owns one `ContextHandle`. Serializes callers via an async mutex: a
/// second invocation arriving while one is in flight is rejected with
/// `Busy` rather than queued (spec §4.7.1, §4.7.5).
pub struct TextWorker {
    handle: ContextHandle,
    _guard: BackendGuard,
    call_lock: Arc<AsyncMutex<()>>,
    batch_size: u32,
}

impl TextWorker {
    pub fn new(handle: ContextHandle, guard: BackendGuard, batch_size: u32) -> Self {
        Self { handle, _guard: guard, call_lock: Arc::new(AsyncMutex::new(())), batch_size }
    }

    #[instrument(skip(self, params), fields(handle_id = self.handle.id()))]
    pub async fn generate(&self, prompt: &str, params: &GenerationParams) -> CoreResult<String> {
        let _permit = self
            .call_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| CoreError::busy(format!("handle {} already has an invocation in flight", self.handle.id())))?;

        let backend = self.handle.backend().clone();
        let ctx = self.handle.raw_context();
        let prompt = prompt.to_string();
        let params = params.clone();
        let batch_size = self.batch_size;

        tokio::task::spawn_blocking(move || {
            backend.clear_kv(ctx);
            let tokens = backend.tokenize(ctx, &prompt)?;
            for chunk in tokens.chunks(batch_size.max(1) as usize) {
                backend.decode_batch(ctx, chunk)?;
            }
            let sampler = backend.create_sampler(&params.sampler_params())?;
            let result = run_generation_loop(&*backend, ctx, sampler, &params, None);
            backend.free_sampler(sampler);
            result
        })
        .await
        .map_err(|e| CoreError::new(ErrorKind::InferenceFailed, format!("worker task panicked: {e}")))?
    }

    #[instrument(skip(self, params), fields(handle_id = self.handle.id()))]
    pub async fn stream(&self, prompt: &str, params: &GenerationParams) -> CoreResult<StreamSession> {
        let permit = self
            .call_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| CoreError::busy(format!("handle {} already has an invocation in flight", self.handle.id())))?;

        let backend = self.handle.backend().clone();
        let ctx = self.handle.raw_context();
        let prompt = prompt.to_string();
        let params = params.clone();
        let batch_size = self.batch_size;

        let (tx, rx) = mpsc::channel(32);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let confidence = Arc::new(Mutex::new(ConfidenceState::default()));

        let thread_cancel = cancel_flag.clone();
        let thread_confidence = confidence.clone();
        std::thread::spawn(move || {
            backend.clear_kv(ctx);
            let tokens = match backend.tokenize(ctx, &prompt) {
                Ok(t) => t,
                Err(_) => {
                    let _ = tx.blocking_send(PullResult::Ended);
                    return;
                }
            };
            for chunk in tokens.chunks(batch_size.max(1) as usize) {
                if backend.decode_batch(ctx, chunk).is_err() {
                    let _ = tx.blocking_send(PullResult::Ended);
                    return;
                }
            }
            let sampler = match backend.create_sampler(&params.sampler_params()) {
                Ok(s) => s,
                Err(_) => {
                    let _ = tx.blocking_send(PullResult::Ended);
                    return;
                }
            };
            stream_generation_loop(&*backend, ctx, sampler, &params, &thread_cancel, &thread_confidence, &tx);
            backend.free_sampler(sampler);
        });

        Ok(StreamSession {
            receiver: rx,
            cancel_flag,
            confidence,
            confidence_threshold: params.confidence_threshold,
            _permit: permit,
        })
    }
}

fn run_generation_loop(
    backend: &dyn crate::workers::runtime::BackendRuntime,
    ctx: crate::workers::runtime::RawContext,
    sampler: RawSampler,
    params: &GenerationParams,
    cancel_flag: Option<&AtomicBool>,
) -> CoreResult<String> {
    let mut output = String::new();
    let max_tokens = if params.max_tokens > 0 { params.max_tokens } else { i32::MAX };
    for _ in 0..max_tokens {
        if let Some(flag) = cancel_flag {
            if flag.load(Ordering::SeqCst) {
                return Err(CoreError::cancelled("generation cancelled"));
            }
        }
        let token = backend.sample(ctx, sampler)?;
        if backend.is_eog(ctx, token) {
            break;
        }
        let piece = backend.token_to_piece(ctx, token)?;
        output.push_str(&piece);
        // Feed the sampled token back through the decoder to keep the KV
        // cache consistent, even for zero-length pieces (spec §6).
        backend.decode_batch(ctx, &[token])?;
        if params.match_stop_sequences && matches_any_stop_sequence(&output, &params.stop_sequences) {
            break;
        }
    }
    Ok(output)
}

#[allow(clippy::too_many_arguments)]
fn stream_generation_loop(
    backend: &dyn crate::workers::runtime::BackendRuntime,
    ctx: crate::workers::runtime::RawContext,
    sampler: RawSampler,
    params: &GenerationParams,
    cancel_flag: &AtomicBool,
    confidence: &Mutex<ConfidenceState>,
    tx: &mpsc::Sender<PullResult>,
) {
    let mut output_tail = String::new();
    let max_tokens = if params.max_tokens > 0 { params.max_tokens } else { i32::MAX };
    for _ in 0..max_tokens {
        if cancel_flag.load(Ordering::SeqCst) {
            let _ = tx.blocking_send(PullResult::Cancelled);
            return;
        }
        let token = match backend.sample(ctx, sampler) {
            Ok(t) => t,
            Err(_) => {
                let _ = tx.blocking_send(PullResult::Ended);
                return;
            }
        };
        if cancel_flag.load(Ordering::SeqCst) {
            let _ = tx.blocking_send(PullResult::Cancelled);
            return;
        }
        if backend.is_eog(ctx, token) {
            let _ = tx.blocking_send(PullResult::Ended);
            return;
        }
        let piece = match backend.token_to_piece(ctx, token) {
            Ok(p) => p,
            Err(_) => {
                let _ = tx.blocking_send(PullResult::Ended);
                return;
            }
        };
        if backend.decode_batch(ctx, &[token]).is_err() {
            let _ = tx.blocking_send(PullResult::Ended);
            return;
        }

        if params.confidence_threshold > 0.0 {
            if let Ok(logits) = backend.logits(ctx) {
                let c = softmax_confidence(&logits);
                let mut state = confidence.lock().unwrap();
                state.sum += c as f64;
                state.count += 1;
                state.last = c;
            }
        }

        output_tail.push_str(&piece);
        if output_tail.len() > 256 {
            let drain_to = output_tail.len() - 256;
            output_tail.drain(..drain_to);
        }
        if params.match_stop_sequences && matches_any_stop_sequence(&output_tail, &params.stop_sequences) {
            let _ = tx.blocking_send(PullResult::Piece(piece));
            let _ = tx.blocking_send(PullResult::Ended);
            return;
        }
        if tx.blocking_send(PullResult::Piece(piece)).is_err() {
            return;
        }
    }
    let _ = tx.blocking_send(PullResult::Ended);
}

fn matches_any_stop_sequence(tail: &str, stop_sequences: &[String]) -> bool {
    stop_sequences.iter().any(|s| !s.is_empty() && tail.ends_with(s.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::runtime::tests::FakeBackend;
    use crate::workers::runtime::{BackendRuntime, FfiBackendRuntime};
    use std::sync::Arc as StdArc;

    fn fake_worker() -> TextWorker {
        let backend: StdArc<dyn BackendRuntime> = StdArc::new(FakeBackend::default());
        let guard = BackendGuard::acquire(backend.clone()).unwrap();
        let model = backend.load_model("fake.gguf", &ModelInitParams::default()).unwrap();
        let ctx = backend.create_context(model, &ContextInitParams::default()).unwrap();
        let handle = ContextHandle::new_text(0, 4096, model, ctx, backend);
        TextWorker::new(handle, guard, 512)
    }

    #[test]
    fn softmax_confidence_is_bounded_and_low_for_uniform_logits() {
        let uniform = vec![1.0f32; 32];
        let c = softmax_confidence(&uniform);
        assert!((0.0..=1.0).contains(&c));
        assert!(c < 1e-6);
    }

    #[test]
    fn softmax_confidence_is_high_for_peaked_logits() {
        let mut peaked = vec![0.0f32; 32];
        peaked[0] = 50.0;
        let c = softmax_confidence(&peaked);
        assert!(c > 0.9);
    }

    #[tokio::test]
    async fn generate_produces_text_and_stops_at_eog() {
        let worker = fake_worker();
        let params = GenerationParams { max_tokens: 64, ..Default::default() };
        let text = worker.generate("hello world", &params).await.unwrap();
        assert!(!text.is_empty());
    }

    #[tokio::test]
    async fn concurrent_generate_calls_reject_with_busy() {
        let worker = StdArc::new(fake_worker());
        let params = GenerationParams { max_tokens: 64, ..Default::default() };
        let w2 = worker.clone();
        let params2 = params.clone();
        let first = tokio::spawn(async move { w2.generate("first", &params2).await });
        // give the first call a chance to acquire the lock
        tokio::task::yield_now().await;
        let second = worker.generate("second", &params).await;
        let _ = first.await;
        assert!(matches!(second, Err(e) if e.kind == ErrorKind::InferenceFailed));
    }

    #[tokio::test]
    async fn cancellation_during_stream_scenario() {
        let worker = fake_worker();
        let params = GenerationParams { max_tokens: 100, ..Default::default() };
        let mut session = worker.stream("hello", &params).await.unwrap();
        let mut pulled = 0;
        loop {
            match session.pull().await {
                PullResult::Piece(_) => {
                    pulled += 1;
                    if pulled == 3 {
                        session.cancel();
                    }
                }
                PullResult::Ended | PullResult::Cancelled => break,
            }
        }
        assert!(pulled <= 6);
    }

    #[tokio::test]
    async fn stream_session_is_usable_through_stream_ext() {
        use futures::StreamExt;

        let worker = fake_worker();
        let params = GenerationParams { max_tokens: 64, ..Default::default() };
        let session = worker.stream("hello", &params).await.unwrap();
        let pieces: Vec<PullResult> = session.take(5).collect().await;
        assert!(!pieces.is_empty());
        assert!(pieces.iter().all(|p| matches!(p, PullResult::Piece(_))));
    }

    #[allow(dead_code)]
    fn ensure_ffi_runtime_compiles() -> FfiBackendRuntime {
        FfiBackendRuntime
    }
}
