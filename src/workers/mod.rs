//! Per-modality executors (C7, spec §4.7) plus their shared plumbing.

pub mod frame_queue;
pub mod guard;
pub mod image;
pub mod runtime;
pub mod speech;
pub mod text;
pub mod vision;

pub use guard::BackendGuard;
pub use image::{GeneratedImage, ImageWorker};
pub use speech::{Segment, SpeechWorker, TranscribeParams, Transcript};
pub use text::{GenerationParams, PullResult, StreamSession, TextWorker};
pub use vision::VisionWorker;
