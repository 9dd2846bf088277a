//! Closed error taxonomy for the runtime supervision core (spec §7).
//!
//! Every fallible operation in this crate returns `Result<T, CoreError>`.
//! `CoreError` pairs a closed [`ErrorKind`] with a free-text context string,
//! mirroring the backend runtime's "last-error storage per context" model:
//! the kind is what callers match on, the context is what gets logged.

use std::fmt;

/// The closed set of failure categories a caller can match on.
///
/// `StreamEnded` is listed here because the backend runtime reports it
/// through the same integer error-code channel as real failures, but it is
/// never surfaced as a `CoreError` to a streaming caller — `StreamSession`
/// turns it into `PullResult::Ended` instead. It stays in this enum purely
/// so `CoreError::from_backend_code` has somewhere to route it before the
/// worker strips it back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidParameter,
    OutOfMemory,
    ModelLoadFailed,
    BackendInitFailed,
    InferenceFailed,
    ContextInvalid,
    StreamEnded,
    NotImplemented,
    MemoryLimitExceeded,
    UnsupportedBackend,
    Cancelled,
    ContextOverflow,
    DownloadFailed,
    ChecksumMismatch,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::ModelLoadFailed => "model_load_failed",
            ErrorKind::BackendInitFailed => "backend_init_failed",
            ErrorKind::InferenceFailed => "inference_failed",
            ErrorKind::ContextInvalid => "context_invalid",
            ErrorKind::StreamEnded => "stream_ended",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::MemoryLimitExceeded => "memory_limit_exceeded",
            ErrorKind::UnsupportedBackend => "unsupported_backend",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ContextOverflow => "context_overflow",
            ErrorKind::DownloadFailed => "download_failed",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A failure surfaced by the core, carrying the kind callers match on and
/// the context a developer needs to diagnose it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {context}")]
pub struct CoreError {
    pub kind: ErrorKind,
    pub context: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
        }
    }

    /// Map a backend integer error code onto an `ErrorKind`, attaching the
    /// call-site context. Backend-specific code ranges are intentionally
    /// coarse; this crate does not attempt to enumerate every native error
    /// code, only the categories §7 requires callers to be able to match on.
    pub fn from_backend_code(code: i32, context: impl Into<String>) -> Self {
        let kind = match code {
            0 => ErrorKind::Unknown, // caller should not construct an error for success
            -1 => ErrorKind::InvalidParameter,
            -2 => ErrorKind::OutOfMemory,
            -3 => ErrorKind::ModelLoadFailed,
            -4 => ErrorKind::BackendInitFailed,
            -5 => ErrorKind::ContextInvalid,
            -6 => ErrorKind::StreamEnded,
            -7 => ErrorKind::ContextOverflow,
            -8 => ErrorKind::UnsupportedBackend,
            _ => ErrorKind::InferenceFailed,
        };
        Self::new(kind, context)
    }

    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, context)
    }

    /// A second invocation arrived while one was already in flight on the
    /// same `ContextHandle`. §7's closed kind list has no dedicated "busy"
    /// variant, so this is represented as `InferenceFailed` with a context
    /// string a caller can pattern-match on if they need to distinguish it
    /// (see DESIGN.md for the rationale).
    pub fn busy(context: impl Into<String>) -> Self {
        Self::new(ErrorKind::InferenceFailed, format!("busy: {}", context.into()))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
