//! Shared reference-counted backend-initialization guard (spec §4.7.5, §9).
//!
//! The first Worker to exist acquires the global runtime backend; the last
//! to shut down releases it. Acquire/release must be idempotent and
//! re-entrant under concurrent calls, so the refcount lives behind a mutex
//! rather than a bare atomic — `init`/`teardown` themselves are not
//! guaranteed re-entrant by the backend.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::CoreResult;
use crate::workers::runtime::BackendRuntime;

struct GuardState {
    refcount: u64,
}

/// A handle to the process-wide backend. Clone it into every Worker that
/// needs the backend alive; dropping the last clone tears it down.
pub struct BackendGuard {
    backend: Arc<dyn BackendRuntime>,
    state: Arc<Mutex<GuardState>>,
}

impl Clone for BackendGuard {
    fn clone(&self) -> Self {
        let mut state = self.state.lock().unwrap();
        state.refcount += 1;
        debug!(refcount = state.refcount, "backend guard cloned");
        Self {
            backend: self.backend.clone(),
            state: self.state.clone(),
        }
    }
}

impl BackendGuard {
    /// Acquires the backend, calling `init` only on the first acquisition.
    pub fn acquire(backend: Arc<dyn BackendRuntime>) -> CoreResult<Self> {
        backend.init()?;
        debug!("backend acquired, refcount=1");
        Ok(Self {
            backend,
            state: Arc::new(Mutex::new(GuardState { refcount: 1 })),
        })
    }

    pub fn backend(&self) -> &Arc<dyn BackendRuntime> {
        &self.backend
    }
}

impl Drop for BackendGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.refcount = state.refcount.saturating_sub(1);
        if state.refcount == 0 {
            debug!("last backend guard dropped, tearing down");
            self.backend.teardown();
        } else {
            debug!(refcount = state.refcount, "backend guard dropped, others remain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::runtime::tests::FakeBackend;

    #[test]
    fn teardown_only_happens_once_last_clone_drops() {
        let backend: Arc<dyn BackendRuntime> = Arc::new(FakeBackend::default());
        let a = BackendGuard::acquire(backend).unwrap();
        let b = a.clone();
        drop(a);
        // `b` still holds a reference; dropping it releases the last one.
        drop(b);
    }
}
