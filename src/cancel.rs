use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stop signal handed to a background completion task when it is spawned.
///
/// The owning aggregate cancels it from `close()`; the task checks it before
/// every attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Returns `true` if this call did the transition.
    pub fn cancel(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
