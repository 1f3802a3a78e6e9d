//! Cancellation handle used at every suspension point named in the spec's
//! concurrency model: lane submission, rate-limiter waits, saga step and
//! compensation execution, the orchestrator's concurrency semaphore.
//!
//! Rust has no built-in equivalent of a Go `context.Context`; this is a
//! small, explicit stand-in: cancel-once, clonable, with an optional
//! deadline layered on top via `child_with_timeout`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

struct Inner {
    notify: Notify,
    cancelled: std::sync::atomic::AtomicBool,
    deadline: Option<Instant>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                notify: Notify::new(),
                cancelled: std::sync::atomic::AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                notify: Notify::new(),
                cancelled: std::sync::atomic::AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// A derived token that is cancelled when either the parent is
    /// cancelled or `timeout` elapses, whichever comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> CancelToken {
        let child = CancelToken::with_timeout(timeout);
        let parent = self.clone();
        let child_clone = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            child_clone.cancel();
        });
        child
    }

    pub fn cancel(&self) {
        self.inner
            .cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
            return true;
        }
        match self.inner.deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        }
    }

    /// Resolves once this token is cancelled or its deadline elapses.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.inner.notify.notified() => {},
                    _ = tokio::time::sleep_until(deadline) => {},
                }
            }
            None => self.inner.notify.notified().await,
        }
    }
}
