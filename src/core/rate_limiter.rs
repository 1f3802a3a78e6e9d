//! Rate limiters for per-lane admission pacing (spec.md §4.1).

use crate::errors::{EngineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

const POLL_TICK: Duration = Duration::from_millis(10);

/// Token bucket: refills continuously at `rate` tokens/sec up to
/// `capacity`, `Allow` consumes one token non-blocking, `Wait` polls until
/// a token is available or the deadline passes.
pub struct TokenBucket {
    rate: Mutex<f64>,
    capacity: Mutex<f64>,
    tokens: Mutex<f64>,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate: Mutex::new(rate),
            capacity: Mutex::new(capacity),
            tokens: Mutex::new(capacity),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    fn refill(&self) {
        let rate = *self.rate.lock().unwrap();
        let capacity = *self.capacity.lock().unwrap();
        let mut last = self.last_refill.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(*last).as_secs_f64();
        *last = now;
        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens + rate * elapsed).min(capacity);
    }

    /// Non-blocking: succeeds iff at least one token is available.
    pub fn allow(&self) -> bool {
        self.refill();
        let mut tokens = self.tokens.lock().unwrap();
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Blocks (polling every 10ms) until a token is available or
    /// `deadline` passes.
    pub async fn wait(&self, deadline: Option<Instant>) -> Result<()> {
        loop {
            if self.allow() {
                return Ok(());
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(EngineError::Canceled("rate limiter wait timed out".into()));
                }
            }
            tokio::time::sleep(POLL_TICK).await;
        }
    }

    pub fn set_rate(&self, rate: f64) {
        *self.rate.lock().unwrap() = rate;
    }

    /// Clamps current token count down to the new capacity on shrink.
    pub fn set_capacity(&self, capacity: f64) {
        *self.capacity.lock().unwrap() = capacity;
        let mut tokens = self.tokens.lock().unwrap();
        if *tokens > capacity {
            *tokens = capacity;
        }
    }
}

/// Leaky bucket: a bounded queue of unit slots drained at a fixed rate by
/// a background task. `Allow` reserves a slot if room exists; `Wait`
/// blocks until a slot frees up.
pub struct LeakyBucket {
    capacity: usize,
    used: AsyncMutex<usize>,
    notify: tokio::sync::Notify,
    stopped: AtomicBool,
    drainer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LeakyBucket {
    pub fn new(rate: f64, capacity: usize) -> std::sync::Arc<Self> {
        let bucket = std::sync::Arc::new(Self {
            capacity,
            used: AsyncMutex::new(0),
            notify: tokio::sync::Notify::new(),
            stopped: AtomicBool::new(false),
            drainer: Mutex::new(None),
        });

        let interval = if rate > 0.0 {
            Duration::from_secs_f64(1.0 / rate)
        } else {
            Duration::from_millis(1)
        };

        let weak = std::sync::Arc::downgrade(&bucket);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(b) => {
                        if b.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        let mut used = b.used.lock().await;
                        if *used > 0 {
                            *used -= 1;
                            b.notify.notify_waiters();
                        }
                    }
                    None => break,
                }
            }
        });
        *bucket.drainer.lock().unwrap() = Some(handle);
        bucket
    }

    pub async fn allow(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let mut used = self.used.lock().await;
        if *used < self.capacity {
            *used += 1;
            true
        } else {
            false
        }
    }

    pub async fn wait(&self) -> Result<()> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(EngineError::Canceled("leaky bucket stopped".into()));
            }
            if self.allow().await {
                return Ok(());
            }
            self.notify.notified().await;
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        if let Some(handle) = self.drainer.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_allows_up_to_capacity_then_blocks() {
        let bucket = TokenBucket::new(0.0, 2.0);
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let bucket = TokenBucket::new(1000.0, 1.0);
        assert!(bucket.allow());
        assert!(!bucket.allow());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(bucket.allow());
    }

    #[tokio::test]
    async fn token_bucket_wait_times_out() {
        let bucket = TokenBucket::new(0.0, 0.0);
        let deadline = Instant::now() + Duration::from_millis(30);
        let result = bucket.wait(Some(deadline)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn leaky_bucket_rejects_when_full() {
        let bucket = LeakyBucket::new(1.0, 1);
        assert!(bucket.allow().await);
        assert!(!bucket.allow().await);
        bucket.stop();
    }

    #[tokio::test]
    async fn leaky_bucket_wait_fails_after_stop() {
        let bucket = LeakyBucket::new(1.0, 1);
        bucket.stop();
        assert!(bucket.wait().await.is_err());
    }
}
