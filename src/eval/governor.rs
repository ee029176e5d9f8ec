//! Resource governance: cancellation, rate limiting and the live-scope ceiling.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::evaluator::{EvalError, EvalResult};

pub const DEFAULT_MAX_SCOPES: usize = 1000;
/// Largest sequence or string a single builtin or operator may produce.
pub const DEFAULT_MAX_ELEMENTS: usize = 10_000_000;

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
    deadline: Option<Instant>,
}

/// Cooperative cancellation signal, triggered manually or by a deadline.
///
/// Clones share the same signal. The evaluator observes it at checkpoints and
/// blocking operations wake on it.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                deadline: Some(deadline),
                ..Default::default()
            }),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.inner.deadline, Some(deadline) if Instant::now() >= deadline)
    }

    /// Resolves once the signal is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            match self.inner.deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = sleep_until(deadline) => return,
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Counts live scopes against a ceiling. Zero disables the ceiling.
#[derive(Debug)]
pub struct Governor {
    live: AtomicUsize,
    peak: AtomicUsize,
    limit: usize,
}

impl Default for Governor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SCOPES)
    }
}

impl Governor {
    pub fn new(limit: usize) -> Self {
        Self {
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn acquire(&self) -> EvalResult<()> {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        if self.limit > 0 && live > self.limit {
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!(limit = self.limit, "scope ceiling reached");
            return Err(EvalError::ScopeLimit { limit: self.limit });
        }
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(())
    }

    pub fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u64,
}

/// Caps cycles per time window by pausing once the cap is exceeded.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u64,
    window: Duration,
    state: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(Window {
                started: Instant::now(),
                count: 0,
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, Duration::from_secs(1))
    }

    pub fn is_limited(&self) -> bool {
        self.limit > 0 && !self.window.is_zero()
    }

    /// Account one cycle, sleeping until the window rolls over when the cap is exceeded.
    pub async fn tick(&self, cancel: &CancelSignal) -> EvalResult<()> {
        if !self.is_limited() {
            return Ok(());
        }
        let pause_until = {
            let mut window = self.state.lock();
            let now = Instant::now();
            if now.duration_since(window.started) >= self.window {
                window.started = now;
                window.count = 0;
            }
            window.count += 1;
            (window.count > self.limit).then(|| window.started + self.window)
        };
        if let Some(until) = pause_until {
            debug!(limit = self.limit, "rate limit reached, pausing");
            tokio::select! {
                _ = sleep_until(until) => {}
                _ = cancel.cancelled() => return Err(EvalError::Interrupt),
            }
        }
        Ok(())
    }
}
