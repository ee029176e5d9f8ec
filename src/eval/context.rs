use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use super::evaluator::{EvalError, EvalResult};
use super::governor::{CancelSignal, RateLimiter, DEFAULT_MAX_ELEMENTS};
use super::operators::repeat_len;
use super::value::Value;

const YIELD_INTERVAL: u64 = 512;
const CHUNK: usize = YIELD_INTERVAL as usize;

/// Per-run state: cancellation, cycle accounting and rate limiting.
///
/// One context exists per top-level run; tasks spawned by that run share it.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: Uuid,
    cancel: CancelSignal,
    cycles: Arc<AtomicU64>,
    limiter: RateLimiter,
    max_elements: usize,
}

impl ExecutionContext {
    pub fn new(cancel: CancelSignal, limiter: RateLimiter, cycles: Arc<AtomicU64>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel,
            cycles,
            limiter,
            max_elements: DEFAULT_MAX_ELEMENTS,
        }
    }

    pub fn with_max_elements(mut self, max_elements: usize) -> Self {
        self.max_elements = max_elements;
        self
    }

    /// Unlimited context with its own counter, for tests and host-side helpers.
    pub fn detached(cancel: CancelSignal) -> Self {
        Self::new(cancel, RateLimiter::unlimited(), Arc::new(AtomicU64::new(0)))
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn check_cancelled(&self) -> EvalResult<()> {
        if self.cancel.is_cancelled() {
            debug!(run_id = %self.run_id, "cancellation observed");
            return Err(EvalError::Interrupt);
        }
        Ok(())
    }

    /// Cancellation check plus one accounted cycle. Runs before every statement
    /// and at the top of every loop iteration.
    pub async fn checkpoint(&self) -> EvalResult<()> {
        self.check_cancelled()?;
        self.step().await
    }

    /// Account one cycle, pausing when the rate limit is exceeded. Every
    /// `YIELD_INTERVAL` cycles the task yields so sibling tasks and the
    /// canceller get to run on a single-threaded runtime.
    pub async fn step(&self) -> EvalResult<()> {
        let count = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        if count % YIELD_INTERVAL == 0 {
            tokio::task::yield_now().await;
        }
        self.limiter.tick(&self.cancel).await
    }

    pub fn check_len(&self, len: usize) -> EvalResult<()> {
        if self.max_elements > 0 && len > self.max_elements {
            return Err(EvalError::InvalidOperation(format!(
                "result of {} elements exceeds the limit of {}",
                len, self.max_elements
            )));
        }
        Ok(())
    }

    // 大きな結果を作る途中の checkpoint。チャンク分のサイクルを計上する
    async fn pulse(&self) -> EvalResult<()> {
        self.check_cancelled()?;
        self.cycles.fetch_add(YIELD_INTERVAL, Ordering::Relaxed);
        tokio::task::yield_now().await;
        self.limiter.tick(&self.cancel).await
    }

    /// Produce `len` values, observing cancellation between chunks.
    pub async fn build<F>(&self, len: usize, mut item: F) -> EvalResult<Vec<Value>>
    where
        F: FnMut(usize) -> EvalResult<Value> + Send,
    {
        self.check_len(len)?;
        let mut items = Vec::with_capacity(len.min(DEFAULT_MAX_ELEMENTS));
        for index in 0..len {
            if index > 0 && index % CHUNK == 0 {
                self.pulse().await?;
            }
            items.push(item(index)?);
        }
        Ok(items)
    }

    /// `text` repeated `count` times, bounded by the element ceiling.
    pub async fn repeat(&self, text: &str, count: i64) -> EvalResult<Value> {
        let len = repeat_len(text, count)?;
        self.check_len(len)?;
        if len == 0 {
            return Ok(Value::String(String::new()));
        }
        let mut repeated = String::with_capacity(len.min(DEFAULT_MAX_ELEMENTS));
        for index in 0..count {
            if index > 0 && index as usize % CHUNK == 0 {
                self.pulse().await?;
            }
            repeated.push_str(text);
        }
        Ok(Value::String(repeated))
    }
}
