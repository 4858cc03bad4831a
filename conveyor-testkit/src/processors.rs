use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use conveyor::{JobContext, JobId, Processor, ProcessorError};
use parking_lot::Mutex;

/// What a scripted call does after its delay.
#[derive(Clone, Debug)]
pub enum Outcome {
    Succeed(serde_json::Value),
    Retryable(String),
    Permanent(String),
    Panic(String),
}

#[derive(Clone, Debug)]
pub struct ProcessorCall {
    pub job_id: JobId,
    pub attempt: u32,
    pub started_at: Instant,
}

/// Processor that replays a script of outcomes and records every call.
///
/// Outcomes are consumed in order; once the script is empty every call
/// uses the fallback (success with `null` unless changed).
#[derive(Clone)]
pub struct ScriptedProcessor {
    inner: Arc<Inner>,
}

struct Inner {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<ProcessorCall>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Outcome::Succeed(serde_json::Value::Null)),
                delay: Mutex::new(Duration::ZERO),
                calls: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }),
        }
    }

    /// Every call ends with `outcome`.
    pub fn always(outcome: Outcome) -> Self {
        let processor = Self::new();
        *processor.inner.fallback.lock() = outcome;
        processor
    }

    pub fn then(self, outcome: Outcome) -> Self {
        self.inner.script.lock().push_back(outcome);
        self
    }

    /// Sleep this long inside every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock() = delay;
        self
    }

    pub fn calls(&self) -> Vec<ProcessorCall> {
        self.inner.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.inner.calls.lock().len()
    }

    pub fn calls_for(&self, job_id: JobId) -> Vec<ProcessorCall> {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|call| call.job_id == job_id)
            .cloned()
            .collect()
    }

    /// Highest number of calls that were running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_active.load(Ordering::SeqCst)
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(actual, expected, "Expected {expected} processor calls, got {actual}");
    }

    fn next_outcome(&self) -> Outcome {
        self.inner
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.inner.fallback.lock().clone())
    }
}

impl Default for ScriptedProcessor {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError> {
        self.inner.calls.lock().push(ProcessorCall {
            job_id: job.id,
            attempt: job.attempt,
            started_at: Instant::now(),
        });

        let running = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.inner.active);
        self.inner.max_active.fetch_max(running, Ordering::SeqCst);

        let delay = *self.inner.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match self.next_outcome() {
            Outcome::Succeed(value) => Ok(value),
            Outcome::Retryable(message) => Err(ProcessorError::retryable(message)),
            Outcome::Permanent(message) => Err(ProcessorError::permanent(message)),
            Outcome::Panic(message) => panic!("{message}"),
        }
    }
}
