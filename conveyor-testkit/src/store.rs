use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use conveyor::{
    DeadLetter, JobId, JobLease, JobRecord, JobStore, MemoryJobStore, QueueName, QueueStats,
    RetentionPolicy, StallReport, Transition,
};

/// Store wrapper whose availability can be switched off.
///
/// While offline every call fails without reaching the inner store.
#[derive(Clone)]
pub struct OutageStore {
    inner: Arc<dyn JobStore>,
    online: Arc<AtomicBool>,
    rejected: Arc<AtomicUsize>,
    released: Arc<Mutex<Vec<String>>>,
}

impl OutageStore {
    pub fn new(inner: Arc<dyn JobStore>) -> Self {
        Self {
            inner,
            online: Arc::new(AtomicBool::new(true)),
            rejected: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryJobStore::new()))
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Calls refused while offline.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Worker ids passed to `release_worker`, in call order.
    pub fn released_workers(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.online.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.rejected.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("connection refused: store offline")
    }
}

#[async_trait]
impl JobStore for OutageStore {
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()> {
        self.check()?;
        self.inner.insert(record).await
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<JobLease>> {
        self.check()?;
        self.inner.claim(queue, worker_id, wait).await
    }

    async fn heartbeat(&self, lease: &JobLease) -> anyhow::Result<bool> {
        self.check()?;
        self.inner.heartbeat(lease).await
    }

    async fn complete(
        &self,
        lease: &JobLease,
        result: serde_json::Value,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<Transition> {
        self.check()?;
        self.inner.complete(lease, result, retention).await
    }

    async fn retry(
        &self,
        lease: &JobLease,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> anyhow::Result<Transition> {
        self.check()?;
        self.inner.retry(lease, error, next_attempt_at).await
    }

    async fn fail(
        &self,
        lease: &JobLease,
        error: &str,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<Transition> {
        self.check()?;
        self.inner.fail(lease, error, retention).await
    }

    async fn promote_delayed(&self, queue: QueueName, now: DateTime<Utc>) -> anyhow::Result<u64> {
        self.check()?;
        self.inner.promote_delayed(queue, now).await
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        stalled_before: DateTime<Utc>,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<StallReport> {
        self.check()?;
        self.inner.recover_stalled(queue, stalled_before, retention).await
    }

    async fn counts(&self, queue: QueueName) -> anyhow::Result<QueueStats> {
        self.check()?;
        self.inner.counts(queue).await
    }

    async fn job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        self.check()?;
        self.inner.job(id).await
    }

    async fn dead_letters(&self, queue: QueueName, limit: usize) -> anyhow::Result<Vec<DeadLetter>> {
        self.check()?;
        self.inner.dead_letters(queue, limit).await
    }

    async fn dead_letter(&self, queue: QueueName, id: JobId) -> anyhow::Result<Option<DeadLetter>> {
        self.check()?;
        self.inner.dead_letter(queue, id).await
    }

    async fn replay_dead_letter(
        &self,
        queue: QueueName,
        id: JobId,
        replacement: JobRecord,
    ) -> anyhow::Result<bool> {
        self.check()?;
        self.inner.replay_dead_letter(queue, id, replacement).await
    }

    async fn release_worker(&self, worker_id: &str) {
        self.released.lock().push(worker_id.to_string());
        self.inner.release_worker(worker_id).await;
    }
}
