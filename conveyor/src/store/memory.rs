use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DeadLetter, JobStore, StallReport, Transition};
use crate::config::RetentionPolicy;
use crate::job::{JobId, JobRecord, JobState, QueueName};
use crate::lease::{is_stalled, JobLease, LeaseId};
use crate::queue::QueueStats;

#[derive(Debug)]
struct ActiveEntry {
    lease_id: LeaseId,
    heartbeat_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    waiting: VecDeque<JobId>,
    active: HashMap<JobId, ActiveEntry>,
    delayed: BTreeSet<(DateTime<Utc>, JobId)>,
    /// Oldest first.
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    /// Newest first.
    dead: VecDeque<DeadLetter>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    queues: HashMap<QueueName, QueueState>,
}

impl Inner {
    fn queue(&mut self, name: QueueName) -> &mut QueueState {
        self.queues.entry(name).or_default()
    }

    /// Releases the lease and returns the job, or `None` if the lease is stale.
    fn release(&mut self, lease: &JobLease) -> Option<JobRecord> {
        let queue = self.queue(lease.queue());
        let held = matches!(
            queue.active.get(&lease.job_id()),
            Some(entry) if entry.lease_id == lease.lease_id
        );
        if !held {
            return None;
        }
        queue.active.remove(&lease.job_id());
        self.jobs.get(&lease.job_id()).cloned()
    }

    fn push_completed(&mut self, record: JobRecord, keep: usize) -> usize {
        let id = record.id;
        let queue_name = record.queue;
        self.jobs.insert(id, record);
        let queue = self.queue(queue_name);
        queue.completed.push_back(id);
        let excess: Vec<JobId> = drain_excess(&mut queue.completed, keep);
        for pruned in &excess {
            self.jobs.remove(pruned);
        }
        excess.len()
    }

    fn push_failed(&mut self, record: JobRecord, retention: &RetentionPolicy) -> usize {
        let id = record.id;
        let queue_name = record.queue;
        let dead = DeadLetter::from_failed(&record);
        self.jobs.insert(id, record);
        let queue = self.queue(queue_name);
        queue.failed.push_back(id);
        if retention.keep_dead_letters > 0 {
            queue.dead.push_front(dead);
            queue.dead.truncate(retention.keep_dead_letters);
        }
        let excess = drain_excess(&mut queue.failed, retention.keep_failed);
        for pruned in &excess {
            self.jobs.remove(pruned);
        }
        excess.len()
    }
}

fn drain_excess(ids: &mut VecDeque<JobId>, keep: usize) -> Vec<JobId> {
    let excess = ids.len().saturating_sub(keep);
    ids.drain(..excess).collect()
}

/// In-process job store.
///
/// All state sits behind one mutex, so every transition is atomic. Claims
/// park on a per-queue [`Notify`] instead of polling.
#[derive(Clone)]
pub struct MemoryJobStore {
    inner: Arc<Mutex<Inner>>,
    notifiers: Arc<HashMap<QueueName, Arc<Notify>>>,
}

impl std::fmt::Debug for MemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryJobStore")
            .field("jobs", &inner.jobs.len())
            .finish()
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        let notifiers = QueueName::ALL
            .into_iter()
            .map(|name| (name, Arc::new(Notify::new())))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notifiers: Arc::new(notifiers),
        }
    }

    fn notify(&self, queue: QueueName, count: usize) {
        if let Some(notify) = self.notifiers.get(&queue) {
            for _ in 0..count {
                notify.notify_one();
            }
        }
    }

    fn try_claim(&self, queue: QueueName, worker_id: &str) -> Option<JobLease> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        loop {
            let id = inner.queue(queue).waiting.pop_front()?;
            // ids of pruned jobs never sit in `waiting`, but skip defensively
            let Some(record) = inner.jobs.get_mut(&id) else {
                continue;
            };
            record.activate(now);
            let lease = JobLease::new(record.clone(), worker_id);
            inner.queue(queue).active.insert(
                id,
                ActiveEntry {
                    lease_id: lease.lease_id,
                    heartbeat_at: now,
                },
            );
            return Some(lease);
        }
    }

    /// Number of job records currently held, terminal ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()> {
        let queue = record.queue;
        {
            let mut inner = self.inner.lock();
            let id = record.id;
            anyhow::ensure!(!inner.jobs.contains_key(&id), "job {id} already exists");
            inner.jobs.insert(id, record);
            inner.queue(queue).waiting.push_back(id);
        }
        self.notify(queue, 1);
        Ok(())
    }

    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<JobLease>> {
        let deadline = Instant::now() + wait;
        let notify = self
            .notifiers
            .get(&queue)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no notifier for queue {queue}"))?;

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_claim(queue, worker_id) {
                return Ok(Some(lease));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn heartbeat(&self, lease: &JobLease) -> anyhow::Result<bool> {
        let mut inner = self.inner.lock();
        let queue = inner.queue(lease.queue());
        match queue.active.get_mut(&lease.job_id()) {
            Some(entry) if entry.lease_id == lease.lease_id => {
                entry.heartbeat_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(
        &self,
        lease: &JobLease,
        result: serde_json::Value,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<Transition> {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.release(lease) else {
            return Ok(Transition::LeaseLost);
        };
        record.mark_completed(result, Utc::now());
        let pruned = inner.push_completed(record, retention.keep_completed);
        Ok(Transition::Applied { pruned })
    }

    async fn retry(
        &self,
        lease: &JobLease,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> anyhow::Result<Transition> {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.release(lease) else {
            return Ok(Transition::LeaseLost);
        };
        record.mark_delayed(error, next_attempt_at);
        let id = record.id;
        inner.jobs.insert(id, record);
        inner
            .queue(lease.queue())
            .delayed
            .insert((next_attempt_at, id));
        Ok(Transition::Applied { pruned: 0 })
    }

    async fn fail(
        &self,
        lease: &JobLease,
        error: &str,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<Transition> {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.release(lease) else {
            return Ok(Transition::LeaseLost);
        };
        record.mark_failed(error, Utc::now());
        let pruned = inner.push_failed(record, retention);
        Ok(Transition::Applied { pruned })
    }

    async fn promote_delayed(&self, queue: QueueName, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let promoted = {
            let mut inner = self.inner.lock();
            let state = inner.queue(queue);
            let due: Vec<(DateTime<Utc>, JobId)> = state
                .delayed
                .iter()
                .take_while(|(at, _)| *at <= now)
                .copied()
                .collect();
            for entry in &due {
                state.delayed.remove(entry);
                state.waiting.push_back(entry.1);
            }
            for (_, id) in &due {
                if let Some(record) = inner.jobs.get_mut(id) {
                    record.promote();
                }
            }
            due.len()
        };
        self.notify(queue, promoted);
        Ok(promoted as u64)
    }

    async fn recover_stalled(
        &self,
        queue: QueueName,
        stalled_before: DateTime<Utc>,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<StallReport> {
        let mut report = StallReport::default();
        {
            let mut inner = self.inner.lock();
            let stalled: Vec<JobId> = inner
                .queue(queue)
                .active
                .iter()
                .filter(|(_, entry)| is_stalled(entry.heartbeat_at, stalled_before))
                .map(|(id, _)| *id)
                .collect();

            let now = Utc::now();
            for id in stalled {
                inner.queue(queue).active.remove(&id);
                let Some(mut record) = inner.jobs.get(&id).cloned() else {
                    continue;
                };
                match record.recover_from_stall(now) {
                    JobState::Failed => {
                        inner.push_failed(record, retention);
                        report.failed.push(id);
                    }
                    _ => {
                        inner.jobs.insert(id, record);
                        inner.queue(queue).waiting.push_back(id);
                        report.requeued.push(id);
                    }
                }
            }
        }
        self.notify(queue, report.requeued.len());
        Ok(report)
    }

    async fn counts(&self, queue: QueueName) -> anyhow::Result<QueueStats> {
        let mut inner = self.inner.lock();
        let state = inner.queue(queue);
        Ok(QueueStats {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            delayed: state.delayed.len() as u64,
        })
    }

    async fn job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn dead_letters(&self, queue: QueueName, limit: usize) -> anyhow::Result<Vec<DeadLetter>> {
        let mut inner = self.inner.lock();
        Ok(inner.queue(queue).dead.iter().take(limit).cloned().collect())
    }

    async fn dead_letter(&self, queue: QueueName, id: JobId) -> anyhow::Result<Option<DeadLetter>> {
        let mut inner = self.inner.lock();
        Ok(inner
            .queue(queue)
            .dead
            .iter()
            .find(|dead| dead.job.id == id)
            .cloned())
    }

    async fn replay_dead_letter(
        &self,
        queue: QueueName,
        id: JobId,
        replacement: JobRecord,
    ) -> anyhow::Result<bool> {
        {
            let mut inner = self.inner.lock();
            let state = inner.queue(queue);
            let Some(position) = state.dead.iter().position(|dead| dead.job.id == id) else {
                return Ok(false);
            };
            state.dead.remove(position);
            let new_id = replacement.id;
            state.waiting.push_back(new_id);
            inner.jobs.insert(new_id, replacement);
        }
        self.notify(queue, 1);
        Ok(true)
    }
}
