//! Durable job storage.
//!
//! Every method is one atomic transition. Transitions out of `active`
//! are conditional on the caller still holding the job's lease.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetentionPolicy;
use crate::job::{JobId, JobRecord, QueueName};
use crate::lease::JobLease;
use crate::queue::QueueStats;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryJobStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisJobStore;

/// Result of a lease-guarded transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Transition {
    /// The transition was applied; `pruned` terminal jobs were deleted by retention.
    Applied { pruned: usize },
    /// The lease was no longer current, nothing changed.
    LeaseLost,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

/// Jobs touched by one stall sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StallReport {
    pub requeued: Vec<JobId>,
    pub failed: Vec<JobId>,
}

impl StallReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Copy of a terminally failed job kept for inspection and replay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: JobRecord,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_failed(job: &JobRecord) -> Self {
        Self {
            job: job.clone(),
            error: job.last_error.clone().unwrap_or_default(),
            failed_at: job.failed_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Storage backend for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `waiting` job.
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()>;

    /// Move the oldest waiting job of `queue` to `active`, waiting up to
    /// `wait` for one to arrive.
    async fn claim(
        &self,
        queue: QueueName,
        worker_id: &str,
        wait: Duration,
    ) -> anyhow::Result<Option<JobLease>>;

    /// Refresh the lease's heartbeat. `false` once the lease is lost.
    async fn heartbeat(&self, lease: &JobLease) -> anyhow::Result<bool>;

    async fn complete(
        &self,
        lease: &JobLease,
        result: serde_json::Value,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<Transition>;

    /// Park the job in `delayed` until `next_attempt_at`.
    async fn retry(
        &self,
        lease: &JobLease,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> anyhow::Result<Transition>;

    /// Terminal failure; also appends a dead letter.
    async fn fail(
        &self,
        lease: &JobLease,
        error: &str,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<Transition>;

    /// Move due `delayed` jobs back to `waiting`. Returns how many moved.
    async fn promote_delayed(&self, queue: QueueName, now: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Reclaim active jobs whose last heartbeat is older than `stalled_before`.
    async fn recover_stalled(
        &self,
        queue: QueueName,
        stalled_before: DateTime<Utc>,
        retention: &RetentionPolicy,
    ) -> anyhow::Result<StallReport>;

    async fn counts(&self, queue: QueueName) -> anyhow::Result<QueueStats>;

    async fn job(&self, id: JobId) -> anyhow::Result<Option<JobRecord>>;

    /// Newest first.
    async fn dead_letters(&self, queue: QueueName, limit: usize) -> anyhow::Result<Vec<DeadLetter>>;

    async fn dead_letter(&self, queue: QueueName, id: JobId) -> anyhow::Result<Option<DeadLetter>>;

    /// Atomically remove dead letter `id` and insert `replacement` as waiting.
    /// `false` if the dead letter no longer exists.
    async fn replay_dead_letter(
        &self,
        queue: QueueName,
        id: JobId,
        replacement: JobRecord,
    ) -> anyhow::Result<bool>;

    /// Drop anything held on behalf of `worker_id`. Called once the worker
    /// has stopped claiming.
    async fn release_worker(&self, _worker_id: &str) {}
}
