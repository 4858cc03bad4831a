use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobId, QueueName};
use crate::lease::LeaseId;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub job_id: JobId,
    pub queue: QueueName,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(job_id: JobId, queue: QueueName) -> Self {
        Self {
            version: 1,
            job_id,
            queue,
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(job_id: JobId, queue: QueueName, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(job_id, queue),
            payload,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.meta.job_id
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    Enqueued {
        job_type: String,
    },
    Started {
        lease_id: LeaseId,
        worker_id: String,
        attempt: u32,
    },
    Completed {
        attempt: u32,
        duration_ms: u64,
    },
    /// An attempt failed and the job was parked in `delayed`.
    RetryScheduled {
        attempt: u32,
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal failure; the job was also copied to the dead-letter list.
    Failed {
        attempt: u32,
        error: String,
        permanent: bool,
    },
    /// Stall recovery took the job away from its executor.
    Stalled {
        requeued: bool,
    },
    Replayed {
        original_job_id: JobId,
    },
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never blocks; a subscriber that falls behind by more than
/// `capacity` events receives `RecvError::Lagged`.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all subscribers. Dropped silently when nobody listens.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}
