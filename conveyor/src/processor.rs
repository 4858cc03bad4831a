use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ProcessorError;
use crate::job::{JobId, JobPayload, JobRecord, QueueName};

/// What a processor sees of the job it runs.
#[derive(Clone, Debug, Serialize)]
pub struct JobContext {
    pub id: JobId,
    pub queue: QueueName,
    pub job_type: String,
    pub payload: JobPayload,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    pub fn from_record(record: &JobRecord, attempt: u32) -> Self {
        Self {
            id: record.id,
            queue: record.queue,
            job_type: record.job_type.clone(),
            payload: record.payload.clone(),
            attempt,
            max_attempts: record.max_attempts,
        }
    }

    /// Error for a payload variant the processor does not handle.
    pub fn unexpected_payload(&self) -> ProcessorError {
        ProcessorError::permanent(format!(
            "{} processor received a {} payload",
            self.queue,
            self.payload.queue()
        ))
    }
}

/// Executes jobs of one queue.
///
/// Delivery is at-least-once, so implementations must tolerate running the
/// same job more than once.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError>;
}

/// Exactly one processor per queue.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<QueueName, Arc<dyn Processor>>,
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut queues: Vec<QueueName> = self.processors.keys().copied().collect();
        queues.sort();
        f.debug_struct("ProcessorRegistry")
            .field("queues", &queues)
            .finish()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `processor` for `queue`, replacing any previous one.
    pub fn register<P: Processor>(&mut self, queue: QueueName, processor: P) -> &mut Self {
        self.register_arc(queue, Arc::new(processor))
    }

    pub fn register_arc(&mut self, queue: QueueName, processor: Arc<dyn Processor>) -> &mut Self {
        if self.processors.insert(queue, processor).is_some() {
            tracing::warn!(queue = %queue, "replacing previously registered processor");
        }
        self
    }

    pub fn with<P: Processor>(mut self, queue: QueueName, processor: P) -> Self {
        self.register(queue, processor);
        self
    }

    pub fn get(&self, queue: QueueName) -> Option<Arc<dyn Processor>> {
        self.processors.get(&queue).cloned()
    }

    pub fn contains(&self, queue: QueueName) -> bool {
        self.processors.contains_key(&queue)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

/// One processor per standard queue; a missing handler is a compile error.
pub struct StandardProcessors<E, W, A, B, I, C> {
    pub email: E,
    pub webhook: W,
    pub analytics: A,
    pub broadcast: B,
    pub ai: I,
    pub cleanup: C,
}

impl<E, W, A, B, I, C> fmt::Debug for StandardProcessors<E, W, A, B, I, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardProcessors")
            .field("email", &type_name::<E>())
            .field("webhook", &type_name::<W>())
            .field("analytics", &type_name::<A>())
            .field("broadcast", &type_name::<B>())
            .field("ai", &type_name::<I>())
            .field("cleanup", &type_name::<C>())
            .finish()
    }
}

impl<E, W, A, B, I, C> StandardProcessors<E, W, A, B, I, C>
where
    E: Processor,
    W: Processor,
    A: Processor,
    B: Processor,
    I: Processor,
    C: Processor,
{
    pub fn into_registry(self) -> ProcessorRegistry {
        ProcessorRegistry::new()
            .with(QueueName::Email, self.email)
            .with(QueueName::Webhook, self.webhook)
            .with(QueueName::Analytics, self.analytics)
            .with(QueueName::Broadcast, self.broadcast)
            .with(QueueName::Ai, self.ai)
            .with(QueueName::Cleanup, self.cleanup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BroadcastJob, CleanupJob};
    use crate::retry::BackoffPolicy;

    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError> {
            Ok(serde_json::json!({ "attempt": job.attempt }))
        }
    }

    #[tokio::test]
    async fn test_registry_routes_by_queue() {
        let registry = ProcessorRegistry::new().with(QueueName::Broadcast, Echo);
        assert!(registry.contains(QueueName::Broadcast));
        assert!(registry.get(QueueName::Email).is_none());

        let record = JobRecord::new(
            QueueName::Broadcast,
            "announce",
            JobPayload::Broadcast(BroadcastJob {
                channel: "ops".into(),
                message: "deploy".into(),
                recipients: vec!["a".into()],
            }),
            3,
            BackoffPolicy::default(),
        );
        let processor = registry.get(QueueName::Broadcast).unwrap();
        let value = processor
            .process(JobContext::from_record(&record, 2))
            .await
            .unwrap();
        assert_eq!(value["attempt"], 2);
    }

    #[test]
    fn test_standard_processors_cover_every_queue() {
        let registry = StandardProcessors {
            email: Echo,
            webhook: Echo,
            analytics: Echo,
            broadcast: Echo,
            ai: Echo,
            cleanup: Echo,
        }
        .into_registry();
        assert_eq!(registry.len(), QueueName::ALL.len());
        for queue in QueueName::ALL {
            assert!(registry.contains(queue), "{queue}");
        }
    }

    #[test]
    fn test_unexpected_payload_is_permanent() {
        let record = JobRecord::new(
            QueueName::Email,
            "welcome",
            JobPayload::Cleanup(CleanupJob {
                tenant_id: "t".into(),
                older_than_days: 1,
            }),
            3,
            BackoffPolicy::default(),
        );
        let err = JobContext::from_record(&record, 1).unexpected_payload();
        assert!(err.is_permanent());
        assert_eq!(
            err.to_string(),
            "permanent: email processor received a cleanup payload"
        );
    }
}
