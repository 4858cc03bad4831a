use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::Instrument;

use crate::config::{EngineConfig, QueueOptions, QueueSettings};
use crate::error::EngineError;
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::job::{EnqueueOptions, JobId, JobPayload, JobRecord, QueueName};
use crate::processor::ProcessorRegistry;
use crate::queue::{QueueHandle, QueueRegistry, QueueStats, StatsSnapshot};
use crate::store::{DeadLetter, JobStore};
use crate::telemetry;

use super::supervisor::Supervisor;

/// Entry point of the engine: defines queues, accepts jobs, runs the
/// worker pools and reports stats.
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    queues: QueueRegistry,
    events: Arc<InProcEventBus>,
    config: EngineConfig,
    supervisor: Mutex<Option<Supervisor>>,
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let running = self
            .supervisor
            .try_lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true);

        f.debug_struct("QueueManager")
            .field("queues", &self.queues.names())
            .field("config", &self.config)
            .field("running", &running)
            .finish()
    }
}

impl QueueManager {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        queues: QueueRegistry,
        events: Arc<InProcEventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queues,
            events,
            config,
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Define `name` or merge `options` into its settings.
    ///
    /// Pools are sized when the engine starts; a change made while running
    /// takes effect on the next `start`.
    pub fn define_queue(&self, name: QueueName, options: QueueOptions) -> Result<QueueHandle, EngineError> {
        let handle = self.queues.define(name, &options)?;
        tracing::debug!(
            queue = %name,
            concurrency = handle.settings.concurrency,
            max_attempts = handle.settings.default_max_attempts,
            "queue defined"
        );
        Ok(handle)
    }

    pub fn queue(&self, name: QueueName) -> Option<QueueSettings> {
        self.queues.get(name)
    }

    pub fn queue_names(&self) -> Vec<QueueName> {
        self.queues.names()
    }

    /// Persist a new job in `waiting` and return its id.
    pub async fn enqueue(
        &self,
        queue: QueueName,
        job_type: impl Into<String>,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<JobId, EngineError> {
        let settings = self.queues.require(queue)?;
        if payload.queue() != queue {
            return Err(EngineError::PayloadMismatch {
                queue,
                payload: payload.queue(),
            });
        }

        let max_attempts = options.max_attempts.unwrap_or(settings.default_max_attempts);
        if max_attempts == 0 {
            return Err(EngineError::InvalidOptions {
                queue,
                reason: "max_attempts must be at least 1".into(),
            });
        }
        let backoff = options.backoff.unwrap_or(settings.default_backoff);

        let job_type = job_type.into();
        let record = JobRecord::new(queue, job_type.clone(), payload, max_attempts, backoff);
        let job_id = record.id;

        self.store
            .insert(record)
            .instrument(telemetry::enqueue_span(queue, &job_type))
            .await
            .map_err(EngineError::store)?;

        telemetry::record_job_enqueued(job_id, queue, &job_type);
        self.events.publish(JobEvent::new(
            job_id,
            queue,
            JobEventPayload::Enqueued { job_type },
        ));
        Ok(job_id)
    }

    pub async fn queue_stats(&self, queue: QueueName) -> Result<QueueStats, EngineError> {
        self.queues.require(queue)?;
        self.store.counts(queue).await.map_err(EngineError::store)
    }

    /// Counters for every defined queue.
    pub async fn all_stats(&self) -> Result<StatsSnapshot, EngineError> {
        let mut snapshot = StatsSnapshot::new(Utc::now());
        for name in self.queues.names() {
            let stats = self.store.counts(name).await.map_err(EngineError::store)?;
            snapshot.queues.insert(name, stats);
        }
        Ok(snapshot)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<JobRecord>, EngineError> {
        self.store.job(id).await.map_err(EngineError::store)
    }

    /// Most recent dead letters of `queue`, newest first.
    pub async fn dead_letters(&self, queue: QueueName, limit: usize) -> Result<Vec<DeadLetter>, EngineError> {
        self.queues.require(queue)?;
        self.store
            .dead_letters(queue, limit)
            .await
            .map_err(EngineError::store)
    }

    /// Re-enqueue a dead-lettered job under a new id with a fresh attempt
    /// budget, removing it from the dead-letter list.
    pub async fn replay_dead_letter(&self, queue: QueueName, id: JobId) -> Result<JobId, EngineError> {
        self.queues.require(queue)?;
        let dead = self
            .store
            .dead_letter(queue, id)
            .await
            .map_err(EngineError::store)?
            .ok_or(EngineError::DeadLetterNotFound { queue, id })?;

        let replacement = dead.job.replay();
        let new_id = replacement.id;
        let replayed = self
            .store
            .replay_dead_letter(queue, id, replacement)
            .await
            .map_err(EngineError::store)?;
        if !replayed {
            return Err(EngineError::DeadLetterNotFound { queue, id });
        }

        tracing::info!(queue = %queue, original_job_id = %id, job_id = %new_id, "dead letter replayed");
        self.events.publish(JobEvent::new(
            new_id,
            queue,
            JobEventPayload::Replayed { original_job_id: id },
        ));
        Ok(new_id)
    }

    /// Lifecycle events of every job handled by this manager.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.lock().await.is_some()
    }

    /// Start one pool per defined queue plus the housekeeper.
    ///
    /// Every defined queue needs a processor in `processors`.
    pub async fn start(&self, processors: ProcessorRegistry) -> Result<(), EngineError> {
        let mut guard = self.supervisor.lock().await;
        if guard.is_some() {
            return Err(EngineError::AlreadyRunning);
        }

        let queues = self.queues.all();
        let mut pools = Vec::with_capacity(queues.len());
        for settings in &queues {
            let processor = processors
                .get(settings.name)
                .ok_or(EngineError::MissingProcessor(settings.name))?;
            pools.push((settings.clone(), processor));
        }

        if self.config.heartbeat_interval >= self.config.stall_threshold {
            tracing::warn!(
                heartbeat_interval_ms = self.config.heartbeat_interval.as_millis() as u64,
                stall_threshold_ms = self.config.stall_threshold.as_millis() as u64,
                "heartbeat interval is not below the stall threshold, healthy jobs may be reclaimed"
            );
        }

        let mut supervisor = Supervisor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.events),
            self.config.clone(),
        );
        for (settings, processor) in pools {
            supervisor.spawn_worker_pool(settings, processor);
        }
        supervisor.spawn_housekeeper(queues);

        tracing::info!(queues = ?self.queues.names(), "engine started");
        *guard = Some(supervisor);
        Ok(())
    }

    /// Stop claiming new jobs and wait up to `shutdown_timeout` for
    /// in-flight jobs. A no-op when not running.
    pub async fn shutdown(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor {
            supervisor.shutdown(self.config.shutdown_timeout).await;
        }
    }
}
