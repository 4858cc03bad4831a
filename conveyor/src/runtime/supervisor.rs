use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use crate::config::{EngineConfig, QueueSettings};
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::lease::stall_cutoff;
use crate::processor::Processor;
use crate::store::JobStore;
use crate::telemetry;

use super::worker::{worker_loop, Executor};

/// Token for signaling graceful shutdown to executors and the housekeeper.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Register interest before checking the flag so a cancel between the
        // check and the await is not missed.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the tasks of one running engine: an executor pool per queue plus
/// the housekeeper.
pub(crate) struct Supervisor {
    store: Arc<dyn JobStore>,
    events: Arc<InProcEventBus>,
    config: EngineConfig,
    instance: String,
    shutdown: ShutdownToken,
    handles: Vec<JoinHandle<()>>,
    worker_ids: Vec<String>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("instance", &self.instance)
            .field("task_count", &self.handles.len())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Supervisor {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        events: Arc<InProcEventBus>,
        config: EngineConfig,
    ) -> Self {
        let instance = uuid::Uuid::now_v7().simple().to_string();
        Self {
            store,
            events,
            config,
            instance: instance[instance.len() - 8..].to_string(),
            shutdown: ShutdownToken::new(),
            handles: Vec::new(),
            worker_ids: Vec::new(),
        }
    }

    /// Spawn `settings.concurrency` executors for one queue.
    pub(crate) fn spawn_worker_pool(&mut self, settings: QueueSettings, processor: Arc<dyn Processor>) {
        let worker_group = format!("{}-{}-{}", settings.name, std::process::id(), self.instance);
        let settings = Arc::new(settings);

        for i in 0..settings.concurrency {
            let worker_id = format!("{worker_group}-w{i}");
            self.worker_ids.push(worker_id.clone());
            let executor = Executor {
                worker_id,
                settings: Arc::clone(&settings),
                processor: Arc::clone(&processor),
                store: Arc::clone(&self.store),
                events: Arc::clone(&self.events),
                config: self.config.clone(),
                shutdown: self.shutdown.clone(),
            };
            self.handles.push(tokio::spawn(worker_loop(executor)));
        }

        tracing::info!(
            queue = %settings.name,
            concurrency = settings.concurrency,
            "worker pool started"
        );
    }

    /// Spawn the task that promotes due delayed jobs and recovers stalled ones.
    pub(crate) fn spawn_housekeeper(&mut self, queues: Vec<QueueSettings>) {
        let store = Arc::clone(&self.store);
        let events = Arc::clone(&self.events);
        let shutdown = self.shutdown.clone();
        let promote_every = self.config.delayed_poll_interval;
        let sweep_every = self.config.stall_sweep_interval;
        let stall_threshold = self.config.stall_threshold;

        let handle = tokio::spawn(async move {
            let mut promote = tokio::time::interval(promote_every);
            promote.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweep = tokio::time::interval(sweep_every);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("housekeeper shutting down");
                        break;
                    }
                    _ = promote.tick() => {
                        for settings in &queues {
                            promote_delayed(store.as_ref(), settings).await;
                        }
                    }
                    _ = sweep.tick() => {
                        for settings in &queues {
                            sweep_stalled(store.as_ref(), &events, settings, stall_threshold)
                                .instrument(telemetry::sweep_span(settings.name))
                                .await;
                        }
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Stop claiming, then wait up to `timeout` for every task to finish.
    ///
    /// Executors still running at the deadline are aborted; their jobs stay
    /// `active` until stall recovery picks them up.
    pub(crate) async fn shutdown(self, timeout: Duration) {
        tracing::info!(tasks = self.handles.len(), "initiating graceful shutdown");
        self.shutdown.cancel();

        let aborts: Vec<_> = self.handles.iter().map(JoinHandle::abort_handle).collect();
        let joined = tokio::time::timeout(timeout, futures::future::join_all(self.handles)).await;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        tracing::warn!(error = %err, "engine task failed");
                    }
                }
                tracing::info!("shutdown complete");
            }
            Err(_) => {
                let unfinished = aborts.iter().filter(|handle| !handle.is_finished()).count();
                tracing::warn!(
                    unfinished,
                    timeout_ms = timeout.as_millis() as u64,
                    "tasks did not finish before shutdown timeout, aborting"
                );
                for handle in aborts {
                    handle.abort();
                }
            }
        }

        for worker_id in &self.worker_ids {
            self.store.release_worker(worker_id).await;
        }
    }
}

async fn promote_delayed(store: &dyn JobStore, settings: &QueueSettings) {
    match store.promote_delayed(settings.name, Utc::now()).await {
        Ok(0) => {}
        Ok(promoted) => {
            tracing::debug!(queue = %settings.name, promoted, "delayed jobs promoted");
        }
        Err(err) => {
            tracing::warn!(queue = %settings.name, error = %err, "promote_delayed failed");
        }
    }
}

async fn sweep_stalled(
    store: &dyn JobStore,
    events: &InProcEventBus,
    settings: &QueueSettings,
    stall_threshold: Duration,
) {
    let cutoff = stall_cutoff(Utc::now(), stall_threshold);
    let report = match store.recover_stalled(settings.name, cutoff, &settings.retention).await {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(queue = %settings.name, error = %err, "stall sweep failed");
            return;
        }
    };

    let outcomes = report
        .requeued
        .iter()
        .map(|id| (*id, true))
        .chain(report.failed.iter().map(|id| (*id, false)));
    for (job_id, requeued) in outcomes {
        telemetry::record_job_stalled(job_id, settings.name, requeued);
        events.publish(JobEvent::new(
            job_id,
            settings.name,
            JobEventPayload::Stalled { requeued },
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CleanupJob, JobPayload, JobRecord, JobState, QueueName};
    use crate::retry::BackoffPolicy;
    use crate::store::MemoryJobStore;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let results = timeout(Duration::from_secs(5), futures::future::join_all(waiters))
            .await
            .expect("waiters did not observe cancellation within 5 seconds");
        for r in results {
            r.expect("waiter panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        assert!(!ShutdownToken::default().is_cancelled());
    }

    #[tokio::test]
    async fn test_shutdown_joins_housekeeper() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let mut supervisor = Supervisor::new(
            store,
            Arc::new(InProcEventBus::default()),
            EngineConfig::default(),
        );
        supervisor.spawn_housekeeper(vec![QueueSettings::standard(QueueName::Cleanup)]);

        timeout(Duration::from_secs(5), supervisor.shutdown(Duration::from_secs(1)))
            .await
            .expect("shutdown did not complete");
    }

    #[tokio::test]
    async fn test_sweep_requeues_and_publishes() {
        let store = MemoryJobStore::new();
        let record = JobRecord::new(
            QueueName::Cleanup,
            "purge",
            JobPayload::Cleanup(CleanupJob {
                tenant_id: "acme".into(),
                older_than_days: 7,
            }),
            3,
            BackoffPolicy::default(),
        );
        let id = record.id;
        store.insert(record).await.unwrap();
        store
            .claim(QueueName::Cleanup, "w0", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let events = InProcEventBus::default();
        let mut rx = events.subscribe();
        let settings = QueueSettings::standard(QueueName::Cleanup);

        // zero threshold: every active job is stalled
        tokio::time::sleep(Duration::from_millis(5)).await;
        sweep_stalled(&store, &events, &settings, Duration::ZERO).await;

        let job = store.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobState::Waiting);
        assert_eq!(job.attempts_made, 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), id);
        assert!(matches!(
            event.payload,
            JobEventPayload::Stalled { requeued: true }
        ));
    }
}
