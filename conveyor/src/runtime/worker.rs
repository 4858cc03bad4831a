use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::config::{EngineConfig, QueueSettings};
use crate::error::ProcessorError;
use crate::events::{InProcEventBus, JobEvent, JobEventPayload};
use crate::lease::JobLease;
use crate::processor::{JobContext, Processor};
use crate::retry::{decide, RetryDecision};
use crate::store::{JobStore, Transition};
use crate::telemetry::{self, AttemptOutcome};

use super::supervisor::ShutdownToken;

/// One executor of a queue's pool. Runs a single job at a time.
pub(crate) struct Executor {
    pub(crate) worker_id: String,
    pub(crate) settings: Arc<QueueSettings>,
    pub(crate) processor: Arc<dyn Processor>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) events: Arc<InProcEventBus>,
    pub(crate) config: EngineConfig,
    pub(crate) shutdown: ShutdownToken,
}

pub(crate) async fn worker_loop(executor: Executor) {
    let queue = executor.settings.name;
    loop {
        if executor.shutdown.is_cancelled() {
            tracing::info!(worker_id = %executor.worker_id, queue = %queue, "executor shutting down");
            break;
        }

        // Bounded wait so shutdown is observed within `claim_wait`.
        match executor
            .store
            .claim(queue, &executor.worker_id, executor.config.claim_wait)
            .await
        {
            Ok(Some(lease)) => executor.run(lease).await,
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    worker_id = %executor.worker_id,
                    queue = %queue,
                    error = %err,
                    "claim failed, backing off"
                );
                executor.back_off().await;
            }
        }
    }
}

impl Executor {
    async fn back_off(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.store_error_backoff) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn run(&self, lease: JobLease) {
        let job_id = lease.job_id();
        let queue = lease.queue();
        let attempt = lease.attempt();

        self.events.publish(JobEvent::new(
            job_id,
            queue,
            JobEventPayload::Started {
                lease_id: lease.lease_id,
                worker_id: self.worker_id.clone(),
                attempt,
            },
        ));

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.store),
            lease.clone(),
            self.config.heartbeat_interval,
            cancel_rx,
        ));

        let started = Instant::now();
        let context = JobContext::from_record(&lease.job, attempt);
        let processor = Arc::clone(&self.processor);
        // Own task so a panic inside the processor only fails this attempt.
        let task = tokio::spawn(telemetry::instrument_process(
            job_id,
            queue,
            &lease.job.job_type,
            attempt,
            async move { processor.process(context).await },
        ));
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(err) if err.is_panic() => Err(ProcessorError::retryable(format!(
                "processor panicked: {}",
                panic_message(err.into_panic())
            ))),
            Err(err) => Err(ProcessorError::retryable(format!("processor task aborted: {err}"))),
        };
        let elapsed = started.elapsed();

        let _ = cancel_tx.try_send(());
        let _ = heartbeat.await;

        self.settle(&lease, outcome, elapsed).await;
    }

    /// Records the attempt's outcome in the store and publishes it.
    async fn settle(
        &self,
        lease: &JobLease,
        outcome: Result<serde_json::Value, ProcessorError>,
        elapsed: Duration,
    ) {
        let job_id = lease.job_id();
        let queue = lease.queue();
        let attempt = lease.attempt();
        let store = self.store.as_ref();
        let retention = &self.settings.retention;

        let error = match outcome {
            Ok(result) => {
                let transition = self
                    .persist("complete", lease, move || {
                        store.complete(lease, result.clone(), retention)
                    })
                    .await;
                if transition.is_some_and(|t| t.is_applied()) {
                    telemetry::record_attempt_finished(
                        job_id,
                        queue,
                        attempt,
                        AttemptOutcome::Completed,
                        elapsed,
                        None,
                    );
                    self.events.publish(JobEvent::new(
                        job_id,
                        queue,
                        JobEventPayload::Completed {
                            attempt,
                            duration_ms: elapsed.as_millis() as u64,
                        },
                    ));
                }
                return;
            }
            Err(error) => error,
        };

        let message = error.to_string();
        let permanent = error.is_permanent();
        let decision = decide(
            attempt,
            lease.job.max_attempts,
            &lease.job.backoff,
            permanent,
            &self.config.retry,
        );

        match decision {
            RetryDecision::Retry { delay } => {
                let next_attempt_at =
                    Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                let reason = message.as_str();
                let transition = self
                    .persist("retry", lease, move || store.retry(lease, reason, next_attempt_at))
                    .await;
                if transition.is_some_and(|t| t.is_applied()) {
                    telemetry::record_attempt_finished(
                        job_id,
                        queue,
                        attempt,
                        AttemptOutcome::Retry,
                        elapsed,
                        Some(&message),
                    );
                    self.events.publish(JobEvent::new(
                        job_id,
                        queue,
                        JobEventPayload::RetryScheduled {
                            attempt,
                            error: message,
                            next_attempt_at,
                        },
                    ));
                }
            }
            RetryDecision::Fail => {
                let reason = message.as_str();
                let transition = self
                    .persist("fail", lease, move || store.fail(lease, reason, retention))
                    .await;
                if transition.is_some_and(|t| t.is_applied()) {
                    telemetry::record_attempt_finished(
                        job_id,
                        queue,
                        attempt,
                        AttemptOutcome::Failed,
                        elapsed,
                        Some(&message),
                    );
                    self.events.publish(JobEvent::new(
                        job_id,
                        queue,
                        JobEventPayload::Failed {
                            attempt,
                            error: message,
                            permanent,
                        },
                    ));
                }
            }
        }
    }

    /// Runs a lease transition, retrying store errors until it lands or the
    /// engine shuts down.
    ///
    /// `None` means the transition was abandoned; the job stays `active` and
    /// stall recovery will requeue it.
    async fn persist<F, Fut>(
        &self,
        action: &'static str,
        lease: &JobLease,
        mut op: F,
    ) -> Option<Transition>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Transition>>,
    {
        loop {
            match op().await {
                Ok(Transition::LeaseLost) => {
                    tracing::warn!(
                        job_id = %lease.job_id(),
                        queue = %lease.queue(),
                        worker_id = %self.worker_id,
                        action,
                        "lease lost, outcome discarded"
                    );
                    return Some(Transition::LeaseLost);
                }
                Ok(applied) => return Some(applied),
                Err(err) => {
                    tracing::warn!(
                        job_id = %lease.job_id(),
                        queue = %lease.queue(),
                        action,
                        error = %err,
                        "store transition failed, retrying"
                    );
                    if self.shutdown.is_cancelled() {
                        return None;
                    }
                    self.back_off().await;
                }
            }
        }
    }
}

async fn heartbeat_loop(
    store: Arc<dyn JobStore>,
    lease: JobLease,
    interval: Duration,
    mut cancel_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel_rx.recv() => break,
        }

        match store.heartbeat(&lease).await {
            Ok(true) => {
                tracing::trace!(job_id = %lease.job_id(), "heartbeat refreshed");
            }
            Ok(false) => {
                tracing::warn!(job_id = %lease.job_id(), queue = %lease.queue(), "lease lost, heartbeat stopped");
                break;
            }
            Err(err) => {
                tracing::warn!(job_id = %lease.job_id(), error = %err, "heartbeat failed");
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
