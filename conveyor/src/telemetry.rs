//! Tracing spans and event recorders for the job lifecycle.
//!
//! Every `record_*` helper logs through `tracing` and, with the `metrics`
//! feature, updates the matching Prometheus collector.

use std::future::Future;
use std::time::Duration;

use tracing::{info_span, Instrument, Span};

use crate::job::{JobId, QueueName};
use crate::queue::StatsSnapshot;

#[must_use]
pub fn enqueue_span(queue: QueueName, job_type: &str) -> Span {
    info_span!("conveyor.enqueue", queue = %queue, job_type = %job_type)
}

#[must_use]
pub fn process_span(job_id: JobId, queue: QueueName, job_type: &str, attempt: u32) -> Span {
    info_span!(
        "conveyor.process",
        job_id = %job_id,
        queue = %queue,
        job_type = %job_type,
        attempt = attempt,
    )
}

#[must_use]
pub fn sweep_span(queue: QueueName) -> Span {
    info_span!("conveyor.sweep", queue = %queue)
}

/// Attach a process span to a processor future.
pub fn instrument_process<F>(
    job_id: JobId,
    queue: QueueName,
    job_type: &str,
    attempt: u32,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(process_span(job_id, queue, job_type, attempt))
}

/// How an attempt ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AttemptOutcome {
    Completed,
    Retry,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Completed => "completed",
            AttemptOutcome::Retry => "retry",
            AttemptOutcome::Failed => "failed",
        }
    }
}

pub fn record_job_enqueued(job_id: JobId, queue: QueueName, job_type: &str) {
    tracing::info!(job_id = %job_id, queue = %queue, job_type = %job_type, "job enqueued");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_enqueued(queue.as_str(), job_type);
}

pub fn record_attempt_finished(
    job_id: JobId,
    queue: QueueName,
    attempt: u32,
    outcome: AttemptOutcome,
    elapsed: Duration,
    error: Option<&str>,
) {
    let elapsed_ms = elapsed.as_millis() as u64;
    let error = error.unwrap_or_default();
    match outcome {
        AttemptOutcome::Failed => tracing::error!(
            job_id = %job_id,
            queue = %queue,
            attempt,
            elapsed_ms,
            error,
            "job failed"
        ),
        AttemptOutcome::Retry => tracing::warn!(
            job_id = %job_id,
            queue = %queue,
            attempt,
            elapsed_ms,
            error,
            "job attempt failed, retry scheduled"
        ),
        AttemptOutcome::Completed => tracing::info!(
            job_id = %job_id,
            queue = %queue,
            attempt,
            elapsed_ms,
            "job completed"
        ),
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(queue.as_str(), outcome.as_str(), elapsed.as_secs_f64());
}

pub fn record_job_stalled(job_id: JobId, queue: QueueName, requeued: bool) {
    tracing::warn!(job_id = %job_id, queue = %queue, requeued, "stalled job recovered");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_stalled(
        queue.as_str(),
        if requeued { "requeued" } else { "failed" },
    );
}

/// Log a stats snapshot and refresh the per-state gauges.
pub fn record_stats_snapshot(snapshot: &StatsSnapshot) {
    for (queue, stats) in &snapshot.queues {
        tracing::info!(
            queue = %queue,
            waiting = stats.waiting,
            active = stats.active,
            delayed = stats.delayed,
            completed = stats.completed,
            failed = stats.failed,
            "queue stats"
        );

        #[cfg(feature = "metrics")]
        for (state, count) in stats.by_state() {
            crate::metrics::set_jobs_in_state(queue.as_str(), state.as_str(), count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        let span = enqueue_span(QueueName::Email, "welcome");
        assert_eq!(span.metadata().unwrap().name(), "conveyor.enqueue");

        let span = process_span(JobId::new(), QueueName::Webhook, "dispatch", 1);
        assert_eq!(span.metadata().unwrap().name(), "conveyor.process");

        let span = sweep_span(QueueName::Ai);
        assert_eq!(span.metadata().unwrap().name(), "conveyor.sweep");
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AttemptOutcome::Completed.as_str(), "completed");
        assert_eq!(AttemptOutcome::Retry.as_str(), "retry");
        assert_eq!(AttemptOutcome::Failed.as_str(), "failed");
    }

    #[test]
    fn test_recorders_do_not_panic() {
        let id = JobId::new();
        record_job_enqueued(id, QueueName::Analytics, "rollup");
        record_attempt_finished(
            id,
            QueueName::Analytics,
            1,
            AttemptOutcome::Retry,
            Duration::from_millis(3),
            Some("connection reset"),
        );
        record_job_stalled(id, QueueName::Analytics, true);
        record_stats_snapshot(&StatsSnapshot::default());
    }
}
