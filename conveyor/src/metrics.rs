//! Prometheus metrics for the job engine, compiled only with the `metrics`
//! feature.
//!
//! ## Counters
//! - `conveyor_jobs_enqueued_total` - jobs accepted by `enqueue`
//! - `conveyor_jobs_finished_total` - attempts that ended, by outcome
//! - `conveyor_jobs_stalled_total` - jobs reclaimed by stall recovery
//!
//! ## Gauges
//! - `conveyor_jobs` - jobs per queue and state, refreshed from stats snapshots
//!
//! ## Histograms
//! - `conveyor_job_duration_seconds` - processor wall time per attempt
//!
//! [`serve`] exposes the registry at `GET /metrics`.
#![cfg(feature = "metrics")]

use std::future::Future;
use std::sync::LazyLock;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use tokio::net::TcpListener;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `queue`, `job_type`.
pub static JOBS_ENQUEUED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("conveyor_jobs_enqueued_total", "Total number of jobs enqueued");
    CounterVec::new(opts, &["queue", "job_type"])
        .expect("conveyor_jobs_enqueued_total metric creation failed")
});

/// Labels: `queue`, `outcome` (`completed`, `retry`, `failed`).
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conveyor_jobs_finished_total",
        "Total number of job attempts that ended",
    );
    CounterVec::new(opts, &["queue", "outcome"])
        .expect("conveyor_jobs_finished_total metric creation failed")
});

/// Labels: `queue`, `outcome` (`requeued`, `failed`).
pub static JOBS_STALLED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "conveyor_jobs_stalled_total",
        "Total number of stalled jobs recovered by the sweep",
    );
    CounterVec::new(opts, &["queue", "outcome"])
        .expect("conveyor_jobs_stalled_total metric creation failed")
});

/// Labels: `queue`, `state`.
pub static JOBS_BY_STATE: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("conveyor_jobs", "Jobs currently held per queue and state");
    GaugeVec::new(opts, &["queue", "state"]).expect("conveyor_jobs metric creation failed")
});

/// Labels: `queue`, `outcome`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "conveyor_job_duration_seconds",
        "Processor execution time per attempt in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["queue", "outcome"])
        .expect("conveyor_job_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_ENQUEUED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_STALLED_TOTAL.clone()),
        Box::new(JOBS_BY_STATE.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_enqueued(queue: &str, job_type: &str) {
    JOBS_ENQUEUED_TOTAL.with_label_values(&[queue, job_type]).inc();
}

pub fn record_job_finished(queue: &str, outcome: &str, duration_secs: f64) {
    JOBS_FINISHED_TOTAL.with_label_values(&[queue, outcome]).inc();
    JOB_DURATION_SECONDS
        .with_label_values(&[queue, outcome])
        .observe(duration_secs);
}

pub fn record_job_stalled(queue: &str, outcome: &str) {
    JOBS_STALLED_TOTAL.with_label_values(&[queue, outcome]).inc();
}

pub fn set_jobs_in_state(queue: &str, state: &str, count: u64) {
    JOBS_BY_STATE
        .with_label_values(&[queue, state])
        .set(count as f64);
}

/// All registered metrics in the Prometheus text exposition format.
pub fn gather_text() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

async fn metrics_handler() -> Response {
    match gather_text() {
        Ok(body) => (
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "metrics_encode_failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Serve [`router`] on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
