//! Conveyor worker - runs all six queues against the configured store.
//!
//! Uses Redis when built with the `redis` feature and a URL is set,
//! otherwise an in-process store. With the `metrics` feature, set
//! `CONVEYOR_METRICS_ADDR` (e.g. `0.0.0.0:9090`) to serve `GET /metrics`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use conveyor::handlers::default_registry;
use conveyor::telemetry::record_stats_snapshot;
use conveyor::{EngineConfig, JobStore, MemoryJobStore, QueueManagerBuilder, StoreConfig, WebhookConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("worker_starting");

    let engine = EngineConfig::from_env();
    let store_config = StoreConfig::from_env();
    let webhook = WebhookConfig::from_env();
    let stats_interval = Duration::from_millis(
        std::env::var("CONVEYOR_STATS_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60_000),
    );
    tracing::info!(
        redis_url_set = store_config.redis_url.is_some(),
        key_prefix = %store_config.key_prefix,
        stall_threshold_ms = engine.stall_threshold.as_millis() as u64,
        webhook_timeout_ms = webhook.timeout_ms,
        "config_loaded"
    );

    #[cfg(feature = "metrics")]
    let metrics_stop = start_metrics().await?;

    let store = open_store(&store_config).await?;
    let manager = QueueManagerBuilder::new()
        .with_config(engine)
        .with_store(store)
        .with_standard_queues()
        .build()?;
    manager.start(default_registry(&webhook)?).await?;

    let mut ticker = tokio::time::interval(stats_interval);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    tracing::error!(error = %err, "failed to listen for shutdown signal");
                }
                break;
            }
            _ = ticker.tick() => match manager.all_stats().await {
                Ok(snapshot) => record_stats_snapshot(&snapshot),
                Err(err) => tracing::warn!(error = %err, "stats_unavailable"),
            },
        }
    }

    tracing::info!("shutdown_requested");
    manager.shutdown().await;
    #[cfg(feature = "metrics")]
    drop(metrics_stop);
    tracing::info!("worker_stopped");
    Ok(())
}

async fn open_store(config: &StoreConfig) -> Result<Arc<dyn JobStore>> {
    #[cfg(feature = "redis")]
    if config.redis_url.is_some() {
        let store = conveyor::RedisJobStore::connect(config).await?;
        tracing::info!(key_prefix = %config.key_prefix, "using redis job store");
        return Ok(Arc::new(store));
    }

    if config.redis_url.is_some() {
        tracing::warn!("redis url set but the redis feature is disabled, using in-memory store");
    } else {
        tracing::warn!("no redis url configured, jobs will not survive a restart");
    }
    Ok(Arc::new(MemoryJobStore::new()))
}

/// Registers the collectors and, when `CONVEYOR_METRICS_ADDR` is set, serves
/// them until the returned sender is dropped.
#[cfg(feature = "metrics")]
async fn start_metrics() -> Result<Option<tokio::sync::oneshot::Sender<()>>> {
    conveyor::metrics::init_metrics()?;

    let Ok(addr) = std::env::var("CONVEYOR_METRICS_ADDR") else {
        tracing::info!("metrics_endpoint_disabled");
        return Ok(None);
    };
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics_endpoint_listening");

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let stopped = async {
            let _ = rx.await;
        };
        if let Err(err) = conveyor::metrics::serve(listener, stopped).await {
            tracing::error!(error = %err, "metrics_endpoint_failed");
        }
    });
    Ok(Some(tx))
}
