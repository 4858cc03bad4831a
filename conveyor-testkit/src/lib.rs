//! Test doubles and fixtures for the conveyor job engine.

pub mod payloads;
pub mod processors;
pub mod store;
pub mod webhook;

use std::future::Future;
use std::time::Duration;

use conveyor::{EngineConfig, RetryConfig};

pub use processors::{Outcome, ProcessorCall, ScriptedProcessor};
pub use store::OutageStore;
pub use webhook::{ReceivedWebhook, WebhookReceiver};

/// Engine timings shrunk for tests; jitter disabled so delays are exact.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        claim_wait: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(50),
        stall_threshold: Duration::from_millis(400),
        stall_sweep_interval: Duration::from_millis(50),
        delayed_poll_interval: Duration::from_millis(20),
        store_error_backoff: Duration::from_millis(20),
        shutdown_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            jitter_ratio: 0.0,
            ..RetryConfig::default()
        },
        event_capacity: 4096,
    }
}

/// Poll `check` every 10ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
