use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::EngineError;
use crate::job::QueueName;
use crate::retry::{BackoffPolicy, RetryConfig};

/// How many terminal jobs a queue keeps around.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub keep_failed: usize,
    /// Bound on the dead-letter list, independent of `keep_failed`.
    pub keep_dead_letters: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 1000,
            keep_failed: 5000,
            keep_dead_letters: 1000,
        }
    }
}

/// Fully resolved configuration of one queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: QueueName,
    pub concurrency: usize,
    pub default_max_attempts: u32,
    pub default_backoff: BackoffPolicy,
    pub retention: RetentionPolicy,
}

impl QueueSettings {
    /// Production defaults for each queue.
    pub fn standard(name: QueueName) -> Self {
        let concurrency = match name {
            QueueName::Email => 5,
            QueueName::Webhook => 10,
            QueueName::Analytics => 3,
            QueueName::Broadcast => 1,
            QueueName::Ai => 2,
            QueueName::Cleanup => 1,
        };

        Self {
            name,
            concurrency,
            default_max_attempts: 3,
            default_backoff: BackoffPolicy::exponential(1000),
            retention: RetentionPolicy::default(),
        }
    }

    /// Overlays the fields set in `options`, rejecting values that would
    /// leave the queue unusable.
    pub fn merge(&self, options: &QueueOptions) -> Result<Self, EngineError> {
        let mut merged = self.clone();
        if let Some(concurrency) = options.concurrency {
            merged.concurrency = concurrency;
        }
        if let Some(attempts) = options.max_attempts {
            merged.default_max_attempts = attempts;
        }
        if let Some(backoff) = options.backoff {
            merged.default_backoff = backoff;
        }
        if let Some(keep) = options.keep_completed {
            merged.retention.keep_completed = keep;
        }
        if let Some(keep) = options.keep_failed {
            merged.retention.keep_failed = keep;
        }
        if let Some(keep) = options.keep_dead_letters {
            merged.retention.keep_dead_letters = keep;
        }
        merged.validate()?;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidOptions {
            queue: self.name,
            reason: reason.to_string(),
        };
        if self.concurrency == 0 {
            return Err(invalid("concurrency must be at least 1"));
        }
        if self.default_max_attempts == 0 {
            return Err(invalid("max attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Partial queue options; unset fields keep their current value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub keep_completed: Option<usize>,
    pub keep_failed: Option<usize>,
    pub keep_dead_letters: Option<usize>,
}

impl QueueOptions {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn keep_completed(mut self, keep: usize) -> Self {
        self.keep_completed = Some(keep);
        self
    }

    pub fn keep_failed(mut self, keep: usize) -> Self {
        self.keep_failed = Some(keep);
        self
    }

    pub fn keep_dead_letters(mut self, keep: usize) -> Self {
        self.keep_dead_letters = Some(keep);
        self
    }
}

/// Runtime tuning shared by every queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Longest a single blocking claim waits before the executor re-checks shutdown.
    pub claim_wait: Duration,
    pub heartbeat_interval: Duration,
    /// An active job whose heartbeat is older than this is considered stalled.
    pub stall_threshold: Duration,
    pub stall_sweep_interval: Duration,
    pub delayed_poll_interval: Duration,
    /// Pause after a failed store call inside an executor.
    pub store_error_backoff: Duration,
    pub shutdown_timeout: Duration,
    pub retry: RetryConfig,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            claim_wait: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(30),
            stall_sweep_interval: Duration::from_secs(15),
            delayed_poll_interval: Duration::from_secs(1),
            store_error_backoff: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `CONVEYOR_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            claim_wait: millis(&lookup, "CONVEYOR_CLAIM_WAIT_MS", defaults.claim_wait),
            heartbeat_interval: millis(
                &lookup,
                "CONVEYOR_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            stall_threshold: millis(
                &lookup,
                "CONVEYOR_STALL_THRESHOLD_MS",
                defaults.stall_threshold,
            ),
            stall_sweep_interval: millis(
                &lookup,
                "CONVEYOR_STALL_SWEEP_INTERVAL_MS",
                defaults.stall_sweep_interval,
            ),
            delayed_poll_interval: millis(
                &lookup,
                "CONVEYOR_DELAYED_POLL_INTERVAL_MS",
                defaults.delayed_poll_interval,
            ),
            store_error_backoff: millis(
                &lookup,
                "CONVEYOR_STORE_ERROR_BACKOFF_MS",
                defaults.store_error_backoff,
            ),
            shutdown_timeout: millis(
                &lookup,
                "CONVEYOR_SHUTDOWN_TIMEOUT_MS",
                defaults.shutdown_timeout,
            ),
            retry: RetryConfig {
                jitter_ratio: parsed(
                    &lookup,
                    "CONVEYOR_RETRY_JITTER_RATIO",
                    defaults.retry.jitter_ratio,
                ),
                max_delay_ms: parsed(
                    &lookup,
                    "CONVEYOR_RETRY_MAX_DELAY_MS",
                    defaults.retry.max_delay_ms,
                ),
            },
            event_capacity: parsed(&lookup, "CONVEYOR_EVENT_CAPACITY", defaults.event_capacity),
        }
    }
}

/// Where jobs are persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `None` selects the in-process store.
    pub redis_url: Option<String>,
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "conveyor".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            redis_url: lookup("CONVEYOR_REDIS_URL")
                .or_else(|| lookup("REDIS_URL"))
                .filter(|url| !url.trim().is_empty()),
            key_prefix: lookup("CONVEYOR_KEY_PREFIX")
                .filter(|prefix| !prefix.is_empty())
                .unwrap_or_else(|| "conveyor".to_string()),
        }
    }
}

/// Outbound webhook delivery settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self { timeout_ms: 10_000 }
    }
}

impl WebhookConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            timeout_ms: parsed(
                &lookup,
                "CONVEYOR_WEBHOOK_TIMEOUT_MS",
                Self::default().timeout_ms,
            ),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            warn!(env_var = name, value = %raw, "invalid value, using default");
            default
        }
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: Duration) -> Duration {
    Duration::from_millis(parsed(lookup, name, default.as_millis() as u64))
}
