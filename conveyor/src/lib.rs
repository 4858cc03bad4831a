//! Conveyor - asynchronous job processing engine.
//!
//! Producers enqueue typed jobs onto one of six named queues; per-queue
//! worker pools claim them from a durable store, run the registered
//! processor, and retry failures with exponential or fixed backoff.
//!
//! # Core Concepts
//!
//! - **Job**: a [`JobRecord`] carrying a [`JobPayload`] whose variant decides
//!   the [`QueueName`] it runs on.
//!
//! - **Store**: the [`JobStore`] trait owns every state transition. Each
//!   transition out of `active` requires the executor's [`JobLease`].
//!   [`MemoryJobStore`] runs in-process; `RedisJobStore` (feature `redis`)
//!   persists across restarts.
//!
//! - **Processor**: one [`Processor`] per queue, returning
//!   [`ProcessorError::Retryable`] or [`ProcessorError::Permanent`]. The
//!   [`handlers`] module ships the six standard processors.
//!
//! - **Runtime**: [`QueueManager`] (built with [`QueueManagerBuilder`]) runs
//!   the pools, the delayed-job promoter and the stall sweep, and reports
//!   [`QueueStats`].
//!
//! - **Events**: lifecycle [`JobEvent`]s are broadcast on an
//!   [`InProcEventBus`].
//!
//! # Feature Flags
//!
//! - `redis` - Redis-backed durable store
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use conveyor::*;
//!
//! let manager = QueueManagerBuilder::new()
//!     .with_store(Arc::new(MemoryJobStore::new()))
//!     .with_standard_queues()
//!     .build()?;
//! manager.start(handlers::default_registry(&WebhookConfig::default())?).await?;
//!
//! manager
//!     .enqueue(QueueName::Email, "welcome", payload, EnqueueOptions::default())
//!     .await?;
//! ```

/// Engine, store, queue and webhook configuration.
pub mod config;

/// Engine and processor error types.
pub mod error;

/// Job lifecycle events and the in-process event bus.
pub mod events;

/// Standard processors for the six queues.
pub mod handlers;

/// Job identifiers, payloads and the persisted job record.
pub mod job;

/// Leases held by executors on active jobs.
pub mod lease;

#[cfg(feature = "metrics")]
/// Prometheus collectors for job throughput and queue depth.
pub mod metrics;

/// The processor trait and registry.
pub mod processor;

/// Queue registry and stats types.
pub mod queue;

/// Backoff computation and retry decisions.
pub mod retry;

/// Engine runtime: manager, worker pools and shutdown.
pub mod runtime;

/// Job storage backends.
pub mod store;

/// Tracing spans and lifecycle recorders.
pub mod telemetry;

pub use config::{EngineConfig, QueueOptions, QueueSettings, RetentionPolicy, StoreConfig, WebhookConfig};
pub use error::{EngineError, ProcessorError};
pub use events::{EventMeta, InProcEventBus, JobEvent, JobEventPayload};
pub use job::{
    AiJob, AnalyticsJob, BroadcastJob, CleanupJob, EmailJob, EnqueueOptions, JobId, JobPayload,
    JobRecord, JobState, QueueName, WebhookJob,
};
pub use lease::{JobLease, LeaseId};
pub use processor::{JobContext, Processor, ProcessorRegistry, StandardProcessors};
pub use queue::{QueueHandle, QueueRegistry, QueueStats, StatsSnapshot};
pub use retry::{BackoffKind, BackoffPolicy, RetryConfig, RetryDecision};
pub use runtime::{QueueManager, QueueManagerBuilder, ShutdownToken};
pub use store::{DeadLetter, JobStore, MemoryJobStore, StallReport, Transition};

#[cfg(feature = "redis")]
pub use store::RedisJobStore;
