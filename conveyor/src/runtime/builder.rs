use std::fmt;
use std::sync::Arc;

use crate::config::{EngineConfig, QueueOptions};
use crate::events::InProcEventBus;
use crate::job::QueueName;
use crate::queue::QueueRegistry;
use crate::store::JobStore;

use super::manager::QueueManager;

/// Builder for a [`QueueManager`] with explicit dependencies.
///
/// The store is required. The event bus defaults to one sized by
/// `EngineConfig::event_capacity`.
///
/// # Example
///
/// ```ignore
/// let manager = QueueManagerBuilder::new()
///     .with_config(EngineConfig::from_env())
///     .with_store(Arc::new(MemoryJobStore::new()))
///     .with_standard_queues()
///     .build()?;
/// manager.start(default_registry(&WebhookConfig::from_env())?).await?;
/// ```
#[derive(Default)]
pub struct QueueManagerBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn JobStore>>,
    events: Option<Arc<InProcEventBus>>,
    queues: Vec<(QueueName, QueueOptions)>,
}

impl fmt::Debug for QueueManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManagerBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("events_set", &self.events.is_some())
            .field("queues", &self.queues.iter().map(|(name, _)| *name).collect::<Vec<_>>())
            .finish()
    }
}

impl QueueManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing event bus instead of creating one.
    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Define `name` with `options` layered over its standard settings.
    pub fn with_queue(mut self, name: QueueName, options: QueueOptions) -> Self {
        self.queues.push((name, options));
        self
    }

    /// Define all six queues with their standard settings.
    pub fn with_standard_queues(mut self) -> Self {
        self.queues
            .extend(QueueName::ALL.iter().map(|name| (*name, QueueOptions::default())));
        self
    }

    /// # Errors
    ///
    /// Returns an error if the store is missing or a queue's options are invalid.
    pub fn build(self) -> anyhow::Result<QueueManager> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(InProcEventBus::new(self.config.event_capacity)));

        let registry = QueueRegistry::new();
        for (name, options) in &self.queues {
            registry.define(*name, options)?;
        }

        Ok(QueueManager::new(store, registry, events, self.config))
    }
}
