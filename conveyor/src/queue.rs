use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::{QueueOptions, QueueSettings};
use crate::error::EngineError;
use crate::job::{JobState, QueueName};

/// Handle to a defined queue.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueHandle {
    pub name: QueueName,
    pub settings: QueueSettings,
}

/// Defined queues and their resolved settings.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<QueueName, QueueSettings>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define `name`, or merge `options` into its existing settings.
    ///
    /// A new queue starts from [`QueueSettings::standard`].
    pub fn define(&self, name: QueueName, options: &QueueOptions) -> Result<QueueHandle, EngineError> {
        let mut queues = self.queues.write();
        let base = queues
            .get(&name)
            .cloned()
            .unwrap_or_else(|| QueueSettings::standard(name));
        let settings = base.merge(options)?;
        queues.insert(name, settings.clone());
        Ok(QueueHandle { name, settings })
    }

    pub fn get(&self, name: QueueName) -> Option<QueueSettings> {
        self.queues.read().get(&name).cloned()
    }

    pub fn require(&self, name: QueueName) -> Result<QueueSettings, EngineError> {
        self.get(name).ok_or(EngineError::UnknownQueue(name))
    }

    /// Defined queue names in a stable order.
    pub fn names(&self) -> Vec<QueueName> {
        let mut names: Vec<QueueName> = self.queues.read().keys().copied().collect();
        names.sort();
        names
    }

    pub fn all(&self) -> Vec<QueueSettings> {
        let queues = self.queues.read();
        let mut all: Vec<QueueSettings> = queues.values().cloned().collect();
        all.sort_by_key(|settings| settings.name);
        all
    }
}

/// Per-state job counters for one queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }

    pub fn by_state(&self) -> [(JobState, u64); 5] {
        [
            (JobState::Waiting, self.waiting),
            (JobState::Active, self.active),
            (JobState::Delayed, self.delayed),
            (JobState::Completed, self.completed),
            (JobState::Failed, self.failed),
        ]
    }
}

/// Stats of every defined queue at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queues: BTreeMap<QueueName, QueueStats>,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl StatsSnapshot {
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            queues: BTreeMap::new(),
        }
    }

    pub fn get(&self, queue: QueueName) -> Option<&QueueStats> {
        self.queues.get(&queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffPolicy;

    #[test]
    fn test_define_starts_from_standard_settings() {
        let registry = QueueRegistry::new();
        let handle = registry
            .define(QueueName::Webhook, &QueueOptions::default())
            .unwrap();
        assert_eq!(handle.settings, QueueSettings::standard(QueueName::Webhook));
        assert_eq!(registry.names(), vec![QueueName::Webhook]);
    }

    #[test]
    fn test_redefining_merges_into_existing() {
        let registry = QueueRegistry::new();
        registry
            .define(QueueName::Email, &QueueOptions::default().concurrency(2))
            .unwrap();
        let handle = registry
            .define(
                QueueName::Email,
                &QueueOptions::default().backoff(BackoffPolicy::fixed(50)),
            )
            .unwrap();
        assert_eq!(handle.settings.concurrency, 2);
        assert_eq!(handle.settings.default_backoff, BackoffPolicy::fixed(50));
        assert_eq!(registry.get(QueueName::Email), Some(handle.settings));
    }

    #[test]
    fn test_invalid_redefinition_keeps_previous_settings() {
        let registry = QueueRegistry::new();
        registry
            .define(QueueName::Ai, &QueueOptions::default().concurrency(4))
            .unwrap();
        assert!(registry
            .define(QueueName::Ai, &QueueOptions::default().concurrency(0))
            .is_err());
        assert_eq!(registry.require(QueueName::Ai).unwrap().concurrency, 4);
    }

    #[test]
    fn test_require_unknown_queue() {
        let registry = QueueRegistry::new();
        assert!(matches!(
            registry.require(QueueName::Cleanup),
            Err(EngineError::UnknownQueue(QueueName::Cleanup))
        ));
    }

    #[test]
    fn test_stats_total() {
        let stats = QueueStats {
            waiting: 1,
            active: 2,
            completed: 3,
            failed: 4,
            delayed: 5,
        };
        assert_eq!(stats.total(), 15);
        assert_eq!(stats.by_state().iter().map(|(_, n)| n).sum::<u64>(), 15);
    }

    #[test]
    fn test_snapshot_serializes_queue_names_as_keys() {
        let mut snapshot = StatsSnapshot::default();
        snapshot.queues.insert(QueueName::Broadcast, QueueStats::default());
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["queues"]["broadcast"]["waiting"], 0);
    }
}
