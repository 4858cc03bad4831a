use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ProcessorError;
use crate::job::{AnalyticsJob, JobId, JobPayload};
use crate::processor::{JobContext, Processor};

/// Records usage for a tenant.
///
/// Returns `false` when `job_id` was already recorded, so redelivered jobs
/// are counted once.
#[async_trait]
pub trait UsageSink: Send + Sync + 'static {
    async fn record(&self, job_id: JobId, usage: &AnalyticsJob) -> anyhow::Result<bool>;
}

#[derive(Debug, Default)]
struct UsageState {
    seen: HashSet<JobId>,
    totals: HashMap<(String, String), u64>,
}

/// Aggregates usage in memory, keyed by tenant and metric.
#[derive(Debug, Default)]
pub struct InMemoryUsageSink {
    state: Mutex<UsageState>,
}

impl InMemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self, tenant_id: &str, metric: &str) -> u64 {
        self.state
            .lock()
            .totals
            .get(&(tenant_id.to_string(), metric.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl UsageSink for InMemoryUsageSink {
    async fn record(&self, job_id: JobId, usage: &AnalyticsJob) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        if !state.seen.insert(job_id) {
            return Ok(false);
        }
        let total = state
            .totals
            .entry((usage.tenant_id.clone(), usage.metric.clone()))
            .or_insert(0);
        *total = total.saturating_add(usage.amount);
        Ok(true)
    }
}

#[derive(Debug)]
pub struct AnalyticsProcessor<S> {
    sink: S,
}

impl<S: UsageSink> AnalyticsProcessor<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

#[async_trait]
impl<S: UsageSink> Processor for AnalyticsProcessor<S> {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError> {
        let JobPayload::Analytics(usage) = &job.payload else {
            return Err(job.unexpected_payload());
        };
        if usage.tenant_id.is_empty() || usage.metric.is_empty() {
            return Err(ProcessorError::retryable("usage event needs a tenant and a metric"));
        }

        let recorded = self.sink.record(job.id, usage).await?;
        if !recorded {
            tracing::debug!(job_id = %job.id, "usage already recorded, skipping");
        }
        Ok(serde_json::json!({
            "tenant_id": usage.tenant_id,
            "metric": usage.metric,
            "recorded": recorded,
        }))
    }
}
