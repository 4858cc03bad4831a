use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};

use crate::error::ProcessorError;
use crate::job::JobPayload;
use crate::processor::{JobContext, Processor};

/// Deletes a tenant's data older than a cutoff. Returns rows removed.
#[async_trait]
pub trait RetentionTarget: Send + Sync + 'static {
    async fn delete_before(&self, tenant_id: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
}

#[derive(Clone, Debug, Default)]
pub struct LogRetentionTarget;

#[async_trait]
impl RetentionTarget for LogRetentionTarget {
    async fn delete_before(&self, tenant_id: &str, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        tracing::info!(tenant_id, cutoff = %cutoff, "retention cleanup requested");
        Ok(0)
    }
}

/// `now - days`, clamped to the earliest representable instant.
fn cutoff_for(days: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    Duration::try_days(i64::from(days))
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Purges data older than the job's cutoff through a [`RetentionTarget`].
///
/// Failures are retryable. A target that knows a request can never succeed
/// returns [`ProcessorError::permanent`] wrapped in its `anyhow::Error`.
#[derive(Clone, Debug)]
pub struct CleanupProcessor<T> {
    target: T,
}

impl<T: RetentionTarget> CleanupProcessor<T> {
    pub fn new(target: T) -> Self {
        Self { target }
    }
}

#[async_trait]
impl<T: RetentionTarget> Processor for CleanupProcessor<T> {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError> {
        let JobPayload::Cleanup(cleanup) = &job.payload else {
            return Err(job.unexpected_payload());
        };
        if cleanup.older_than_days == 0 {
            return Err(ProcessorError::retryable("older_than_days must be at least 1"));
        }

        let cutoff = cutoff_for(cleanup.older_than_days, Utc::now());
        let deleted = self.target.delete_before(&cleanup.tenant_id, cutoff).await?;
        Ok(serde_json::json!({
            "tenant_id": cleanup.tenant_id,
            "deleted": deleted,
            "cutoff": cutoff.to_rfc3339_opts(SecondsFormat::Millis, true),
        }))
    }
}
