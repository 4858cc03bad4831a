use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{JobId, JobRecord, QueueName};

/// Unique identifier for a job lease.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    /// Create a new lease ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LeaseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// An executor's claim on an active job.
///
/// Every transition out of `active` must present the lease; the store
/// rejects it once the job has been reclaimed by stall recovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    pub lease_id: LeaseId,
    pub worker_id: String,
    /// Snapshot of the record taken at claim time, already marked active.
    pub job: JobRecord,
    pub claimed_at: DateTime<Utc>,
}

impl JobLease {
    pub fn new(job: JobRecord, worker_id: impl Into<String>) -> Self {
        Self {
            lease_id: LeaseId::new(),
            worker_id: worker_id.into(),
            job,
            claimed_at: Utc::now(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn queue(&self) -> QueueName {
        self.job.queue
    }

    /// 1-based number of the attempt this lease executes.
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made.saturating_add(1)
    }
}

/// Cutoff below which a heartbeat counts as stalled.
pub fn stall_cutoff(now: DateTime<Utc>, threshold: std::time::Duration) -> DateTime<Utc> {
    let threshold = Duration::from_std(threshold).unwrap_or_else(|_| Duration::days(36_500));
    now.checked_sub_signed(threshold)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Whether a heartbeat recorded at `last_beat` is older than `cutoff`.
pub fn is_stalled(last_beat: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    last_beat < cutoff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CleanupJob, JobPayload};
    use crate::retry::BackoffPolicy;

    fn record() -> JobRecord {
        JobRecord::new(
            QueueName::Cleanup,
            "purge",
            JobPayload::Cleanup(CleanupJob {
                tenant_id: "t".into(),
                older_than_days: 7,
            }),
            3,
            BackoffPolicy::default(),
        )
    }

    #[test]
    fn test_lease_id_display_round_trip() {
        let id = LeaseId::new();
        let parsed: LeaseId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_attempt_number_is_one_based() {
        let mut job = record();
        let lease = JobLease::new(job.clone(), "cleanup-0");
        assert_eq!(lease.attempt(), 1);
        job.attempts_made = 2;
        let lease = JobLease::new(job, "cleanup-0");
        assert_eq!(lease.attempt(), 3);
        assert_eq!(lease.queue(), QueueName::Cleanup);
    }

    #[test]
    fn test_stall_cutoff() {
        let now = Utc::now();
        let cutoff = stall_cutoff(now, std::time::Duration::from_secs(30));
        assert_eq!(now - cutoff, Duration::seconds(30));
        assert!(is_stalled(now - Duration::seconds(31), cutoff));
        assert!(!is_stalled(now - Duration::seconds(29), cutoff));
    }
}
