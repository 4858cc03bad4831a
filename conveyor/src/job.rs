use std::fmt::{self, Display};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::retry::BackoffPolicy;

/// Unique job identifier, assigned at enqueue time.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    /// Time-ordered id, so sorting ids approximates enqueue order.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The fixed set of queues the engine runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Email,
    Webhook,
    Analytics,
    Broadcast,
    Ai,
    Cleanup,
}

impl QueueName {
    pub const ALL: [QueueName; 6] = [
        QueueName::Email,
        QueueName::Webhook,
        QueueName::Analytics,
        QueueName::Broadcast,
        QueueName::Ai,
        QueueName::Cleanup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Email => "email",
            QueueName::Webhook => "webhook",
            QueueName::Analytics => "analytics",
            QueueName::Broadcast => "broadcast",
            QueueName::Ai => "ai",
            QueueName::Cleanup => "cleanup",
        }
    }
}

impl Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name one of the engine's queues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown queue name: {0}")]
pub struct ParseQueueNameError(pub String);

impl FromStr for QueueName {
    type Err = ParseQueueNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| ParseQueueNameError(s.to_string()))
    }
}

/// Job lifecycle states.
///
/// `Waiting -> Active -> {Completed | Delayed | Failed}` and
/// `Delayed -> Waiting` once the retry delay has elapsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(anyhow::anyhow!("invalid job state: {other}")),
        }
    }
}

/// Payload for the `email` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmailJob {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Payload for the `webhook` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookJob {
    pub url: String,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Sent verbatim as `X-Webhook-Secret` when present.
    #[serde(default)]
    pub secret: Option<String>,
    /// Overrides the dispatcher's default request timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Payload for the `analytics` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsJob {
    pub tenant_id: String,
    pub metric: String,
    pub amount: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Payload for the `broadcast` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BroadcastJob {
    pub channel: String,
    pub message: String,
    pub recipients: Vec<String>,
}

/// Payload for the `ai` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AiJob {
    pub tenant_id: String,
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Payload for the `cleanup` queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CleanupJob {
    pub tenant_id: String,
    /// Data strictly older than `now - older_than_days` is deleted.
    pub older_than_days: u32,
}

/// Typed job payload, one variant per queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queue", content = "data", rename_all = "snake_case")]
pub enum JobPayload {
    Email(EmailJob),
    Webhook(WebhookJob),
    Analytics(AnalyticsJob),
    Broadcast(BroadcastJob),
    Ai(AiJob),
    Cleanup(CleanupJob),
}

impl JobPayload {
    /// The queue this payload is processed on.
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::Email(_) => QueueName::Email,
            JobPayload::Webhook(_) => QueueName::Webhook,
            JobPayload::Analytics(_) => QueueName::Analytics,
            JobPayload::Broadcast(_) => QueueName::Broadcast,
            JobPayload::Ai(_) => QueueName::Ai,
            JobPayload::Cleanup(_) => QueueName::Cleanup,
        }
    }
}

/// Per-job overrides for the queue's retry defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
}

impl EnqueueOptions {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }
}

/// The persisted state of a single job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: QueueName,
    pub job_type: String,
    pub payload: JobPayload,
    pub status: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

impl JobRecord {
    /// A fresh `waiting` record.
    pub fn new(
        queue: QueueName,
        job_type: impl Into<String>,
        payload: JobPayload,
        max_attempts: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue,
            job_type: job_type.into(),
            payload,
            status: JobState::Waiting,
            attempts_made: 0,
            max_attempts,
            backoff,
            created_at: Utc::now(),
            last_attempt_at: None,
            next_attempt_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            last_error: None,
        }
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// A fresh copy of a dead-lettered job under a new id.
    pub fn replay(&self) -> Self {
        Self::new(
            self.queue,
            self.job_type.clone(),
            self.payload.clone(),
            self.max_attempts,
            self.backoff,
        )
    }

    pub(crate) fn activate(&mut self, now: DateTime<Utc>) {
        self.status = JobState::Active;
        self.last_attempt_at = Some(now);
        self.next_attempt_at = None;
    }

    pub(crate) fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobState::Completed;
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.result = Some(result);
        self.completed_at = Some(now);
    }

    pub(crate) fn mark_delayed(&mut self, error: &str, next_attempt_at: DateTime<Utc>) {
        self.status = JobState::Delayed;
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.next_attempt_at = Some(next_attempt_at);
    }

    pub(crate) fn mark_failed(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = JobState::Failed;
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.failed_at = Some(now);
    }

    pub(crate) fn promote(&mut self) {
        self.status = JobState::Waiting;
        self.next_attempt_at = None;
    }

    /// Applies stall recovery: counts the lost attempt, then either
    /// requeues or fails the job. Returns the resulting state.
    pub(crate) fn recover_from_stall(&mut self, now: DateTime<Utc>) -> JobState {
        if self.attempts_made.saturating_add(1) >= self.max_attempts {
            self.mark_failed(STALLED_ERROR, now);
        } else {
            self.attempts_made += 1;
            self.status = JobState::Waiting;
            self.last_error = Some(STALLED_ERROR.to_string());
        }
        self.status
    }
}

/// Recorded as `last_error` when stall recovery takes a job away.
pub const STALLED_ERROR: &str = "job stalled: heartbeat expired";
