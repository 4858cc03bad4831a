use crate::job::{JobId, QueueName};

/// Errors surfaced by the public [`QueueManager`](crate::runtime::QueueManager) API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The job store could not be reached or rejected the operation.
    #[error("job store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
    #[error("queue `{0}` has not been defined")]
    UnknownQueue(QueueName),
    #[error("payload for queue `{payload}` cannot be enqueued on `{queue}`")]
    PayloadMismatch { queue: QueueName, payload: QueueName },
    #[error("invalid options for queue `{queue}`: {reason}")]
    InvalidOptions { queue: QueueName, reason: String },
    #[error("no processor registered for queue `{0}`")]
    MissingProcessor(QueueName),
    #[error("engine is already running")]
    AlreadyRunning,
    #[error("dead letter {id} not found on queue `{queue}`")]
    DeadLetterNotFound { queue: QueueName, id: JobId },
}

impl EngineError {
    pub(crate) fn store(err: anyhow::Error) -> Self {
        EngineError::StoreUnavailable(err)
    }
}

/// Failure returned by a processor.
///
/// The built-in handlers only produce `Retryable`. Whoever knows a failure is
/// final (a handler author, or a collaborator behind one) returns `Permanent`,
/// either directly or wrapped in an `anyhow::Error`. The retry scheduler only
/// looks at the variant.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// Transient failure, the job is retried while attempts remain.
    #[error("{0}")]
    Retryable(String),
    /// The job can never succeed; remaining attempts are skipped.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ProcessorError {
    pub fn retryable(message: impl Into<String>) -> Self {
        ProcessorError::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProcessorError::Permanent(message.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ProcessorError::Permanent(_))
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ProcessorError>() {
            Ok(classified) => classified,
            Err(err) => ProcessorError::Retryable(format!("{err:#}")),
        }
    }
}
