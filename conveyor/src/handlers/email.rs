use async_trait::async_trait;

use crate::error::ProcessorError;
use crate::job::{EmailJob, JobPayload};
use crate::processor::{JobContext, Processor};

/// Sends a rendered email; returns the provider's message id.
///
/// Errors are retried. Return [`ProcessorError::permanent`] inside the
/// `anyhow::Error` for failures a retry cannot fix, such as a hard bounce.
#[async_trait]
pub trait MailTransport: Send + Sync + 'static {
    async fn send(&self, email: &EmailJob) -> anyhow::Result<String>;
}

/// Logs instead of sending. Used when no provider is wired in.
#[derive(Clone, Debug, Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn send(&self, email: &EmailJob) -> anyhow::Result<String> {
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            template = email.template.as_deref().unwrap_or("none"),
            "email send requested"
        );
        Ok(format!("log-{}", uuid::Uuid::now_v7()))
    }
}

#[derive(Clone, Debug)]
pub struct EmailProcessor<T> {
    transport: T,
}

impl<T: MailTransport> EmailProcessor<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: MailTransport> Processor for EmailProcessor<T> {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError> {
        let JobPayload::Email(email) = &job.payload else {
            return Err(job.unexpected_payload());
        };
        if !email.to.contains('@') {
            return Err(ProcessorError::retryable(format!(
                "invalid recipient address: {}",
                email.to
            )));
        }

        let message_id = self.transport.send(email).await?;
        Ok(serde_json::json!({ "message_id": message_id }))
    }
}
