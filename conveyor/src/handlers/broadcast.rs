use anyhow::Context;
use async_trait::async_trait;

use crate::error::ProcessorError;
use crate::job::JobPayload;
use crate::processor::{JobContext, Processor};

/// Delivers one message to one recipient on a channel.
#[async_trait]
pub trait ChannelSender: Send + Sync + 'static {
    async fn send(&self, channel: &str, recipient: &str, message: &str) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct LogChannelSender;

#[async_trait]
impl ChannelSender for LogChannelSender {
    async fn send(&self, channel: &str, recipient: &str, message: &str) -> anyhow::Result<()> {
        tracing::info!(
            channel,
            recipient,
            message_len = message.len(),
            "broadcast message sent"
        );
        Ok(())
    }
}

/// Fans a message out to every recipient in order.
///
/// A failed send fails the whole attempt; recipients reached before the
/// failure will receive the message again on retry.
#[derive(Clone, Debug)]
pub struct BroadcastProcessor<S> {
    sender: S,
}

impl<S: ChannelSender> BroadcastProcessor<S> {
    pub fn new(sender: S) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl<S: ChannelSender> Processor for BroadcastProcessor<S> {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError> {
        let JobPayload::Broadcast(broadcast) = &job.payload else {
            return Err(job.unexpected_payload());
        };
        if broadcast.channel.is_empty() {
            return Err(ProcessorError::retryable("broadcast channel is empty"));
        }

        let total = broadcast.recipients.len();
        for (delivered, recipient) in broadcast.recipients.iter().enumerate() {
            self.sender
                .send(&broadcast.channel, recipient, &broadcast.message)
                .await
                .with_context(|| format!("delivered {delivered} of {total}, failed on {recipient}"))?;
        }

        Ok(serde_json::json!({
            "channel": broadcast.channel,
            "delivered": total,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BroadcastJob, JobRecord, QueueName};
    use crate::retry::BackoffPolicy;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl ChannelSender for Recording {
        async fn send(&self, _channel: &str, recipient: &str, _message: &str) -> anyhow::Result<()> {
            if self.fail_on == Some(recipient) {
                anyhow::bail!("rate limited");
            }
            self.sent.lock().push(recipient.to_string());
            Ok(())
        }
    }

    fn context(recipients: &[&str]) -> JobContext {
        let record = JobRecord::new(
            QueueName::Broadcast,
            "announce",
            JobPayload::Broadcast(BroadcastJob {
                channel: "status".into(),
                message: "maintenance at noon".into(),
                recipients: recipients.iter().map(|r| r.to_string()).collect(),
            }),
            3,
            BackoffPolicy::default(),
        );
        JobContext::from_record(&record, 1)
    }

    #[tokio::test]
    async fn test_delivers_to_every_recipient() {
        let processor = BroadcastProcessor::new(Recording::default());
        let value = processor.process(context(&["a", "b", "c"])).await.unwrap();
        assert_eq!(value["delivered"], 3);
        assert_eq!(*processor.sender.sent.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_partial_failure_is_retryable_with_progress() {
        let processor = BroadcastProcessor::new(Recording {
            fail_on: Some("b"),
            ..Default::default()
        });
        let err = processor.process(context(&["a", "b", "c"])).await.unwrap_err();
        assert!(!err.is_permanent());
        assert_eq!(err.to_string(), "delivered 1 of 3, failed on b: rate limited");
    }
}
