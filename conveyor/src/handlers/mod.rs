//! Processors for the six standard queues.
//!
//! Each processor delegates side effects to a small collaborator trait. The
//! processors report every failure as retryable; a collaborator opts a
//! failure into permanence by returning a wrapped
//! [`ProcessorError::Permanent`](crate::ProcessorError::Permanent).

pub mod ai;
pub mod analytics;
pub mod broadcast;
pub mod cleanup;
pub mod email;
pub mod webhook;

pub use ai::{AiProcessor, EchoInferenceClient, InferenceClient, InferenceOutput};
pub use analytics::{AnalyticsProcessor, InMemoryUsageSink, UsageSink};
pub use broadcast::{BroadcastProcessor, ChannelSender, LogChannelSender};
pub use cleanup::{CleanupProcessor, LogRetentionTarget, RetentionTarget};
pub use email::{EmailProcessor, LogMailTransport, MailTransport};
pub use webhook::WebhookDispatcher;

use crate::config::WebhookConfig;
use crate::processor::{ProcessorRegistry, StandardProcessors};

/// Registry with the built-in processors backed by the logging collaborators.
pub fn default_registry(webhook: &WebhookConfig) -> anyhow::Result<ProcessorRegistry> {
    Ok(StandardProcessors {
        email: EmailProcessor::new(LogMailTransport),
        webhook: WebhookDispatcher::new(webhook)?,
        analytics: AnalyticsProcessor::new(InMemoryUsageSink::new()),
        broadcast: BroadcastProcessor::new(LogChannelSender),
        ai: AiProcessor::new(EchoInferenceClient),
        cleanup: CleanupProcessor::new(LogRetentionTarget),
    }
    .into_registry())
}
