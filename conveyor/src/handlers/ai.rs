use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProcessorError;
use crate::job::{AiJob, JobPayload};
use crate::processor::{JobContext, Processor};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub text: String,
    pub tokens_used: u32,
}

/// Runs a model request.
#[async_trait]
pub trait InferenceClient: Send + Sync + 'static {
    async fn complete(&self, request: &AiJob) -> anyhow::Result<InferenceOutput>;
}

/// Returns the prompt back, cut to `max_tokens` whitespace-separated words.
#[derive(Clone, Debug, Default)]
pub struct EchoInferenceClient;

#[async_trait]
impl InferenceClient for EchoInferenceClient {
    async fn complete(&self, request: &AiJob) -> anyhow::Result<InferenceOutput> {
        let limit = request.max_tokens.map(|n| n as usize).unwrap_or(usize::MAX);
        let words: Vec<&str> = request.prompt.split_whitespace().take(limit).collect();
        Ok(InferenceOutput {
            text: words.join(" "),
            tokens_used: words.len() as u32,
        })
    }
}

#[derive(Clone, Debug)]
pub struct AiProcessor<C> {
    client: C,
}

impl<C: InferenceClient> AiProcessor<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: InferenceClient> Processor for AiProcessor<C> {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError> {
        let JobPayload::Ai(request) = &job.payload else {
            return Err(job.unexpected_payload());
        };
        if request.prompt.trim().is_empty() {
            return Err(ProcessorError::retryable("prompt is empty"));
        }
        if request.max_tokens == Some(0) {
            return Err(ProcessorError::retryable("max_tokens must be positive"));
        }

        let output = self.client.complete(request).await?;
        tracing::debug!(
            job_id = %job.id,
            model = %request.model,
            tokens_used = output.tokens_used,
            "inference finished"
        );
        Ok(serde_json::json!({
            "model": request.model,
            "text": output.text,
            "tokens_used": output.tokens_used,
        }))
    }
}
