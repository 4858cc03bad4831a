//! Outbound webhook delivery.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, Url};
use serde::Serialize;

use crate::config::WebhookConfig;
use crate::error::ProcessorError;
use crate::job::{JobPayload, WebhookJob};
use crate::processor::{JobContext, Processor};

pub const SECRET_HEADER: &str = "X-Webhook-Secret";

#[derive(Serialize)]
struct WebhookBody<'a> {
    event: &'a str,
    data: &'a serde_json::Value,
    timestamp: String,
}

/// POSTs `{event, data, timestamp}` to the job's URL.
///
/// Any 2xx status is a success. Every failure is retryable, including a URL
/// that cannot be parsed or uses a scheme other than http(s).
#[derive(Clone, Debug)]
pub struct WebhookDispatcher {
    client: Client,
    default_timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(config: &WebhookConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(16)
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &WebhookConfig) -> Self {
        Self {
            client,
            default_timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Delivers one webhook and returns the response status code.
    pub async fn dispatch(&self, job: &WebhookJob) -> Result<u16, ProcessorError> {
        let url = Url::parse(&job.url)
            .map_err(|err| ProcessorError::retryable(format!("invalid webhook url {}: {err}", job.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ProcessorError::retryable(format!(
                "unsupported webhook url scheme: {}",
                url.scheme()
            )));
        }

        let timeout = job
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let body = WebhookBody {
            event: &job.event,
            data: &job.data,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let mut request = self.client.post(url).timeout(timeout).json(&body);
        if let Some(secret) = &job.secret {
            request = request.header(SECRET_HEADER, secret);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                tracing::info!(
                    url = %job.url,
                    event = %job.event,
                    status_code = status,
                    "webhook delivered"
                );
                if response.status().is_success() {
                    Ok(status)
                } else {
                    Err(ProcessorError::retryable(format!(
                        "webhook returned HTTP {status}"
                    )))
                }
            }
            Err(err) if err.is_timeout() => {
                tracing::warn!(
                    url = %job.url,
                    timeout_ms = timeout.as_millis() as u64,
                    "webhook timed out"
                );
                Err(ProcessorError::retryable(format!(
                    "webhook timed out after {} ms",
                    timeout.as_millis()
                )))
            }
            Err(err) => {
                tracing::warn!(url = %job.url, error = %err, "webhook request failed");
                Err(ProcessorError::retryable(format!(
                    "webhook request failed: {err}"
                )))
            }
        }
    }
}

#[async_trait]
impl Processor for WebhookDispatcher {
    async fn process(&self, job: JobContext) -> Result<serde_json::Value, ProcessorError> {
        let JobPayload::Webhook(webhook) = &job.payload else {
            return Err(job.unexpected_payload());
        };
        let status = self.dispatch(webhook).await?;
        Ok(serde_json::json!({ "status": status }))
    }
}
