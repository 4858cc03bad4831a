//! Payload fixtures, one constructor per queue.

use chrono::Utc;
use conveyor::{
    AiJob, AnalyticsJob, BroadcastJob, CleanupJob, EmailJob, JobPayload, QueueName, WebhookJob,
};

pub fn email(to: &str) -> JobPayload {
    JobPayload::Email(EmailJob {
        to: to.to_string(),
        subject: "Welcome aboard".into(),
        template: Some("welcome".into()),
        variables: serde_json::json!({ "name": "Ada" }),
        tenant_id: Some("acme".into()),
    })
}

pub fn webhook(url: &str) -> JobPayload {
    JobPayload::Webhook(webhook_job(url, None))
}

pub fn signed_webhook(url: &str, secret: &str) -> JobPayload {
    JobPayload::Webhook(webhook_job(url, Some(secret)))
}

fn webhook_job(url: &str, secret: Option<&str>) -> WebhookJob {
    WebhookJob {
        url: url.to_string(),
        event: "user.created".into(),
        data: serde_json::json!({ "user_id": 42 }),
        secret: secret.map(str::to_string),
        timeout_ms: Some(2_000),
    }
}

pub fn analytics(tenant_id: &str, amount: u64) -> JobPayload {
    JobPayload::Analytics(AnalyticsJob {
        tenant_id: tenant_id.to_string(),
        metric: "api_calls".into(),
        amount,
        occurred_at: Utc::now(),
    })
}

pub fn broadcast(recipients: &[&str]) -> JobPayload {
    JobPayload::Broadcast(BroadcastJob {
        channel: "status".into(),
        message: "Scheduled maintenance tonight".into(),
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
    })
}

pub fn ai(prompt: &str) -> JobPayload {
    JobPayload::Ai(AiJob {
        tenant_id: "acme".into(),
        model: "small".into(),
        prompt: prompt.to_string(),
        max_tokens: Some(64),
    })
}

pub fn cleanup(older_than_days: u32) -> JobPayload {
    JobPayload::Cleanup(CleanupJob {
        tenant_id: "acme".into(),
        older_than_days,
    })
}

/// A valid payload for any queue.
pub fn for_queue(queue: QueueName) -> JobPayload {
    match queue {
        QueueName::Email => email("ada@example.test"),
        QueueName::Webhook => webhook("http://127.0.0.1:9/hook"),
        QueueName::Analytics => analytics("acme", 1),
        QueueName::Broadcast => broadcast(&["ops"]),
        QueueName::Ai => ai("summarize the release notes"),
        QueueName::Cleanup => cleanup(30),
    }
}
