/// Webhook provider capability
///
/// Extends an external webhook subscription. The HTTP backend POSTs to the
/// trigger's renewal URL and expects the new subscription id and expiry back.

use crate::error::{Result, WorkerError};
use crate::trigger::types::{Renewal, TriggerLease, WebhookTrigger};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait WebhookProvider: Send + Sync {
    /// Register or extend the subscription; `current` is the existing lease, if any
    async fn renew(&self, trigger: &WebhookTrigger, current: Option<&TriggerLease>) -> Result<Renewal>;
}

/// Provider reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpWebhookProvider {
    client: reqwest::Client,
}

impl HttpWebhookProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookProvider for HttpWebhookProvider {
    async fn renew(&self, trigger: &WebhookTrigger, current: Option<&TriggerLease>) -> Result<Renewal> {
        let body = json!({
            "flow_id": trigger.flow_id,
            "project_id": trigger.project_id,
            "subscription_id": current.map(|lease| lease.subscription_id.clone()),
        });

        tracing::debug!("🌍 Renewing '{}' webhook for flow '{}' at {}", trigger.provider, trigger.flow_id, trigger.renew_url);

        let response = self
            .client
            .post(&trigger.renew_url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WorkerError::RenewalFailed {
                flow_id: trigger.flow_id.clone(),
                reason: format!("provider answered {}: {}", status, text),
            });
        }

        let renewal: Renewal = response.json().await?;
        Ok(renewal)
    }
}
