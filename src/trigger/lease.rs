/// Trigger lease manager
///
/// Keeps webhook subscriptions registered with their providers and turns
/// deliveries into run payloads. Renewal health is published on an unbounded
/// channel so failures never reach the job consumer as panics or errors.

use crate::config::TriggerConfig;
use crate::error::{Result, WorkerError};
use crate::trigger::extract;
use crate::trigger::provider::WebhookProvider;
use crate::trigger::registry::{TriggerEntry, TriggerRegistry};
use crate::trigger::types::{LeaseStatus, RawDelivery, Renewal, RunPayload, TriggerLease, TriggerReport};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Leases expiring within this window are renewed
    pub renewal_window: Duration,
    /// Provider calls per renewal
    pub attempts: u32,
    /// Base delay between provider calls, doubled each time
    pub backoff: Duration,
    /// Failed renewals in a row before a lease is DEGRADED
    pub max_consecutive_failures: u32,
}

impl From<&TriggerConfig> for LeaseSettings {
    fn from(config: &TriggerConfig) -> Self {
        Self {
            renewal_window: Duration::from_secs(config.renewal_window_secs),
            attempts: config.renewal_attempts.max(1),
            backoff: Duration::from_millis(config.renewal_backoff_ms),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
        }
    }
}

/// Counts from one `renew_due` sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalSummary {
    pub renewed: usize,
    pub failed: usize,
    /// Leases still outside the renewal window
    pub fresh: usize,
}

#[derive(Debug, Clone, Copy)]
struct Health {
    consecutive_failures: u32,
    status: LeaseStatus,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            status: LeaseStatus::Active,
        }
    }
}

pub struct TriggerLeaseManager {
    registry: Arc<TriggerRegistry>,
    provider: Arc<dyn WebhookProvider>,
    settings: LeaseSettings,
    reports: mpsc::UnboundedSender<TriggerReport>,
    /// Failure bookkeeping per flow, including flows that never got a lease
    health: Mutex<HashMap<String, Health>>,
}

impl TriggerLeaseManager {
    /// Build the manager and the receiving end of its report channel
    pub fn new(
        registry: Arc<TriggerRegistry>,
        provider: Arc<dyn WebhookProvider>,
        settings: LeaseSettings,
    ) -> (Self, mpsc::UnboundedReceiver<TriggerReport>) {
        let (reports, receiver) = mpsc::unbounded_channel();
        let manager = Self {
            registry,
            provider,
            settings,
            reports,
            health: Mutex::new(HashMap::new()),
        };
        (manager, receiver)
    }

    pub fn registry(&self) -> &Arc<TriggerRegistry> {
        &self.registry
    }

    /// Make sure the flow's webhook lease is live
    ///
    /// An ACTIVE lease outside the renewal window is returned unchanged, so
    /// calling this repeatedly before expiry has no further effect.
    pub async fn renew_webhook(&self, flow_id: &str) -> Result<TriggerLease> {
        let entry = self
            .registry
            .get(flow_id)
            .ok_or_else(|| WorkerError::UnknownTrigger(flow_id.to_string()))?;

        if let Some(lease) = self.fresh_lease(&entry) {
            tracing::debug!("🪝 Lease for flow '{}' valid until {}", flow_id, lease.expires_at);
            return Ok(lease);
        }
        self.renew_entry(&entry).await
    }

    /// Renew every registered trigger that has no lease or is close to expiry
    pub async fn renew_due(&self) -> RenewalSummary {
        let mut summary = RenewalSummary::default();
        for entry in self.registry.entries() {
            if self.fresh_lease(&entry).is_some() {
                summary.fresh += 1;
                continue;
            }
            match self.renew_entry(&entry).await {
                Ok(_) => summary.renewed += 1,
                Err(_) => summary.failed += 1,
            }
        }
        if summary.renewed > 0 || summary.failed > 0 {
            tracing::info!(
                "🪝 Renewal sweep: {} renewed, {} failed, {} fresh",
                summary.renewed,
                summary.failed,
                summary.fresh
            );
        }
        summary
    }

    /// Turn a delivery into run payloads using the flow's trigger definition
    pub fn extract_payloads(&self, delivery: &RawDelivery) -> Result<Vec<RunPayload>> {
        let trigger = self
            .registry
            .trigger(&delivery.flow_id)
            .ok_or_else(|| WorkerError::UnknownTrigger(delivery.flow_id.clone()))?;
        extract::extract(&trigger, delivery)
    }

    fn fresh_lease(&self, entry: &TriggerEntry) -> Option<TriggerLease> {
        let window = chrono::Duration::from_std(self.settings.renewal_window).unwrap_or_else(|_| chrono::Duration::zero());
        entry
            .lease
            .as_ref()
            .filter(|lease| lease.status == LeaseStatus::Active && !lease.expires_within(window, Utc::now()))
            .cloned()
    }

    async fn renew_entry(&self, entry: &TriggerEntry) -> Result<TriggerLease> {
        let flow_id = entry.trigger.flow_id.clone();
        match self.call_provider(entry).await {
            Ok(renewal) => Ok(self.on_success(&flow_id, renewal).await),
            Err(e) => {
                self.on_failure(entry, &e).await;
                Err(WorkerError::RenewalFailed {
                    flow_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Provider call with exponential backoff between attempts
    async fn call_provider(&self, entry: &TriggerEntry) -> Result<Renewal> {
        let mut delay = self.settings.backoff;
        let mut attempt = 1;
        loop {
            match self.provider.renew(&entry.trigger, entry.lease.as_ref()).await {
                Ok(renewal) => return Ok(renewal),
                Err(e) if attempt < self.settings.attempts => {
                    tracing::warn!(
                        "⚠️ Renewal attempt {}/{} for flow '{}' failed: {}",
                        attempt,
                        self.settings.attempts,
                        entry.trigger.flow_id,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn on_success(&self, flow_id: &str, renewal: Renewal) -> TriggerLease {
        let previous = {
            let mut health = self.health.lock().await;
            health.insert(flow_id.to_string(), Health::default()).unwrap_or_default()
        };

        let lease = TriggerLease {
            flow_id: flow_id.to_string(),
            subscription_id: renewal.subscription_id,
            expires_at: renewal.expires_at,
            last_renewed_at: Utc::now(),
            consecutive_failures: 0,
            status: LeaseStatus::Active,
        };
        self.registry.set_lease(lease.clone());

        tracing::info!("🪝 Renewed webhook for flow '{}' until {}", flow_id, lease.expires_at);
        if previous.status == LeaseStatus::Degraded {
            tracing::info!("💚 Webhook lease for flow '{}' recovered", flow_id);
            self.report(TriggerReport::Recovered {
                flow_id: flow_id.to_string(),
            });
        }
        self.report(TriggerReport::Renewed {
            flow_id: flow_id.to_string(),
            expires_at: lease.expires_at,
        });
        lease
    }

    async fn on_failure(&self, entry: &TriggerEntry, error: &WorkerError) {
        let flow_id = &entry.trigger.flow_id;
        let (health, became_degraded) = {
            let mut all = self.health.lock().await;
            let health = all.entry(flow_id.clone()).or_default();
            health.consecutive_failures += 1;
            let became_degraded = health.status == LeaseStatus::Active
                && health.consecutive_failures >= self.settings.max_consecutive_failures;
            if became_degraded {
                health.status = LeaseStatus::Degraded;
            }
            (*health, became_degraded)
        };

        if let Some(lease) = &entry.lease {
            self.registry.set_lease(TriggerLease {
                consecutive_failures: health.consecutive_failures,
                status: health.status,
                ..lease.clone()
            });
        }

        tracing::warn!(
            "⚠️ Renewal for flow '{}' failed ({} in a row): {}",
            flow_id,
            health.consecutive_failures,
            error
        );

        if became_degraded {
            tracing::error!("🚨 Webhook lease for flow '{}' is DEGRADED", flow_id);
            self.report(TriggerReport::Degraded {
                flow_id: flow_id.clone(),
                failures: health.consecutive_failures,
                reason: error.to_string(),
            });
        }
    }

    fn report(&self, report: TriggerReport) {
        if self.reports.send(report).is_err() {
            tracing::debug!("Trigger report dropped, no listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::types::WebhookTrigger;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Provider that counts calls and can be switched to failing
    #[derive(Default)]
    struct FakeProvider {
        calls: AtomicUsize,
        failing: AtomicBool,
        lifetime_secs: i64,
    }

    #[async_trait]
    impl WebhookProvider for FakeProvider {
        async fn renew(&self, trigger: &WebhookTrigger, _current: Option<&TriggerLease>) -> Result<Renewal> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(WorkerError::RenewalFailed {
                    flow_id: trigger.flow_id.clone(),
                    reason: "provider down".into(),
                });
            }
            Ok(Renewal {
                subscription_id: format!("sub-{}", n),
                expires_at: Utc::now() + chrono::Duration::seconds(self.lifetime_secs),
            })
        }
    }

    fn trigger(flow_id: &str) -> WebhookTrigger {
        WebhookTrigger {
            flow_id: flow_id.into(),
            project_id: "acme".into(),
            flow_version_id: "fv-1".into(),
            provider: "github".into(),
            renew_url: "http://localhost/renew".into(),
            items_path: None,
            challenge_field: None,
            verification_header: None,
        }
    }

    fn settings() -> LeaseSettings {
        LeaseSettings {
            renewal_window: Duration::from_secs(3600),
            attempts: 2,
            backoff: Duration::from_millis(1),
            max_consecutive_failures: 2,
        }
    }

    fn manager(provider: Arc<FakeProvider>) -> (TriggerLeaseManager, mpsc::UnboundedReceiver<TriggerReport>) {
        let registry = Arc::new(TriggerRegistry::new());
        registry.upsert(trigger("flow-a"));
        TriggerLeaseManager::new(registry, provider, settings())
    }

    #[tokio::test]
    async fn renewing_a_fresh_lease_is_idempotent() {
        let provider = Arc::new(FakeProvider {
            lifetime_secs: 86_400,
            ..Default::default()
        });
        let (manager, mut reports) = manager(provider.clone());

        let first = manager.renew_webhook("flow-a").await.unwrap();
        let second = manager.renew_webhook("flow-a").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(reports.try_recv(), Ok(TriggerReport::Renewed { .. })));
        assert!(reports.try_recv().is_err());
    }

    #[tokio::test]
    async fn leases_inside_the_window_are_renewed() {
        let provider = Arc::new(FakeProvider {
            lifetime_secs: 60,
            ..Default::default()
        });
        let (manager, _reports) = manager(provider.clone());

        manager.renew_webhook("flow-a").await.unwrap();
        let summary = manager.renew_due().await;
        assert_eq!(summary, RenewalSummary { renewed: 1, failed: 0, fresh: 0 });
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn degrades_once_and_recovers() {
        let provider = Arc::new(FakeProvider {
            lifetime_secs: 60,
            ..Default::default()
        });
        let (manager, mut reports) = manager(provider.clone());
        manager.renew_webhook("flow-a").await.unwrap();
        assert!(matches!(reports.try_recv(), Ok(TriggerReport::Renewed { .. })));

        provider.failing.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            assert!(manager.renew_webhook("flow-a").await.is_err());
        }
        let lease = manager.registry().lease("flow-a").unwrap();
        assert_eq!(lease.status, LeaseStatus::Degraded);
        assert_eq!(lease.consecutive_failures, 3);

        // Exactly one Degraded report for the transition
        assert!(matches!(reports.try_recv(), Ok(TriggerReport::Degraded { failures: 2, .. })));
        assert!(reports.try_recv().is_err());

        provider.failing.store(false, Ordering::SeqCst);
        let lease = manager.renew_webhook("flow-a").await.unwrap();
        assert_eq!(lease.status, LeaseStatus::Active);
        assert_eq!(lease.consecutive_failures, 0);
        assert!(matches!(reports.try_recv(), Ok(TriggerReport::Recovered { .. })));
        assert!(matches!(reports.try_recv(), Ok(TriggerReport::Renewed { .. })));
    }

    #[tokio::test]
    async fn unknown_flows_are_rejected() {
        let (manager, _reports) = manager(Arc::new(FakeProvider::default()));
        assert!(matches!(manager.renew_webhook("ghost").await, Err(WorkerError::UnknownTrigger(_))));

        let delivery = RawDelivery {
            flow_id: "ghost".into(),
            ..Default::default()
        };
        assert!(matches!(manager.extract_payloads(&delivery), Err(WorkerError::UnknownTrigger(_))));
    }

    #[tokio::test]
    async fn extracts_through_registered_trigger() {
        let (manager, _reports) = manager(Arc::new(FakeProvider::default()));
        let delivery = RawDelivery {
            flow_id: "flow-a".into(),
            body: serde_json::json!({ "x": 1 }),
            ..Default::default()
        };
        let payloads = manager.extract_payloads(&delivery).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].project_id, "acme");
    }
}
