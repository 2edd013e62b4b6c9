/// Background webhook renewal service
///
/// Drives `TriggerLeaseManager::renew_due` from a repeated tokio-cron-scheduler
/// job, independent of job processing. Each tick first refreshes the trigger
/// registry from the flow store so newly published triggers get leases.

use crate::error::{Result, WorkerError};
use crate::flow::FlowStore;
use crate::trigger::lease::TriggerLeaseManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

fn scheduler_error(e: JobSchedulerError) -> WorkerError {
    WorkerError::Runtime(format!("renewal scheduler: {}", e))
}

pub struct RenewalScheduler {
    scheduler: Arc<RwLock<JobScheduler>>,
    job_uuid: RwLock<Option<Uuid>>,
    manager: Arc<TriggerLeaseManager>,
    store: Arc<dyn FlowStore>,
    interval: Duration,
}

impl RenewalScheduler {
    pub async fn new(manager: Arc<TriggerLeaseManager>, store: Arc<dyn FlowStore>, interval: Duration) -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        Ok(Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            job_uuid: RwLock::new(None),
            manager,
            store,
            interval: interval.max(Duration::from_secs(1)),
        })
    }

    /// One sweep: reload triggers, then renew whatever is due
    pub async fn tick(manager: &TriggerLeaseManager, store: &dyn FlowStore) {
        if let Err(e) = manager.registry().load_from(store).await {
            tracing::warn!("⚠️ Could not refresh webhook triggers: {}", e);
        }
        manager.renew_due().await;
    }

    /// Run an immediate sweep and schedule the repeated one
    pub async fn start(&self) -> Result<()> {
        tracing::info!("⏰ Starting webhook renewal scheduler (every {:?})", self.interval);

        Self::tick(&self.manager, self.store.as_ref()).await;

        let manager = Arc::clone(&self.manager);
        let store = Arc::clone(&self.store);
        let job = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let manager = Arc::clone(&manager);
            let store = Arc::clone(&store);
            Box::pin(async move {
                tracing::debug!("🔔 Webhook renewal tick");
                RenewalScheduler::tick(&manager, store.as_ref()).await;
            })
        })
        .map_err(scheduler_error)?;

        let uuid = {
            let scheduler = self.scheduler.write().await;
            let uuid = scheduler.add(job).await.map_err(scheduler_error)?;
            scheduler.start().await.map_err(scheduler_error)?;
            uuid
        };
        *self.job_uuid.write().await = Some(uuid);

        tracing::info!("✅ Webhook renewal scheduler started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        tracing::info!("⏹️ Stopping webhook renewal scheduler");
        if let Some(uuid) = self.job_uuid.write().await.take() {
            let scheduler = self.scheduler.read().await;
            if let Err(e) = scheduler.remove(&uuid).await {
                tracing::warn!("⚠️ Failed to remove renewal job: {}", e);
            }
        }
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await.map_err(scheduler_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::MemoryFlowStore;
    use crate::trigger::lease::LeaseSettings;
    use crate::trigger::provider::WebhookProvider;
    use crate::trigger::registry::TriggerRegistry;
    use crate::trigger::types::{Renewal, TriggerLease, WebhookTrigger};
    use async_trait::async_trait;
    use chrono::Utc;

    struct AlwaysRenews;

    #[async_trait]
    impl WebhookProvider for AlwaysRenews {
        async fn renew(&self, trigger: &WebhookTrigger, _current: Option<&TriggerLease>) -> Result<Renewal> {
            Ok(Renewal {
                subscription_id: format!("sub-{}", trigger.flow_id),
                expires_at: Utc::now() + chrono::Duration::days(1),
            })
        }
    }

    #[tokio::test]
    async fn tick_picks_up_new_triggers() {
        let store = Arc::new(MemoryFlowStore::new());
        store
            .save_webhook_trigger(&WebhookTrigger {
                flow_id: "flow-a".into(),
                project_id: "acme".into(),
                flow_version_id: "fv-1".into(),
                provider: "github".into(),
                renew_url: "http://localhost/renew".into(),
                items_path: None,
                challenge_field: None,
                verification_header: None,
            })
            .await
            .unwrap();

        let registry = Arc::new(TriggerRegistry::new());
        let (manager, _reports) = TriggerLeaseManager::new(
            registry.clone(),
            Arc::new(AlwaysRenews),
            LeaseSettings {
                renewal_window: Duration::from_secs(60),
                attempts: 1,
                backoff: Duration::from_millis(1),
                max_consecutive_failures: 3,
            },
        );

        RenewalScheduler::tick(&manager, store.as_ref()).await;
        assert_eq!(registry.lease("flow-a").map(|l| l.subscription_id), Some("sub-flow-a".into()));
    }
}
