/// Hot-reload trigger registry using ArcSwap
///
/// Holds the active webhook triggers and their current leases. Readers on the
/// ingress path never block; every update swaps the whole map.

use crate::error::Result;
use crate::flow::FlowStore;
use crate::trigger::types::{TriggerLease, WebhookTrigger};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// A trigger and the lease keeping it registered (none until first renewal)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEntry {
    pub trigger: WebhookTrigger,
    pub lease: Option<TriggerLease>,
}

#[derive(Debug)]
pub struct TriggerRegistry {
    /// Key: flow_id
    entries: ArcSwap<HashMap<String, TriggerEntry>>,
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Replace the registry with the store's active triggers, keeping known leases
    pub async fn load_from(&self, store: &dyn FlowStore) -> Result<usize> {
        let triggers = store.active_webhook_triggers().await?;
        let count = self.replace_all(&triggers);
        tracing::info!("🪝 Loaded {} webhook trigger(s)", count);
        Ok(count)
    }

    /// Swap in exactly `triggers`; a lease stored concurrently is never lost
    pub fn replace_all(&self, triggers: &[WebhookTrigger]) -> usize {
        self.entries.rcu(|current| {
            triggers
                .iter()
                .map(|trigger| {
                    let lease = current.get(&trigger.flow_id).and_then(|entry| entry.lease.clone());
                    (
                        trigger.flow_id.clone(),
                        TriggerEntry {
                            trigger: trigger.clone(),
                            lease,
                        },
                    )
                })
                .collect::<HashMap<String, TriggerEntry>>()
        });
        self.len()
    }

    /// Add or replace one trigger (its lease is kept if the flow was known)
    pub fn upsert(&self, trigger: WebhookTrigger) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            let lease = current.get(&trigger.flow_id).and_then(|entry| entry.lease.clone());
            next.insert(
                trigger.flow_id.clone(),
                TriggerEntry {
                    trigger: trigger.clone(),
                    lease,
                },
            );
            next
        });
    }

    pub fn remove(&self, flow_id: &str) -> bool {
        let existed = self.entries.load().contains_key(flow_id);
        if existed {
            self.entries.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.remove(flow_id);
                next
            });
            tracing::info!("🗑️ Removed webhook trigger for flow '{}'", flow_id);
        }
        existed
    }

    /// Store the latest lease of a registered trigger
    pub fn set_lease(&self, lease: TriggerLease) {
        self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            if let Some(entry) = next.get_mut(&lease.flow_id) {
                entry.lease = Some(lease.clone());
            }
            next
        });
    }

    pub fn get(&self, flow_id: &str) -> Option<TriggerEntry> {
        self.entries.load().get(flow_id).cloned()
    }

    pub fn trigger(&self, flow_id: &str) -> Option<WebhookTrigger> {
        self.get(flow_id).map(|entry| entry.trigger)
    }

    pub fn lease(&self, flow_id: &str) -> Option<TriggerLease> {
        self.get(flow_id).and_then(|entry| entry.lease)
    }

    /// Snapshot of every entry, ordered by flow id
    pub fn entries(&self) -> Vec<TriggerEntry> {
        let mut entries: Vec<TriggerEntry> = self.entries.load().values().cloned().collect();
        entries.sort_by(|a, b| a.trigger.flow_id.cmp(&b.trigger.flow_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::MemoryFlowStore;
    use crate::trigger::types::LeaseStatus;
    use chrono::Utc;

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

    fn lease(flow_id: &str) -> TriggerLease {
        TriggerLease {
            flow_id: flow_id.into(),
            subscription_id: "sub-1".into(),
            expires_at: Utc::now(),
            last_renewed_at: Utc::now(),
            consecutive_failures: 0,
            status: LeaseStatus::Active,
        }
    }

    #[tokio::test]
    async fn reload_keeps_existing_leases() {
        let store = MemoryFlowStore::new();
        store.save_webhook_trigger(&trigger("flow-a")).await.unwrap();

        let registry = TriggerRegistry::new();
        assert_eq!(registry.load_from(&store).await.unwrap(), 1);
        registry.set_lease(lease("flow-a"));

        store.save_webhook_trigger(&trigger("flow-b")).await.unwrap();
        assert_eq!(registry.load_from(&store).await.unwrap(), 2);
        assert!(registry.lease("flow-a").is_some());
        assert!(registry.lease("flow-b").is_none());
    }

    #[test]
    fn reload_racing_lease_updates_keeps_the_latest_lease() {
        let registry = Arc::new(TriggerRegistry::new());
        let triggers = vec![trigger("flow-a"), trigger("flow-b")];
        registry.replace_all(&triggers);

        let reloader = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    registry.replace_all(&triggers);
                }
            })
        };

        let mut last = lease("flow-a");
        for failures in 0..500 {
            last.consecutive_failures = failures;
            registry.set_lease(last.clone());
        }
        reloader.join().unwrap();

        assert_eq!(registry.lease("flow-a"), Some(last));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn upsert_remove_and_lease_updates() {
        let registry = TriggerRegistry::new();
        registry.upsert(trigger("flow-a"));
        registry.set_lease(lease("flow-a"));
        // Leases for unknown flows are ignored
        registry.set_lease(lease("ghost"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lease("flow-a").map(|l| l.subscription_id), Some("sub-1".into()));

        assert!(registry.remove("flow-a"));
        assert!(!registry.remove("flow-a"));
        assert!(registry.is_empty());
    }
}
