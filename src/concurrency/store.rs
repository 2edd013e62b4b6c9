/// Lock/counter store contract
///
/// The only state shared between worker processes. The limiter reaches it
/// through an explicit `Arc<dyn SlotStore>` handle, never through globals.
/// Slots are individual leased records, so the in-flight count is simply the
/// number of unexpired records and can never drop below zero.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Connectivity check used by init()
    async fn ping(&self) -> Result<()>;

    /// Take the named lock unless another holder's lease is still live
    async fn try_lock(&self, name: &str, holder: &str, lease: Duration) -> Result<bool>;

    /// Release the named lock if `holder` still owns it
    async fn unlock(&self, name: &str, holder: &str) -> Result<()>;

    /// Purge expired slots under `key` and count the live ones
    async fn live_slots(&self, key: &str) -> Result<u32>;

    /// Record a new slot under `key`
    async fn insert_slot(&self, key: &str, slot_id: Uuid, holder: &str, lease: Duration) -> Result<()>;

    /// Remove a slot; false when it was already released or expired
    async fn remove_slot(&self, key: &str, slot_id: Uuid) -> Result<bool>;

    /// Extend a live slot's lease; false when it is gone
    async fn renew_slot(&self, key: &str, slot_id: Uuid, lease: Duration) -> Result<bool>;

    /// Per-project override of the concurrent-job limit
    async fn project_limit(&self, project_id: &str) -> Result<Option<u32>>;

    async fn set_project_limit(&self, project_id: &str, limit: u32) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    /// lock name -> (holder, expiry)
    locks: HashMap<String, (String, Instant)>,
    /// counter key -> slot id -> expiry
    slots: HashMap<String, HashMap<Uuid, Instant>>,
    limits: HashMap<String, u32>,
}

/// In-memory store for tests and single-process deployments
///
/// Share one instance (behind an `Arc`) between several limiters to simulate
/// several worker processes.
#[derive(Debug, Default)]
pub struct MemorySlotStore {
    state: Mutex<MemoryState>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn try_lock(&self, name: &str, holder: &str, lease: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = state.locks.get(name) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        state.locks.insert(name.to_string(), (holder.to_string(), now + lease));
        Ok(true)
    }

    async fn unlock(&self, name: &str, holder: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.locks.get(name).map(|(owner, _)| owner == holder).unwrap_or(false) {
            state.locks.remove(name);
        }
        Ok(())
    }

    async fn live_slots(&self, key: &str) -> Result<u32> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let Some(slots) = state.slots.get_mut(key) else {
            return Ok(0);
        };
        slots.retain(|_, expires_at| *expires_at > now);
        Ok(slots.len() as u32)
    }

    async fn insert_slot(&self, key: &str, slot_id: Uuid, _holder: &str, lease: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .slots
            .entry(key.to_string())
            .or_default()
            .insert(slot_id, Instant::now() + lease);
        Ok(())
    }

    async fn remove_slot(&self, key: &str, slot_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let removed = state
            .slots
            .get_mut(key)
            .and_then(|slots| slots.remove(&slot_id))
            .map(|expires_at| expires_at > now)
            .unwrap_or(false);
        Ok(removed)
    }

    async fn renew_slot(&self, key: &str, slot_id: Uuid, lease: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.slots.get_mut(key).and_then(|slots| slots.get_mut(&slot_id)) {
            Some(expires_at) if *expires_at > now => {
                *expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn project_limit(&self, project_id: &str) -> Result<Option<u32>> {
        Ok(self.state.lock().await.limits.get(project_id).copied())
    }

    async fn set_project_limit(&self, project_id: &str, limit: u32) -> Result<()> {
        self.state.lock().await.limits.insert(project_id.to_string(), limit);
        Ok(())
    }
}
