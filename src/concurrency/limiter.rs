/// Per-project concurrency limiter
///
/// Caps the number of jobs a project runs at once across every worker
/// process sharing the slot store. Each check-and-insert happens under a
/// leased lock so two processes can never both take the last slot.

use crate::concurrency::store::SlotStore;
use crate::config::ConcurrencyConfig;
use crate::error::{Result, WorkerError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

const COUNTER_KEY_PREFIX: &str = "project:max-concurrent-jobs:";

/// Counter key holding a project's live slots
pub fn counter_key(project_id: &str) -> String {
    format!("{}{}", COUNTER_KEY_PREFIX, project_id)
}

fn lock_name(key: &str) -> String {
    format!("lock:{}", key)
}

/// A reservation of one unit of a project's capacity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub id: Uuid,
    pub project_id: String,
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Timing knobs for acquisition and leases
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    pub default_limit: u32,
    pub acquire_timeout: Duration,
    pub slot_lease: Duration,
    pub lock_lease: Duration,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl From<&ConcurrencyConfig> for LimiterSettings {
    fn from(config: &ConcurrencyConfig) -> Self {
        Self {
            default_limit: config.default_max_concurrent_jobs,
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
            slot_lease: Duration::from_secs(config.slot_lease_secs),
            lock_lease: Duration::from_millis(config.lock_lease_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }
}

pub struct ConcurrencyLimiter {
    store: Arc<dyn SlotStore>,
    settings: LimiterSettings,
    holder: String,
    held: Mutex<HashMap<Uuid, Slot>>,
}

impl ConcurrencyLimiter {
    pub fn new(store: Arc<dyn SlotStore>, settings: LimiterSettings) -> Self {
        Self {
            store,
            settings,
            holder: format!("worker-{}", Uuid::new_v4()),
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Identity recorded on every slot this limiter takes
    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn SlotStore> {
        &self.store
    }

    /// Acquire with the configured timeout
    pub async fn acquire(&self, project_id: &str) -> Result<Slot> {
        self.acquire_within(project_id, self.settings.acquire_timeout).await
    }

    /// Take a slot for `project_id`, backing off until `timeout` elapses
    pub async fn acquire_within(&self, project_id: &str, timeout: Duration) -> Result<Slot> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut delay = self.settings.retry_delay;

        loop {
            if let Some(slot) = self.try_acquire(project_id).await? {
                tracing::debug!("🎟️ Slot {} acquired for project '{}'", slot.id, project_id);
                self.held.lock().await.insert(slot.id, slot.clone());
                return Ok(slot);
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!("⏳ Project '{}' at capacity after {:?}", project_id, timeout);
                return Err(WorkerError::CapacityExceeded {
                    project_id: project_id.to_string(),
                    waited: now - started,
                });
            }

            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.settings.max_retry_delay);
        }
    }

    /// One locked check-and-insert; `None` when the lock is busy or the project is full
    async fn try_acquire(&self, project_id: &str) -> Result<Option<Slot>> {
        let key = counter_key(project_id);
        let lock = lock_name(&key);
        // Per-attempt token: tasks of the same process must exclude each other too
        let token = format!("{}:{}", self.holder, Uuid::new_v4());

        if !self.store.try_lock(&lock, &token, self.settings.lock_lease).await? {
            return Ok(None);
        }

        let outcome = self.claim_locked(project_id, &key).await;

        if let Err(e) = self.store.unlock(&lock, &token).await {
            tracing::warn!("⚠️ Failed to unlock '{}' (lease will expire): {}", lock, e);
        }

        outcome
    }

    async fn claim_locked(&self, project_id: &str, key: &str) -> Result<Option<Slot>> {
        let limit = self.limit_for(project_id).await?;
        let live = self.store.live_slots(key).await?;
        if live >= limit {
            return Ok(None);
        }

        let slot = Slot {
            id: Uuid::new_v4(),
            project_id: project_id.to_string(),
            key: key.to_string(),
            holder: self.holder.clone(),
            acquired_at: Utc::now(),
        };
        self.store
            .insert_slot(key, slot.id, &self.holder, self.settings.slot_lease)
            .await?;
        Ok(Some(slot))
    }

    /// Give a slot back; releasing twice or releasing an expired slot is a no-op
    pub async fn release(&self, slot: &Slot) -> Result<()> {
        let tracked = self.held.lock().await.remove(&slot.id).is_some();
        let removed = self.store.remove_slot(&slot.key, slot.id).await?;

        match (tracked, removed) {
            (_, true) => tracing::debug!("🎟️ Slot {} released for project '{}'", slot.id, slot.project_id),
            (true, false) => tracing::warn!("⚠️ Slot {} had already expired before release", slot.id),
            (false, false) => tracing::debug!("Slot {} was not held, nothing to release", slot.id),
        }
        Ok(())
    }

    /// Extend a slot's lease; false when it already expired
    pub async fn renew(&self, slot: &Slot) -> Result<bool> {
        self.store
            .renew_slot(&slot.key, slot.id, self.settings.slot_lease)
            .await
    }

    /// Release every slot this limiter still holds, returning how many there were
    pub async fn release_all(&self) -> usize {
        let slots: Vec<Slot> = {
            let mut held = self.held.lock().await;
            held.drain().map(|(_, slot)| slot).collect()
        };

        for slot in &slots {
            if let Err(e) = self.store.remove_slot(&slot.key, slot.id).await {
                tracing::warn!("⚠️ Failed to release slot {}: {}", slot.id, e);
            }
        }
        if !slots.is_empty() {
            tracing::info!("🎟️ Released {} outstanding slot(s)", slots.len());
        }
        slots.len()
    }

    /// Slots currently held by this limiter instance
    pub async fn held_count(&self) -> usize {
        self.held.lock().await.len()
    }

    /// Live slots for a project across every process
    pub async fn in_flight(&self, project_id: &str) -> Result<u32> {
        self.store.live_slots(&counter_key(project_id)).await
    }

    /// Per-project override from the store, else the configured default
    pub async fn limit_for(&self, project_id: &str) -> Result<u32> {
        Ok(self
            .store
            .project_limit(project_id)
            .await?
            .unwrap_or(self.settings.default_limit))
    }

    /// Renew `slot` every third of the lease until the returned handle is aborted
    pub fn spawn_heartbeat(self: &Arc<Self>, slot: Slot) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = (self.settings.slot_lease / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.renew(&slot).await {
                    Ok(true) => tracing::trace!("💓 Slot {} renewed", slot.id),
                    Ok(false) => {
                        tracing::warn!("⚠️ Slot {} expired before its heartbeat", slot.id);
                        break;
                    }
                    Err(e) => tracing::warn!("⚠️ Slot {} heartbeat failed: {}", slot.id, e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::store::MemorySlotStore;

    fn settings(limit: u32) -> LimiterSettings {
        LimiterSettings {
            default_limit: limit,
            acquire_timeout: Duration::from_millis(200),
            slot_lease: Duration::from_secs(30),
            lock_lease: Duration::from_secs(5),
            retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn counter_key_format() {
        assert_eq!(counter_key("p1"), "project:max-concurrent-jobs:p1");
        assert_eq!(lock_name(&counter_key("p1")), "lock:project:max-concurrent-jobs:p1");
    }

    #[tokio::test]
    async fn blocks_at_limit_then_fails_with_capacity_exceeded() {
        let limiter = ConcurrencyLimiter::new(Arc::new(MemorySlotStore::new()), settings(1));
        let slot = limiter.acquire("p").await.unwrap();

        let started = Instant::now();
        let err = limiter.acquire_within("p", Duration::from_millis(80)).await.unwrap_err();
        assert!(matches!(err, WorkerError::CapacityExceeded { ref project_id, .. } if project_id == "p"));
        assert!(started.elapsed() >= Duration::from_millis(80));

        limiter.release(&slot).await.unwrap();
        let again = limiter.acquire("p").await.unwrap();
        assert_eq!(limiter.in_flight("p").await.unwrap(), 1);
        limiter.release(&again).await.unwrap();
    }

    #[tokio::test]
    async fn waiting_acquire_succeeds_once_released() {
        let limiter = Arc::new(ConcurrencyLimiter::new(Arc::new(MemorySlotStore::new()), settings(1)));
        let slot = limiter.acquire("p").await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire_within("p", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        limiter.release(&slot).await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        assert_ne!(second.id, slot.id);
    }

    #[tokio::test]
    async fn double_release_is_a_no_op() {
        let limiter = ConcurrencyLimiter::new(Arc::new(MemorySlotStore::new()), settings(2));
        let slot = limiter.acquire("p").await.unwrap();

        limiter.release(&slot).await.unwrap();
        limiter.release(&slot).await.unwrap();
        assert_eq!(limiter.in_flight("p").await.unwrap(), 0);

        let stranger = Slot {
            id: Uuid::new_v4(),
            project_id: "p".into(),
            key: counter_key("p"),
            holder: "nobody".into(),
            acquired_at: Utc::now(),
        };
        limiter.release(&stranger).await.unwrap();
        assert_eq!(limiter.in_flight("p").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn project_override_beats_default() {
        let store = Arc::new(MemorySlotStore::new());
        store.set_project_limit("vip", 3).await.unwrap();
        let limiter = ConcurrencyLimiter::new(store, settings(1));

        assert_eq!(limiter.limit_for("vip").await.unwrap(), 3);
        assert_eq!(limiter.limit_for("other").await.unwrap(), 1);

        for _ in 0..3 {
            limiter.acquire("vip").await.unwrap();
        }
        assert_eq!(limiter.held_count().await, 3);
        assert_eq!(limiter.release_all().await, 3);
        assert_eq!(limiter.in_flight("vip").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn crashed_holder_slot_expires() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        let mut short = settings(1);
        short.slot_lease = Duration::from_millis(30);
        let crashed = ConcurrencyLimiter::new(Arc::clone(&store), short);
        let _abandoned = crashed.acquire("p").await.unwrap();

        let survivor = ConcurrencyLimiter::new(store, settings(1));
        let slot = survivor.acquire_within("p", Duration::from_secs(1)).await.unwrap();
        assert_eq!(slot.holder, survivor.holder());
    }

    #[tokio::test]
    async fn heartbeat_keeps_slot_alive() {
        let store: Arc<dyn SlotStore> = Arc::new(MemorySlotStore::new());
        let mut short = settings(1);
        short.slot_lease = Duration::from_millis(60);
        let limiter = Arc::new(ConcurrencyLimiter::new(Arc::clone(&store), short));

        let slot = limiter.acquire("p").await.unwrap();
        let heartbeat = limiter.spawn_heartbeat(slot.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(limiter.in_flight("p").await.unwrap(), 1);

        heartbeat.abort();
        limiter.release(&slot).await.unwrap();
        assert_eq!(limiter.in_flight("p").await.unwrap(), 0);
    }
}
