/// Job queue contract and in-memory backend
///
/// Delivery rules shared by every backend:
/// - FIFO per flow run: only the oldest pending job of a flow run is
///   eligible, and never while another job of that run is claimed.
/// - Among eligible jobs the oldest is handed out first.
/// - `nack` requeues with attempt + 1; `defer` requeues with the same attempt.
/// - Requeued jobs keep their place in line.
/// - Every claim carries a fresh `claim_id`; ack, nack, defer and
///   dead-letter are ignored unless they present the current one.

use crate::error::Result;
use crate::job::types::{DeadLetter, Job, NewJob};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Connectivity check used by init()
    async fn ping(&self) -> Result<()>;

    async fn enqueue(&self, job: NewJob) -> Result<Job>;

    /// Claim the next eligible job, waiting up to `wait` for one to appear
    async fn claim(&self, wait: Duration) -> Result<Option<Job>>;

    /// Processing finished; the job leaves the queue
    async fn ack(&self, job: &Job) -> Result<()>;

    /// Failed attempt; redeliver after `delay` as the next attempt
    async fn nack(&self, job: &Job, reason: &str, delay: Duration) -> Result<()>;

    /// Put the job back after `delay` without consuming an attempt
    async fn defer(&self, job: &Job, delay: Duration) -> Result<()>;

    /// Terminal failure; the job is kept for inspection only
    async fn dead_letter(&self, job: &Job, reason: &str) -> Result<()>;

    /// Keep the claim alive while the job runs; false once it was lost
    async fn extend_claim(&self, job: &Job) -> Result<bool>;

    /// How long an unextended claim survives, if the backend expires claims
    fn visibility_timeout(&self) -> Option<Duration> {
        None
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Jobs waiting for delivery (including delayed ones)
    async fn pending(&self) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    job: Job,
    available_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    pending: Vec<Entry>,
    claimed: HashMap<Uuid, Entry>,
    dead: Vec<DeadLetter>,
}

impl QueueState {
    fn take_next(&mut self, now: Instant) -> Option<Job> {
        let busy_runs: HashSet<&str> = self.claimed.values().map(|e| e.job.flow_run_id.as_str()).collect();

        // Head of each flow run's line
        let mut heads: HashMap<&str, (u64, usize)> = HashMap::new();
        for (index, entry) in self.pending.iter().enumerate() {
            let head = heads.entry(entry.job.flow_run_id.as_str()).or_insert((entry.seq, index));
            if entry.seq < head.0 {
                *head = (entry.seq, index);
            }
        }

        let chosen = heads
            .into_iter()
            .filter(|(run, (_, index))| !busy_runs.contains(run) && self.pending[*index].available_at <= now)
            .min_by_key(|(_, (seq, _))| *seq)
            .map(|(_, (_, index))| index)?;

        let mut entry = self.pending.swap_remove(chosen);
        entry.job.claim_id = Some(Uuid::new_v4());
        let job = entry.job.clone();
        self.claimed.insert(job.id, entry);
        Some(job)
    }

    fn holds_claim(&self, job: &Job) -> bool {
        self.claimed
            .get(&job.id)
            .is_some_and(|entry| job.claim_id.is_some() && entry.job.claim_id == job.claim_id)
    }

    /// Remove the claimed entry, but only for the current claim holder
    fn release_claim(&mut self, job: &Job) -> Option<Entry> {
        if self.holds_claim(job) {
            self.claimed.remove(&job.id)
        } else {
            None
        }
    }

    fn requeue(&mut self, job: &Job, attempt: u32, delay: Duration) -> bool {
        match self.release_claim(job) {
            Some(mut entry) => {
                entry.job.attempt = attempt;
                entry.job.claim_id = None;
                entry.available_at = Instant::now() + delay;
                self.pending.push(entry);
                true
            }
            None => false,
        }
    }
}

/// Process-local queue; jobs do not survive a restart
#[derive(Debug)]
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    poll_interval: Duration,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_millis(25))
    }

    /// `poll_interval` bounds how late a delayed job is noticed
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            poll_interval,
        }
    }

    /// Jobs currently claimed by a consumer
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.claimed.len()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let job = job.into_job();
        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.pending.push(Entry {
                seq,
                job: job.clone(),
                available_at: Instant::now(),
            });
        }
        self.notify.notify_waiters();
        tracing::debug!("📥 Enqueued job {} (flow run {})", job.id, job.flow_run_id);
        Ok(job)
    }

    async fn claim(&self, wait: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.state.lock().await.take_next(Instant::now()) {
                return Ok(Some(job));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout((deadline - now).min(self.poll_interval), notified).await;
        }
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let removed = self.state.lock().await.release_claim(job).is_some();
        if removed {
            self.notify.notify_waiters();
        } else {
            tracing::warn!("⚠️ Ack for job {} which is not claimed", job.id);
        }
        Ok(())
    }

    async fn nack(&self, job: &Job, reason: &str, delay: Duration) -> Result<()> {
        let requeued = self.state.lock().await.requeue(job, job.attempt + 1, delay);
        if requeued {
            tracing::debug!("🔁 Job {} requeued in {:?}: {}", job.id, delay, reason);
            self.notify.notify_waiters();
        } else {
            tracing::warn!("⚠️ Nack for job {} which is not claimed", job.id);
        }
        Ok(())
    }

    async fn defer(&self, job: &Job, delay: Duration) -> Result<()> {
        let requeued = self.state.lock().await.requeue(job, job.attempt, delay);
        if requeued {
            self.notify.notify_waiters();
        } else {
            tracing::warn!("⚠️ Defer for job {} which is not claimed", job.id);
        }
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.release_claim(job) else {
            tracing::warn!("⚠️ Dead-letter for job {} which is not claimed", job.id);
            return Ok(());
        };
        let mut job = entry.job;
        job.claim_id = None;
        state.dead.push(DeadLetter {
            job,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend_claim(&self, job: &Job) -> Result<bool> {
        // Claims never expire here; the check only reports ownership
        Ok(self.state.lock().await.holds_claim(job))
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.state.lock().await.dead.clone())
    }

    async fn pending(&self) -> Result<usize> {
        Ok(self.state.lock().await.pending.len())
    }
}
