/// Consumer manager contract and the queue-driven implementation
///
/// `init` proves the queue and lock store are reachable and warms the sandbox
/// pool, `run` is the dequeue loop, `close` drains and releases everything.
/// The queue backend is injected as a trait object, so the loop itself never
/// branches on backend.

use crate::concurrency::ConcurrencyLimiter;
use crate::config::WorkerConfig;
use crate::consumer::processor::{JobProcessor, RetryPolicy};
use crate::consumer::stats::{ConsumerStats, StatsSnapshot};
use crate::error::{Result, WorkerError};
use crate::flow::{FlowRunner, FlowStore};
use crate::job::{Job, JobQueue};
use crate::sandbox::{PieceSet, PoolStats, SandboxPool};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;

#[async_trait]
pub trait ConsumerManager: Send + Sync {
    /// Connect and warm up; an error here is fatal for the worker
    async fn init(&self) -> Result<()>;

    /// Dequeue and process jobs until `close` is called
    async fn run(&self) -> Result<()>;

    /// Stop taking jobs, drain, release slots and tear down sandboxes
    async fn close(&self) -> Result<()>;

    fn is_ready(&self) -> bool;

    fn stats(&self) -> StatsSnapshot;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub worker_threads: usize,
    pub claim_wait: Duration,
    pub drain_grace: Duration,
    pub init_retries: u32,
    pub init_retry_delay: Duration,
    pub warm_piece_sets: Vec<PieceSet>,
    pub retry: RetryPolicy,
}

impl From<&WorkerConfig> for ConsumerSettings {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            worker_threads: config.worker_threads.max(1),
            claim_wait: config.claim_wait(),
            drain_grace: config.drain_grace(),
            init_retries: config.init_retries,
            init_retry_delay: Duration::from_millis(config.init_retry_delay_ms),
            warm_piece_sets: config.warm_piece_sets.clone(),
            retry: RetryPolicy::from(config),
        }
    }
}

/// Run `op` until it succeeds or `retries` extra attempts are used up
async fn with_retries<F, Fut>(what: &str, retries: u32, delay: Duration, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::warn!("⚠️ {} unreachable (try {}/{}): {}", what, attempt, retries, e);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Counts a running job task; decrements even when the task is aborted
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct QueueConsumer {
    queue: Arc<dyn JobQueue>,
    limiter: Arc<ConcurrencyLimiter>,
    pool: Arc<SandboxPool>,
    processor: Arc<JobProcessor>,
    settings: ConsumerSettings,
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    in_flight: Arc<Mutex<HashMap<Uuid, Job>>>,
    active: Arc<AtomicUsize>,
    /// Held by `run` for its whole lifetime so `close` can wait for the loop
    running: Mutex<()>,
    ready: AtomicBool,
    stats: Arc<ConsumerStats>,
}

impl QueueConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        limiter: Arc<ConcurrencyLimiter>,
        pool: Arc<SandboxPool>,
        flows: Arc<dyn FlowStore>,
        runner: FlowRunner,
        settings: ConsumerSettings,
    ) -> Self {
        let stats = Arc::new(ConsumerStats::new());
        let processor = Arc::new(JobProcessor::new(
            Arc::clone(&queue),
            Arc::clone(&limiter),
            Arc::clone(&pool),
            flows,
            runner,
            settings.retry,
            Arc::clone(&stats),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            queue,
            limiter,
            pool,
            processor,
            permits: Arc::new(Semaphore::new(settings.worker_threads)),
            settings,
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(()),
            ready: AtomicBool::new(false),
            stats,
        }
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!("💥 Job task panicked: {}", e);
                }
            }
        }
    }

    /// Wait for a retry delay unless shutdown arrives first; true on shutdown
    async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        let changed = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown.changed() => true,
        };
        changed || *shutdown.borrow()
    }
}

#[async_trait]
impl ConsumerManager for QueueConsumer {
    async fn init(&self) -> Result<()> {
        tracing::info!("🔌 Initializing consumer ({} worker slots)", self.settings.worker_threads);

        let retries = self.settings.init_retries;
        let delay = self.settings.init_retry_delay;

        with_retries("Job queue", retries, delay, || self.queue.ping())
            .await
            .map_err(|e| match e {
                WorkerError::QueueUnavailable(_) => e,
                other => WorkerError::QueueUnavailable(other.to_string()),
            })?;

        let store = Arc::clone(self.limiter.store());
        with_retries("Lock store", retries, delay, || store.ping())
            .await
            .map_err(|e| match e {
                WorkerError::LockStoreUnavailable(_) => e,
                other => WorkerError::LockStoreUnavailable(other.to_string()),
            })?;

        if !self.settings.warm_piece_sets.is_empty() {
            if let Err(e) = self.pool.warm(&self.settings.warm_piece_sets).await {
                tracing::warn!("⚠️ Sandbox warm-up incomplete: {}", e);
            }
        }

        self.ready.store(true, Ordering::SeqCst);
        tracing::info!("✅ Consumer ready");
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let _running = self.running.lock().await;
        let mut shutdown = self.shutdown.subscribe();
        tracing::info!("🏃 Consumer loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.permits).acquire_owned() => {
                    permit.map_err(|_| WorkerError::Runtime("worker permits closed".into()))?
                }
                _ = shutdown.changed() => break,
            };

            // Bounded wait; never cancelled mid-claim so a claimed job is never lost
            let job = match self.queue.claim(self.settings.claim_wait).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    self.reap_finished().await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Claim failed: {}", e);
                    drop(permit);
                    if Self::pause(&mut shutdown, self.settings.claim_wait).await {
                        break;
                    }
                    continue;
                }
            };

            if *shutdown.borrow() {
                tracing::info!("↩️ Returning job {} claimed during shutdown", job.id);
                if let Err(e) = self.queue.defer(&job, Duration::ZERO).await {
                    tracing::error!("💥 Failed to return job {}: {}", job.id, e);
                }
                break;
            }

            self.in_flight.lock().await.insert(job.id, job.clone());

            let processor = Arc::clone(&self.processor);
            let in_flight = Arc::clone(&self.in_flight);
            let active = ActiveGuard::enter(&self.active);
            self.tasks.lock().await.spawn(async move {
                let _permit = permit;
                let _active = active;
                let job_id = job.id;
                processor.process(job).await;
                in_flight.lock().await.remove(&job_id);
            });

            self.reap_finished().await;
        }

        tracing::info!("🛑 Consumer loop stopped");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        tracing::info!("🛑 Closing consumer");
        self.ready.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        // No new tasks can be spawned once the loop has exited
        let _loop_done = self.running.lock().await;

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let pending = tasks.len();
        if pending > 0 {
            tracing::info!("⏳ Draining {} in-flight job(s) for up to {:?}", pending, self.settings.drain_grace);
        }

        let drained = tokio::time::timeout(self.settings.drain_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!("⚠️ Drain grace elapsed, aborting {} job(s)", tasks.len());
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let aborted: Vec<Job> = self.in_flight.lock().await.drain().map(|(_, job)| job).collect();
        for job in &aborted {
            tracing::info!("↩️ Returning aborted job {} to the queue", job.id);
            if let Err(e) = self.queue.defer(job, Duration::ZERO).await {
                tracing::error!("💥 Failed to return job {}: {}", job.id, e);
            }
        }

        self.limiter.release_all().await;
        self.pool.shutdown().await;

        tracing::info!("👋 Consumer closed");
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(self.active.load(Ordering::SeqCst))
    }
}
