//! Shared fixtures for the integration tests: an in-memory worker wired the
//! same way the server wires the SQLite one.

#![allow(dead_code)]

use piecework::concurrency::{ConcurrencyLimiter, LimiterSettings, MemorySlotStore, SlotStore};
use piecework::consumer::{ConsumerManager, ConsumerSettings, QueueConsumer, RetryPolicy};
use piecework::flow::{FlowRunner, FlowStore, FlowVersion, MemoryFlowStore, Step, StepAction};
use piecework::job::{JobQueue, MemoryJobQueue};
use piecework::sandbox::{CatalogInstaller, Isolation, PieceSet, SandboxLimits, SandboxPool};
use serde_json::Value;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;

/// Executions run in child processes of the worker binary, as in production
pub fn sandbox_limits() -> SandboxLimits {
    SandboxLimits {
        grace: Duration::from_secs(2),
        output_limit_bytes: 4096,
        memory_limit_bytes: 32 * 1024 * 1024,
        isolation: Isolation::Process {
            program: PathBuf::from(env!("CARGO_BIN_EXE_piecework")),
        },
    }
}

pub fn limiter_settings(default_limit: u32) -> LimiterSettings {
    LimiterSettings {
        default_limit,
        acquire_timeout: Duration::from_secs(10),
        slot_lease: Duration::from_secs(30),
        lock_lease: Duration::from_secs(2),
        retry_delay: Duration::from_millis(5),
        max_retry_delay: Duration::from_millis(50),
    }
}

pub fn consumer_settings(worker_threads: usize) -> ConsumerSettings {
    ConsumerSettings {
        worker_threads,
        claim_wait: Duration::from_millis(50),
        drain_grace: Duration::from_secs(5),
        init_retries: 0,
        init_retry_delay: Duration::from_millis(10),
        warm_piece_sets: Vec::new(),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        },
    }
}

/// One inline-code step flow
pub fn code_flow(id: &str, project_id: &str, source: &str) -> FlowVersion {
    FlowVersion {
        id: id.to_string(),
        flow_id: format!("flow-{}", id),
        project_id: project_id.to_string(),
        piece_set: PieceSet::new(),
        steps: vec![Step {
            name: "main".into(),
            action: StepAction::Code { source: source.into() },
            params: Value::Null,
        }],
        edges: Vec::new(),
    }
}

pub struct Harness {
    pub queue: Arc<MemoryJobQueue>,
    pub slots: Arc<dyn SlotStore>,
    pub flows: Arc<MemoryFlowStore>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub installer: Arc<CatalogInstaller>,
    pub consumer: Arc<QueueConsumer>,
    _root: TempDir,
}

pub struct HarnessBuilder {
    slots: Arc<dyn SlotStore>,
    installer: CatalogInstaller,
    default_limit: u32,
    limiter_settings: Option<LimiterSettings>,
    step_timeout: Duration,
    settings: ConsumerSettings,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(MemorySlotStore::new()),
            installer: CatalogInstaller::new(),
            default_limit: 10,
            limiter_settings: None,
            step_timeout: Duration::from_secs(5),
            settings: consumer_settings(2),
        }
    }

    pub fn slots(mut self, slots: Arc<dyn SlotStore>) -> Self {
        self.slots = slots;
        self
    }

    pub fn installer(mut self, installer: CatalogInstaller) -> Self {
        self.installer = installer;
        self
    }

    pub fn default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn limiter_settings(mut self, settings: LimiterSettings) -> Self {
        self.limiter_settings = Some(settings);
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn settings(mut self, settings: ConsumerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let queue = Arc::new(MemoryJobQueue::with_poll_interval(Duration::from_millis(5)));
        let flows = Arc::new(MemoryFlowStore::new());
        let installer = Arc::new(self.installer);
        let settings = self
            .limiter_settings
            .unwrap_or_else(|| limiter_settings(self.default_limit));
        let limiter = Arc::new(ConcurrencyLimiter::new(Arc::clone(&self.slots), settings));
        let pool = Arc::new(SandboxPool::new(
            installer.clone(),
            root.path().join("sandboxes"),
            sandbox_limits(),
            4,
        ));

        let job_queue: Arc<dyn JobQueue> = queue.clone();
        let flow_store: Arc<dyn FlowStore> = flows.clone();
        let consumer = Arc::new(QueueConsumer::new(
            job_queue,
            Arc::clone(&limiter),
            pool,
            flow_store,
            FlowRunner::new(self.step_timeout),
            self.settings,
        ));

        Harness {
            queue,
            slots: self.slots,
            flows,
            limiter,
            installer,
            consumer,
            _root: root,
        }
    }
}

impl Harness {
    /// init() then run() on a background task
    pub async fn start(&self) -> JoinHandle<()> {
        self.consumer.init().await.unwrap();
        let consumer = Arc::clone(&self.consumer);
        tokio::spawn(async move {
            consumer.run().await.unwrap();
        })
    }
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
