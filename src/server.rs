/// Server setup and initialization
///
/// Wires together all components: storage backends, concurrency limiter,
/// sandbox pool, consumer loop, webhook renewal and HTTP routes.

use crate::{
    api::{create_router, AppState},
    concurrency::{ConcurrencyLimiter, LimiterSettings, MemorySlotStore, SlotStore, SqliteSlotStore},
    config::{Config, QueueBackend},
    consumer::{ConsumerManager, ConsumerSettings, QueueConsumer},
    flow::{FlowRunner, FlowStore, MemoryFlowStore, SqliteFlowStore},
    job::{JobQueue, MemoryJobQueue, SqliteJobQueue},
    sandbox::{FsPieceInstaller, SandboxLimits, SandboxPool},
    storage::StorageManager,
    trigger::{HttpWebhookProvider, LeaseSettings, RenewalScheduler, TriggerLeaseManager, TriggerRegistry, TriggerReport},
};
use anyhow::Result;
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

/// Per-call timeout for provider renewal requests
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Backends chosen by configuration
pub struct Backends {
    pub queue: Arc<dyn JobQueue>,
    pub slots: Arc<dyn SlotStore>,
    pub flows: Arc<dyn FlowStore>,
}

/// Fully wired worker, ready to be started
pub struct Worker {
    pub consumer: Arc<QueueConsumer>,
    pub triggers: Arc<TriggerLeaseManager>,
    pub renewals: RenewalScheduler,
    pub queue: Arc<dyn JobQueue>,
    pub storage: Arc<StorageManager>,
    reports: UnboundedReceiver<TriggerReport>,
}

/// Open the configured queue, slot store and flow store
pub async fn open_backends(config: &Config, storage: &StorageManager) -> Result<Backends> {
    match config.storage.queue_backend {
        QueueBackend::Sqlite => {
            tracing::info!("🗄️ Using SQLite backends under {}", storage.data_dir().display());

            let queue = SqliteJobQueue::new(
                storage.pool("queue").await?,
                config.worker.poll_interval(),
                config.worker.visibility_timeout(),
            );
            queue
                .init_schema()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize queue schema: {}", e))?;

            let slots = SqliteSlotStore::new(storage.pool("locks").await?);
            slots
                .init_schema()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize lock store schema: {}", e))?;

            let flows = SqliteFlowStore::new(storage.pool("flows").await?);
            flows
                .init_schema()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to initialize flow store schema: {}", e))?;

            Ok(Backends {
                queue: Arc::new(queue),
                slots: Arc::new(slots),
                flows: Arc::new(flows),
            })
        }
        QueueBackend::Memory => {
            tracing::warn!("⚠️ Using in-memory backends; jobs and flows are lost on exit");
            Ok(Backends {
                queue: Arc::new(MemoryJobQueue::with_poll_interval(config.worker.poll_interval())),
                slots: Arc::new(MemorySlotStore::new()),
                flows: Arc::new(MemoryFlowStore::new()),
            })
        }
    }
}

/// Build every component without starting anything
pub async fn build_worker(config: &Config) -> Result<Worker> {
    let storage = Arc::new(StorageManager::new(&config.storage.data_dir));
    let backends = open_backends(config, &storage).await?;

    tracing::info!("🔒 Initializing concurrency limiter");
    let limiter = Arc::new(ConcurrencyLimiter::new(
        Arc::clone(&backends.slots),
        LimiterSettings::from(&config.concurrency),
    ));

    tracing::info!("📦 Initializing sandbox pool (capacity {})", config.sandbox.pool_capacity);
    let installer = Arc::new(FsPieceInstaller::new(&config.sandbox.pieces_dir));
    let sandbox_root = PathBuf::from(&config.storage.data_dir).join("sandboxes");
    std::fs::create_dir_all(&sandbox_root)
        .map_err(|e| anyhow::anyhow!("Failed to create sandbox directory: {}", e))?;
    let pool = Arc::new(SandboxPool::new(
        installer,
        sandbox_root,
        SandboxLimits::from_config(&config.sandbox)
            .map_err(|e| anyhow::anyhow!("Failed to locate sandbox runner: {}", e))?,
        config.sandbox.pool_capacity,
    ));

    let consumer = Arc::new(QueueConsumer::new(
        Arc::clone(&backends.queue),
        limiter,
        pool,
        Arc::clone(&backends.flows),
        FlowRunner::new(config.sandbox.step_timeout()),
        ConsumerSettings::from(&config.worker),
    ));

    tracing::info!("🔗 Initializing webhook trigger leases");
    let registry = Arc::new(TriggerRegistry::new());
    let provider = Arc::new(
        HttpWebhookProvider::new(PROVIDER_TIMEOUT)
            .map_err(|e| anyhow::anyhow!("Failed to build webhook provider client: {}", e))?,
    );
    let (manager, reports) = TriggerLeaseManager::new(registry, provider, LeaseSettings::from(&config.triggers));
    let triggers = Arc::new(manager);
    let renewals = RenewalScheduler::new(
        Arc::clone(&triggers),
        Arc::clone(&backends.flows),
        Duration::from_secs(config.triggers.renewal_interval_secs),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to initialize renewal scheduler: {}", e))?;

    Ok(Worker {
        consumer,
        triggers,
        renewals,
        queue: backends.queue,
        storage,
        reports,
    })
}

/// Router over the worker's shared state
pub fn create_app(worker: &Worker) -> Router {
    let consumer: Arc<dyn ConsumerManager> = worker.consumer.clone();
    create_router(AppState {
        consumer,
        triggers: Arc::clone(&worker.triggers),
        queue: Arc::clone(&worker.queue),
    })
}

/// Log renewal health changes reported by the lease manager
async fn log_trigger_reports(mut reports: UnboundedReceiver<TriggerReport>) {
    while let Some(report) = reports.recv().await {
        match report {
            TriggerReport::Renewed { flow_id, expires_at } => {
                tracing::debug!("🔄 Webhook for flow {} renewed until {}", flow_id, expires_at);
            }
            TriggerReport::Degraded { flow_id, failures, reason } => {
                tracing::error!(
                    "🚨 Webhook for flow {} degraded after {} failed renewals: {}",
                    flow_id,
                    failures,
                    reason
                );
            }
            TriggerReport::Recovered { flow_id } => {
                tracing::info!("💚 Webhook for flow {} recovered", flow_id);
            }
        }
    }
}

/// Start the worker and its HTTP server, running until ctrl-c
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting piecework worker...");

    let worker = build_worker(&config).await?;
    let app = create_app(&worker);
    let Worker {
        consumer,
        renewals,
        storage,
        reports,
        ..
    } = worker;

    consumer
        .init()
        .await
        .map_err(|e| anyhow::anyhow!("Consumer failed to initialize: {}", e))?;

    let loop_consumer = Arc::clone(&consumer);
    let consumer_loop = tokio::spawn(async move {
        if let Err(e) = loop_consumer.run().await {
            tracing::error!("❌ Consumer loop exited with error: {}", e);
        }
    });

    tokio::spawn(log_trigger_reports(reports));
    renewals
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start renewal scheduler: {}", e))?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("🛑 Shutdown signal received");
        })
        .await?;

    if let Err(e) = renewals.stop().await {
        tracing::warn!("⚠️ Renewal scheduler did not stop cleanly: {}", e);
    }
    consumer
        .close()
        .await
        .map_err(|e| anyhow::anyhow!("Consumer failed to close: {}", e))?;
    if let Err(e) = consumer_loop.await {
        tracing::warn!("⚠️ Consumer loop task ended abnormally: {}", e);
    }
    storage.close().await;

    tracing::info!("👋 Worker stopped");
    Ok(())
}
