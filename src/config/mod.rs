/// Configuration management for the piecework worker
///
/// Every knob is read from a `PIECEWORK_*` environment variable with a fallback,
/// so the same binary runs unchanged in containers and on a laptop.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Health and webhook ingress server
    pub server: ServerConfig,
    /// Where the SQLite databases live and which queue backend to use
    pub storage: StorageConfig,
    /// Consumer loop behaviour
    pub worker: WorkerConfig,
    /// Sandbox pool and execution limits
    pub sandbox: SandboxConfig,
    /// Per-project concurrency limiter
    pub concurrency: ConcurrencyConfig,
    /// Webhook trigger lease renewal
    pub triggers: TriggerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Job queue backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueBackend {
    /// Shared SQLite file, safe for several worker processes on one host
    Sqlite,
    /// Process-local queue, mostly for development and tests
    Memory,
}

impl FromStr for QueueBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(QueueBackend::Sqlite),
            "memory" => Ok(QueueBackend::Memory),
            other => Err(format!("unknown queue backend: {}", other)),
        }
    }
}

/// Where sandbox executions run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationMode {
    /// Child process per execution; a timed-out execution is killed
    Process,
    /// Blocking thread in the worker; C-bound scripts past their deadline are abandoned
    Thread,
}

impl FromStr for IsolationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(IsolationMode::Process),
            "thread" => Ok(IsolationMode::Thread),
            other => Err(format!("unknown sandbox isolation: {}", other)),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for queue.db, locks.db, flows.db and sandbox working dirs
    pub data_dir: String,
    /// Job queue backend
    pub queue_backend: QueueBackend,
}

/// Consumer manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum jobs processed concurrently by this process
    pub worker_threads: usize,
    /// Deliveries before a failing job is dead-lettered
    pub max_attempts: u32,
    /// How often a polling queue backend looks for new jobs
    pub poll_interval_ms: u64,
    /// How long one claim call waits before the loop re-checks shutdown
    pub claim_wait_ms: u64,
    /// Time in-flight jobs get to finish during close()
    pub drain_grace_secs: u64,
    /// Connectivity checks attempted by init() before giving up
    pub init_retries: u32,
    /// Delay between init() connectivity checks
    pub init_retry_delay_ms: u64,
    /// First nack backoff; doubles per attempt
    pub retry_base_delay_ms: u64,
    /// Claimed jobs older than this are assumed abandoned and requeued
    pub visibility_timeout_secs: u64,
    /// Piece sets installed into warm sandboxes during init()
    pub warm_piece_sets: Vec<crate::sandbox::PieceSet>,
}

/// Sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Maximum sandboxes alive at once (idle + checked out)
    pub pool_capacity: usize,
    /// Timeout applied to every step execution
    pub step_timeout_secs: u64,
    /// Cap on captured stdout and stderr, each
    pub output_limit_bytes: usize,
    /// Lua VM memory limit
    pub memory_limit_bytes: usize,
    /// Extra time a timed-out execution gets to stop before it is abandoned
    pub timeout_grace_ms: u64,
    /// Filesystem piece catalogue: <pieces_dir>/<piece>/<version>/<action>.lua
    pub pieces_dir: String,
    pub isolation: IsolationMode,
    /// Runner binary for process isolation; the worker's own executable when unset
    pub runner_program: Option<String>,
}

/// Concurrency limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Limit used for projects without an override in the store
    pub default_max_concurrent_jobs: u32,
    /// How long acquire() waits for a free slot
    pub acquire_timeout_secs: u64,
    /// Slot lease; a crashed holder's slot is reclaimed after this
    pub slot_lease_secs: u64,
    /// Lease on the mutual-exclusion lock guarding the counter
    pub lock_lease_ms: u64,
    /// First retry delay while waiting for capacity
    pub retry_delay_ms: u64,
    /// Upper bound on the exponential retry delay
    pub max_retry_delay_ms: u64,
}

/// Trigger lease configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Period of the renewal loop
    pub renewal_interval_secs: u64,
    /// Leases expiring within this window are renewed
    pub renewal_window_secs: u64,
    /// Provider calls per renewal before it counts as failed
    pub renewal_attempts: u32,
    /// First backoff between provider calls; doubles per call
    pub renewal_backoff_ms: u64,
    /// Consecutive failed renewals before a trigger is marked degraded
    pub max_consecutive_failures: u32,
}

/// Read an env var and parse it, falling back on absence or parse failure
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let data_dir = env_or("PIECEWORK_DATA_DIR", "data".to_string());
        let pieces_dir = env_or(
            "PIECEWORK_PIECES_DIR",
            PathBuf::from(&data_dir).join("pieces").display().to_string(),
        );

        Self {
            server: ServerConfig {
                host: env_or("PIECEWORK_HOST", "0.0.0.0".to_string()),
                port: env_or("PIECEWORK_PORT", 3005),
            },
            storage: StorageConfig {
                data_dir,
                queue_backend: env_or("PIECEWORK_QUEUE_BACKEND", QueueBackend::Sqlite),
            },
            worker: WorkerConfig {
                worker_threads: env_or("PIECEWORK_WORKER_THREADS", 4),
                max_attempts: env_or("PIECEWORK_MAX_ATTEMPTS", 3),
                poll_interval_ms: env_or("PIECEWORK_POLL_INTERVAL_MS", 250),
                claim_wait_ms: env_or("PIECEWORK_CLAIM_WAIT_MS", 1_000),
                drain_grace_secs: env_or("PIECEWORK_DRAIN_GRACE_SECS", 30),
                init_retries: env_or("PIECEWORK_INIT_RETRIES", 5),
                init_retry_delay_ms: env_or("PIECEWORK_INIT_RETRY_DELAY_MS", 1_000),
                retry_base_delay_ms: env_or("PIECEWORK_RETRY_BASE_DELAY_MS", 1_000),
                visibility_timeout_secs: env_or("PIECEWORK_VISIBILITY_TIMEOUT_SECS", 900),
                warm_piece_sets: Vec::new(),
            },
            sandbox: SandboxConfig {
                pool_capacity: env_or("PIECEWORK_SANDBOX_POOL_CAPACITY", 8),
                step_timeout_secs: env_or("PIECEWORK_STEP_TIMEOUT_SECS", 600),
                output_limit_bytes: env_or("PIECEWORK_OUTPUT_LIMIT_BYTES", 64 * 1024),
                memory_limit_bytes: env_or("PIECEWORK_SANDBOX_MEMORY_LIMIT_BYTES", 128 * 1024 * 1024),
                timeout_grace_ms: env_or("PIECEWORK_TIMEOUT_GRACE_MS", 2_000),
                pieces_dir,
                isolation: env_or("PIECEWORK_SANDBOX_ISOLATION", IsolationMode::Process),
                runner_program: std::env::var("PIECEWORK_SANDBOX_RUNNER").ok(),
            },
            concurrency: ConcurrencyConfig {
                default_max_concurrent_jobs: env_or("PIECEWORK_DEFAULT_MAX_CONCURRENT_JOBS", 10),
                acquire_timeout_secs: env_or("PIECEWORK_SLOT_ACQUIRE_TIMEOUT_SECS", 30),
                slot_lease_secs: env_or("PIECEWORK_SLOT_LEASE_SECS", 60),
                lock_lease_ms: env_or("PIECEWORK_LOCK_LEASE_MS", 5_000),
                retry_delay_ms: env_or("PIECEWORK_LOCK_RETRY_DELAY_MS", 50),
                max_retry_delay_ms: env_or("PIECEWORK_LOCK_MAX_RETRY_DELAY_MS", 2_000),
            },
            triggers: TriggerConfig {
                renewal_interval_secs: env_or("PIECEWORK_RENEWAL_INTERVAL_SECS", 300),
                renewal_window_secs: env_or("PIECEWORK_RENEWAL_WINDOW_SECS", 3_600),
                renewal_attempts: env_or("PIECEWORK_RENEWAL_ATTEMPTS", 3),
                renewal_backoff_ms: env_or("PIECEWORK_RENEWAL_BACKOFF_MS", 500),
                max_consecutive_failures: env_or("PIECEWORK_MAX_RENEWAL_FAILURES", 3),
            },
        }
    }
}

impl WorkerConfig {
    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}

impl SandboxConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn timeout_grace(&self) -> Duration {
        Duration::from_millis(self.timeout_grace_ms)
    }
}
