/// SQLite pool manager for the worker's shared stores
///
/// Manages one SQLite database per store under the data directory:
/// - queue.db: job queue and dead letters
/// - locks.db: concurrency locks, slots and per-project limits
/// - flows.db: flow versions, webhook triggers and run records
///
/// Pools are opened lazily and cached. WAL journaling plus a busy timeout let
/// several worker processes on the same host share the files safely.

use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

/// Busy timeout applied to every connection; writers from other processes
/// wait this long for the database lock instead of failing
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Lazily-created, cached SQLite pools keyed by database name
#[derive(Debug)]
pub struct StorageManager {
    /// Connection pools by database name ("queue", "locks", "flows")
    pools: RwLock<HashMap<String, SqlitePool>>,
    /// Base directory for database files
    data_dir: PathBuf,
}

impl StorageManager {
    /// Create new storage manager rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Get or create the pool for `{data_dir}/{name}.db`
    ///
    /// Read lock first for the common case, then double-check under the write
    /// lock so concurrent callers never open the same file twice.
    pub async fn pool(&self, name: &str) -> Result<SqlitePool> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(name) {
                return Ok(pool.clone());
            }
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(name) {
            return Ok(pool.clone());
        }

        std::fs::create_dir_all(&self.data_dir)?;
        let db_path = self.data_dir.join(format!("{}.db", name));

        tracing::info!("🗄️ Opening database pool: {}", db_path.display());

        let pool = open_pool(&db_path).await?;
        pools.insert(name.to_string(), pool.clone());

        Ok(pool)
    }

    /// Close every cached pool
    pub async fn close(&self) {
        let mut pools = self.pools.write().await;
        for (name, pool) in pools.drain() {
            tracing::debug!("🔒 Closing database pool: {}", name);
            pool.close().await;
        }
    }

    /// Number of open pools, for monitoring
    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }
}

/// Open a WAL-mode pool on a single database file, creating it if missing
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    Ok(pool)
}
