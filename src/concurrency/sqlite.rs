/// SQLite-backed lock/counter store
///
/// Shared by every worker process pointing at the same locks.db. The lock is
/// a row claimed with a conditional upsert (only when the previous lease has
/// expired); slots are rows with their own expiry.

use crate::concurrency::store::SlotStore;
use crate::error::{Result, WorkerError};
use crate::storage::now_millis;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePool;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SqliteSlotStore {
    pool: SqlitePool,
}

impl SqliteSlotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the locks, slots and project_limits tables (idempotent)
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS slots (
                slot_id TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                holder TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_slots_key ON slots(key)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS project_limits (
                project_id TEXT PRIMARY KEY,
                max_concurrent_jobs INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl SlotStore for SqliteSlotStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| WorkerError::LockStoreUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn try_lock(&self, name: &str, holder: &str, lease: Duration) -> Result<bool> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO locks (name, holder, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE locks.expires_at <= ?
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(now + lease_millis(lease))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn unlock(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE name = ? AND holder = ?")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn live_slots(&self, key: &str) -> Result<u32> {
        let now = now_millis();
        sqlx::query("DELETE FROM slots WHERE key = ? AND expires_at <= ?")
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM slots WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn insert_slot(&self, key: &str, slot_id: Uuid, holder: &str, lease: Duration) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            "INSERT INTO slots (slot_id, key, holder, acquired_at, expires_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(slot_id.to_string())
        .bind(key)
        .bind(holder)
        .bind(now)
        .bind(now + lease_millis(lease))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_slot(&self, key: &str, slot_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM slots WHERE slot_id = ? AND key = ? AND expires_at > ?")
            .bind(slot_id.to_string())
            .bind(key)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew_slot(&self, key: &str, slot_id: Uuid, lease: Duration) -> Result<bool> {
        let now = now_millis();
        let result = sqlx::query("UPDATE slots SET expires_at = ? WHERE slot_id = ? AND key = ? AND expires_at > ?")
            .bind(now + lease_millis(lease))
            .bind(slot_id.to_string())
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn project_limit(&self, project_id: &str) -> Result<Option<u32>> {
        let limit: Option<i64> = sqlx::query_scalar("SELECT max_concurrent_jobs FROM project_limits WHERE project_id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(limit.map(|value| u32::try_from(value.max(0)).unwrap_or(u32::MAX)))
    }

    async fn set_project_limit(&self, project_id: &str, limit: u32) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO project_limits (project_id, max_concurrent_jobs)
            VALUES (?, ?)
            ON CONFLICT(project_id) DO UPDATE SET max_concurrent_jobs = excluded.max_concurrent_jobs
            "#,
        )
        .bind(project_id)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
