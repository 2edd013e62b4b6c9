/// SQLite-backed job queue (queue.db)
///
/// Several worker processes can share one queue file. A claim is a single
/// `UPDATE ... RETURNING` statement, so two workers never receive the same
/// job. Each claim stamps a `claim_id` that every later decision must match,
/// and the owner keeps `claimed_at` fresh through `extend_claim`. Claims
/// older than the visibility timeout belong to crashed workers and are put
/// back in line before each claim.

use crate::error::{Result, WorkerError};
use crate::job::queue::JobQueue;
use crate::job::types::{DeadLetter, Job, JobPayload, NewJob};
use crate::storage::now_millis;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::time::{Duration, Instant};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, project_id, flow_run_id, attempt, payload, enqueued_at, claim_id";

#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    poll_interval: Duration,
    visibility_timeout: Duration,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn timestamp(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn claim_token(job: &Job) -> Option<String> {
    job.claim_id.map(|c| c.to_string())
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let attempt: i64 = row.try_get("attempt")?;
    let payload: JobPayload = serde_json::from_str(&payload)?;
    let claim_id: Option<String> = row.try_get("claim_id")?;

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| WorkerError::QueueUnavailable(format!("corrupt job id '{}': {}", id, e)))?,
        project_id: row.try_get("project_id")?,
        flow_run_id: row.try_get("flow_run_id")?,
        attempt: u32::try_from(attempt).unwrap_or(1),
        payload,
        enqueued_at: timestamp(row.try_get("enqueued_at")?),
        claim_id: claim_id.and_then(|c| Uuid::parse_str(&c).ok()),
    })
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, poll_interval: Duration, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            poll_interval,
            visibility_timeout,
        }
    }

    /// Create the jobs table and its indexes (idempotent)
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                project_id TEXT NOT NULL,
                flow_run_id TEXT NOT NULL,
                attempt INTEGER NOT NULL DEFAULT 1,
                payload JSON NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                enqueued_at INTEGER NOT NULL,
                available_at INTEGER NOT NULL,
                claimed_at INTEGER,
                claim_id TEXT,
                last_error TEXT,
                dead_lettered_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, available_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs(flow_run_id, state, seq)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Return abandoned claims to the queue without consuming an attempt
    async fn recover_stale_claims(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE jobs SET state = 'pending', claimed_at = NULL, claim_id = NULL, available_at = ? WHERE state = 'claimed' AND claimed_at <= ?",
        )
        .bind(now)
        .bind(now - millis(self.visibility_timeout))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!("♻️ Recovered {} stale job claim(s)", result.rows_affected());
        }
        Ok(result.rows_affected())
    }

    async fn try_claim(&self) -> Result<Option<Job>> {
        let now = now_millis();
        self.recover_stale_claims(now).await?;

        let query = format!(
            r#"
            UPDATE jobs SET state = 'claimed', claimed_at = ?, claim_id = ?
            WHERE seq = (
                SELECT j.seq FROM jobs j
                WHERE j.state = 'pending'
                  AND j.available_at <= ?
                  AND j.seq = (
                      SELECT MIN(p.seq) FROM jobs p
                      WHERE p.flow_run_id = j.flow_run_id AND p.state = 'pending'
                  )
                  AND NOT EXISTS (
                      SELECT 1 FROM jobs c
                      WHERE c.flow_run_id = j.flow_run_id AND c.state = 'claimed'
                  )
                ORDER BY j.seq
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(now)
            .bind(Uuid::new_v4().to_string())
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn requeue(&self, job: &Job, attempt: u32, delay: Duration, reason: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'pending', attempt = ?, available_at = ?, claimed_at = NULL,
                claim_id = NULL, last_error = COALESCE(?, last_error)
            WHERE id = ? AND state = 'claimed' AND claim_id = ?
            "#,
        )
        .bind(i64::from(attempt))
        .bind(now_millis() + millis(delay))
        .bind(reason)
        .bind(job.id.to_string())
        .bind(claim_token(job))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| WorkerError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn enqueue(&self, job: NewJob) -> Result<Job> {
        let job = job.into_job();
        let payload = serde_json::to_string(&job.payload)?;
        let enqueued_at = job.enqueued_at.timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, project_id, flow_run_id, attempt, payload, state, enqueued_at, available_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.project_id)
        .bind(&job.flow_run_id)
        .bind(i64::from(job.attempt))
        .bind(&payload)
        .bind(enqueued_at)
        .bind(enqueued_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!("📥 Enqueued job {} (flow run {})", job.id, job.flow_run_id);
        Ok(job)
    }

    async fn claim(&self, wait: Duration) -> Result<Option<Job>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_claim().await? {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    async fn ack(&self, job: &Job) -> Result<()> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = ? AND state = 'claimed' AND claim_id = ?")
            .bind(job.id.to_string())
            .bind(claim_token(job))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            tracing::warn!("⚠️ Ack for job {} which is not claimed", job.id);
        }
        Ok(())
    }

    async fn nack(&self, job: &Job, reason: &str, delay: Duration) -> Result<()> {
        if self.requeue(job, job.attempt + 1, delay, Some(reason)).await? {
            tracing::debug!("🔁 Job {} requeued in {:?}: {}", job.id, delay, reason);
        } else {
            tracing::warn!("⚠️ Nack for job {} which is not claimed", job.id);
        }
        Ok(())
    }

    async fn defer(&self, job: &Job, delay: Duration) -> Result<()> {
        if !self.requeue(job, job.attempt, delay, None).await? {
            tracing::warn!("⚠️ Defer for job {} which is not claimed", job.id);
        }
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, reason: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'dead', attempt = ?, last_error = ?, dead_lettered_at = ?,
                claimed_at = NULL, claim_id = NULL
            WHERE id = ? AND state = 'claimed' AND claim_id = ?
            "#,
        )
        .bind(i64::from(job.attempt))
        .bind(reason)
        .bind(now_millis())
        .bind(job.id.to_string())
        .bind(claim_token(job))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            tracing::warn!("⚠️ Dead-letter for job {} which is not claimed", job.id);
        }
        Ok(())
    }

    async fn extend_claim(&self, job: &Job) -> Result<bool> {
        let result = sqlx::query("UPDATE jobs SET claimed_at = ? WHERE id = ? AND state = 'claimed' AND claim_id = ?")
            .bind(now_millis())
            .bind(job.id.to_string())
            .bind(claim_token(job))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn visibility_timeout(&self) -> Option<Duration> {
        Some(self.visibility_timeout)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let query = format!(
            "SELECT {}, last_error, dead_lettered_at FROM jobs WHERE state = 'dead' ORDER BY dead_lettered_at, seq",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut letters = Vec::with_capacity(rows.len());
        for row in &rows {
            let reason: Option<String> = row.try_get("last_error")?;
            let at: Option<i64> = row.try_get("dead_lettered_at")?;
            letters.push(DeadLetter {
                job: job_from_row(row)?,
                reason: reason.unwrap_or_default(),
                dead_lettered_at: at.map(timestamp).unwrap_or_else(Utc::now),
            });
        }
        Ok(letters)
    }

    async fn pending(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::open_pool;
    use serde_json::json;

    async fn queue(visibility: Duration) -> (tempfile::TempDir, SqliteJobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("queue.db")).await.unwrap();
        let queue = SqliteJobQueue::new(pool, Duration::from_millis(10), visibility);
        queue.init_schema().await.unwrap();
        (dir, queue)
    }

    fn job(run: &str) -> NewJob {
        NewJob::new("acme", run, "fv-1", json!({ "hello": "world" }))
    }

    #[tokio::test]
    async fn claims_fifo_per_flow_run() {
        let (_dir, queue) = queue(Duration::from_secs(60)).await;
        let a1 = queue.enqueue(job("run-a")).await.unwrap();
        let a2 = queue.enqueue(job("run-a")).await.unwrap();
        let b1 = queue.enqueue(job("run-b")).await.unwrap();

        let first = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.id, a1.id);
        assert_eq!(first.payload, a1.payload);
        assert_eq!(first.enqueued_at.timestamp_millis(), a1.enqueued_at.timestamp_millis());
        // run-a is busy, so run-b's job is next even though a2 is older
        let second = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second.id, b1.id);
        assert!(queue.claim(Duration::from_millis(30)).await.unwrap().is_none());

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.claim(Duration::ZERO).await.unwrap().map(|j| j.id), Some(a2.id));
    }

    #[tokio::test]
    async fn nack_defer_and_dead_letter() {
        let (_dir, queue) = queue(Duration::from_secs(60)).await;
        queue.enqueue(job("run-a")).await.unwrap();

        let claimed = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        queue.nack(&claimed, "timeout", Duration::ZERO).await.unwrap();
        let retried = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(retried.attempt, 2);

        queue.defer(&retried, Duration::ZERO).await.unwrap();
        let deferred = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(deferred.attempt, 2);

        queue.dead_letter(&deferred, "gave up").await.unwrap();
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].job.id, claimed.id);
        assert_eq!(dead[0].reason, "gave up");
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert!(queue.claim(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_claims_are_recovered() {
        let (_dir, queue) = queue(Duration::from_millis(30)).await;
        let enqueued = queue.enqueue(job("run-a")).await.unwrap();

        let crashed = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(crashed.id, enqueued.id);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let recovered = queue.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(recovered.id, enqueued.id);
        assert_eq!(recovered.attempt, 1);
    }

    #[tokio::test]
    async fn extended_claim_is_not_redelivered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let visibility = Duration::from_millis(100);
        let a = SqliteJobQueue::new(open_pool(&path).await.unwrap(), Duration::from_millis(5), visibility);
        a.init_schema().await.unwrap();
        let b = SqliteJobQueue::new(open_pool(&path).await.unwrap(), Duration::from_millis(5), visibility);
        a.enqueue(job("run-a")).await.unwrap();

        let owned = a.claim(Duration::ZERO).await.unwrap().unwrap();
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(a.extend_claim(&owned).await.unwrap());
        }
        assert!(b.claim(Duration::ZERO).await.unwrap().is_none());

        a.ack(&owned).await.unwrap();
        assert_eq!(a.pending().await.unwrap(), 0);
        assert!(b.claim(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_owner_cannot_settle_a_reclaimed_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let visibility = Duration::from_millis(100);
        let a = SqliteJobQueue::new(open_pool(&path).await.unwrap(), Duration::from_millis(5), visibility);
        a.init_schema().await.unwrap();
        let b = SqliteJobQueue::new(open_pool(&path).await.unwrap(), Duration::from_millis(5), visibility);
        a.enqueue(job("run-a")).await.unwrap();

        let stale = a.claim(Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let current = b.claim(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(current.id, stale.id);
        assert_ne!(current.claim_id, stale.claim_id);

        // The first worker's decisions no longer touch the row
        assert!(!a.extend_claim(&stale).await.unwrap());
        a.ack(&stale).await.unwrap();
        a.nack(&stale, "late", Duration::ZERO).await.unwrap();
        a.dead_letter(&stale, "late").await.unwrap();
        assert!(b.dead_letters().await.unwrap().is_empty());
        assert!(b.extend_claim(&current).await.unwrap());

        b.ack(&current).await.unwrap();
        assert!(!b.extend_claim(&current).await.unwrap());
    }

    #[tokio::test]
    async fn two_queues_on_one_file_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let one = SqliteJobQueue::new(open_pool(&path).await.unwrap(), Duration::from_millis(5), Duration::from_secs(60));
        one.init_schema().await.unwrap();
        let two = SqliteJobQueue::new(open_pool(&path).await.unwrap(), Duration::from_millis(5), Duration::from_secs(60));

        for i in 0..10 {
            one.enqueue(job(&format!("run-{}", i))).await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        loop {
            let (a, b) = tokio::join!(one.claim(Duration::ZERO), two.claim(Duration::ZERO));
            let claimed: Vec<Job> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();
            if claimed.is_empty() {
                break;
            }
            for job in claimed {
                assert!(seen.insert(job.id), "job {} delivered twice", job.id);
            }
        }
        assert_eq!(seen.len(), 10);
    }
}
