/// Flow store contract and backends
///
/// The narrow read/write surface the worker needs from the platform's
/// persistence: fetch a published flow version, record a run outcome, and
/// list the webhook triggers whose leases must be kept alive. Definitions are
/// stored as JSON with indexed lookup columns.

use crate::error::Result;
use crate::flow::types::{FlowVersion, RunRecord};
use crate::trigger::types::WebhookTrigger;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn get_flow_version(&self, id: &str) -> Result<Option<FlowVersion>>;

    /// Publish (or overwrite) a flow version
    async fn save_flow_version(&self, flow: &FlowVersion) -> Result<()>;

    /// Persist the outcome of one job attempt
    async fn record_run(&self, record: &RunRecord) -> Result<()>;

    /// Recorded attempts of one flow run, oldest first
    async fn runs(&self, flow_run_id: &str) -> Result<Vec<RunRecord>>;

    async fn active_webhook_triggers(&self) -> Result<Vec<WebhookTrigger>>;

    /// Register (or replace) the webhook trigger of a flow
    async fn save_webhook_trigger(&self, trigger: &WebhookTrigger) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryFlows {
    versions: HashMap<String, FlowVersion>,
    runs: Vec<RunRecord>,
    triggers: HashMap<String, WebhookTrigger>,
}

/// In-memory flow store for tests and the memory backend
#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    inner: RwLock<MemoryFlows>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn get_flow_version(&self, id: &str) -> Result<Option<FlowVersion>> {
        Ok(self.inner.read().await.versions.get(id).cloned())
    }

    async fn save_flow_version(&self, flow: &FlowVersion) -> Result<()> {
        self.inner.write().await.versions.insert(flow.id.clone(), flow.clone());
        Ok(())
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        self.inner.write().await.runs.push(record.clone());
        Ok(())
    }

    async fn runs(&self, flow_run_id: &str) -> Result<Vec<RunRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .runs
            .iter()
            .filter(|record| record.flow_run_id == flow_run_id)
            .cloned()
            .collect())
    }

    async fn active_webhook_triggers(&self) -> Result<Vec<WebhookTrigger>> {
        let mut triggers: Vec<WebhookTrigger> = self.inner.read().await.triggers.values().cloned().collect();
        triggers.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));
        Ok(triggers)
    }

    async fn save_webhook_trigger(&self, trigger: &WebhookTrigger) -> Result<()> {
        self.inner
            .write()
            .await
            .triggers
            .insert(trigger.flow_id.clone(), trigger.clone());
        Ok(())
    }
}

/// SQLite-backed flow store (flows.db)
#[derive(Debug, Clone)]
pub struct SqliteFlowStore {
    pool: SqlitePool,
}

impl SqliteFlowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the flow_versions, flow_runs and webhook_triggers tables
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_versions (
                id TEXT PRIMARY KEY,
                flow_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_flow_versions_flow ON flow_versions(flow_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_runs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                flow_run_id TEXT NOT NULL,
                status TEXT NOT NULL,
                record JSON NOT NULL,
                recorded_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_flow_runs_run ON flow_runs(flow_run_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhook_triggers (
                flow_id TEXT PRIMARY KEY,
                definition JSON NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FlowStore for SqliteFlowStore {
    async fn get_flow_version(&self, id: &str) -> Result<Option<FlowVersion>> {
        let row = sqlx::query("SELECT definition FROM flow_versions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    async fn save_flow_version(&self, flow: &FlowVersion) -> Result<()> {
        let definition = serde_json::to_string(flow)?;
        sqlx::query(
            r#"
            INSERT INTO flow_versions (id, flow_id, project_id, definition)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                flow_id = excluded.flow_id,
                project_id = excluded.project_id,
                definition = excluded.definition
            "#,
        )
        .bind(&flow.id)
        .bind(&flow.flow_id)
        .bind(&flow.project_id)
        .bind(&definition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run(&self, record: &RunRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        sqlx::query("INSERT INTO flow_runs (job_id, flow_run_id, status, record) VALUES (?, ?, ?, ?)")
            .bind(record.job_id.to_string())
            .bind(&record.flow_run_id)
            .bind(record.status.to_string())
            .bind(&json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn runs(&self, flow_run_id: &str) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query("SELECT record FROM flow_runs WHERE flow_run_id = ? ORDER BY seq")
            .bind(flow_run_id)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let json: String = row.get("record");
            records.push(serde_json::from_str(&json)?);
        }
        Ok(records)
    }

    async fn active_webhook_triggers(&self) -> Result<Vec<WebhookTrigger>> {
        let rows = sqlx::query("SELECT definition FROM webhook_triggers WHERE active = 1 ORDER BY flow_id")
            .fetch_all(&self.pool)
            .await?;

        let mut triggers = Vec::with_capacity(rows.len());
        for row in rows {
            let definition: String = row.get("definition");
            triggers.push(serde_json::from_str(&definition)?);
        }
        Ok(triggers)
    }

    async fn save_webhook_trigger(&self, trigger: &WebhookTrigger) -> Result<()> {
        let definition = serde_json::to_string(trigger)?;
        sqlx::query(
            r#"
            INSERT INTO webhook_triggers (flow_id, definition, active, updated_at)
            VALUES (?, ?, 1, CURRENT_TIMESTAMP)
            ON CONFLICT(flow_id) DO UPDATE SET
                definition = excluded.definition,
                active = 1,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&trigger.flow_id)
        .bind(&definition)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{RunStatus, Step, StepAction};
    use crate::sandbox::PieceSet;
    use crate::storage::database::open_pool;
    use chrono::Utc;
    use serde_json::Value;
    use uuid::Uuid;

    fn flow_version() -> FlowVersion {
        FlowVersion {
            id: "fv-1".into(),
            flow_id: "flow-1".into(),
            project_id: "acme".into(),
            piece_set: PieceSet::new(),
            steps: vec![Step {
                name: "only".into(),
                action: StepAction::Code {
                    source: "return {success = true}".into(),
                },
                params: Value::Null,
            }],
            edges: vec![],
        }
    }

    fn trigger(flow_id: &str) -> WebhookTrigger {
        WebhookTrigger {
            flow_id: flow_id.into(),
            project_id: "acme".into(),
            flow_version_id: "fv-1".into(),
            provider: "github".into(),
            renew_url: "http://localhost/renew".into(),
            items_path: None,
            challenge_field: None,
            verification_header: None,
        }
    }

    fn record(attempt: u32, status: RunStatus) -> RunRecord {
        RunRecord {
            job_id: Uuid::new_v4(),
            flow_run_id: "run-1".into(),
            flow_version_id: "fv-1".into(),
            project_id: "acme".into(),
            attempt,
            status,
            error: None,
            steps: vec![],
            recorded_at: Utc::now(),
        }
    }

    async fn exercise(store: &dyn FlowStore) {
        assert!(store.get_flow_version("fv-1").await.unwrap().is_none());
        store.save_flow_version(&flow_version()).await.unwrap();
        assert_eq!(store.get_flow_version("fv-1").await.unwrap(), Some(flow_version()));

        store.record_run(&record(1, RunStatus::TimedOut)).await.unwrap();
        store.record_run(&record(2, RunStatus::Succeeded)).await.unwrap();
        let runs = store.runs("run-1").await.unwrap();
        assert_eq!(runs.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2]);
        assert!(store.runs("run-2").await.unwrap().is_empty());

        store.save_webhook_trigger(&trigger("flow-b")).await.unwrap();
        store.save_webhook_trigger(&trigger("flow-a")).await.unwrap();
        store.save_webhook_trigger(&trigger("flow-a")).await.unwrap();
        let flows: Vec<String> = store
            .active_webhook_triggers()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.flow_id)
            .collect();
        assert_eq!(flows, vec!["flow-a", "flow-b"]);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        exercise(&MemoryFlowStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("flows.db")).await.unwrap();
        let store = SqliteFlowStore::new(pool);
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
        exercise(&store).await;
    }
}
