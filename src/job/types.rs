/// Job records exchanged with the queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What a job asks the worker to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub flow_version_id: String,
    /// Body handed to the flow as `input.trigger`
    #[serde(default)]
    pub trigger_payload: Value,
}

/// A unit of work owned by the queue until claimed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: String,
    pub flow_run_id: String,
    /// 1-based; the first delivery is attempt 1
    pub attempt: u32,
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
    /// Token of the claim that delivered this copy; queue decisions must present it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<Uuid>,
}

impl Job {
    /// No further delivery is allowed after this one fails
    pub fn is_final_attempt(&self, max_attempts: u32) -> bool {
        self.attempt >= max_attempts
    }
}

/// A job about to be enqueued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub project_id: String,
    pub flow_run_id: String,
    pub payload: JobPayload,
}

impl NewJob {
    pub fn new(
        project_id: impl Into<String>,
        flow_run_id: impl Into<String>,
        flow_version_id: impl Into<String>,
        trigger_payload: Value,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            flow_run_id: flow_run_id.into(),
            payload: JobPayload {
                flow_version_id: flow_version_id.into(),
                trigger_payload,
            },
        }
    }

    /// Start a fresh flow run with a generated id
    pub fn fresh_run(project_id: impl Into<String>, flow_version_id: impl Into<String>, trigger_payload: Value) -> Self {
        Self::new(project_id, Uuid::new_v4().to_string(), flow_version_id, trigger_payload)
    }

    pub(crate) fn into_job(self) -> Job {
        Job {
            id: Uuid::new_v4(),
            project_id: self.project_id,
            flow_run_id: self.flow_run_id,
            attempt: 1,
            payload: self.payload,
            enqueued_at: Utc::now(),
            claim_id: None,
        }
    }
}

/// A job that exhausted its attempts or failed for good
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}
