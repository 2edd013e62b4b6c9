/// Flow definitions and run records
///
/// A flow version is an immutable DAG of steps. Each step either calls an
/// installed piece action or runs inline Lua. Flow versions are stored as JSON
/// and compiled into petgraph DAGs by the runner.

use crate::sandbox::{CodeExecutionResult, PieceSet, Verdict};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// One immutable published version of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowVersion {
    /// Version identifier referenced by jobs
    pub id: String,
    pub flow_id: String,
    /// Owning project; the concurrency limit is per project
    pub project_id: String,
    /// Pieces (and versions) the sandbox must have installed
    #[serde(default)]
    pub piece_set: PieceSet,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// A node of the flow DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the flow version; later steps see outputs under this name
    pub name: String,
    pub action: StepAction,
    /// Static parameters handed to the step as `input.params`
    #[serde(default)]
    pub params: Value,
}

/// What a step executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// An action of an installed piece, e.g. `gmail:send_email`
    Piece { piece: String, action: String },
    /// Inline user code
    Code { source: String },
}

/// Data dependency between two steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// Result of one step inside a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub result: CodeExecutionResult,
}

/// Everything one run of a flow version produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunOutcome {
    pub flow_version_id: String,
    /// Verdict of the last executed step (OK for an empty flow)
    pub verdict: Verdict,
    pub steps: Vec<StepRecord>,
    pub duration_secs: f64,
}

impl FlowRunOutcome {
    pub fn is_ok(&self) -> bool {
        self.verdict == Verdict::Ok
    }

    /// Output of the last step, if it produced one
    pub fn output(&self) -> Option<&Value> {
        self.steps.last().and_then(|record| record.result.output())
    }

    /// Step whose verdict stopped the run
    pub fn failed_step(&self) -> Option<&StepRecord> {
        self.steps.iter().find(|record| !record.result.is_ok())
    }
}

/// Final status of one processed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    /// A step ended in RUNTIME_ERROR
    Failed,
    /// A step ended in TIMEOUT
    TimedOut,
    /// The worker could not run the flow (install failure, missing version, ...)
    Errored,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::TimedOut => "TIMED_OUT",
            RunStatus::Errored => "ERRORED",
        };
        f.write_str(name)
    }
}

impl From<Verdict> for RunStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Ok => RunStatus::Succeeded,
            Verdict::RuntimeError => RunStatus::Failed,
            Verdict::Timeout => RunStatus::TimedOut,
        }
    }
}

/// Persisted outcome of one job attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub job_id: Uuid,
    pub flow_run_id: String,
    pub flow_version_id: String,
    pub project_id: String,
    pub attempt: u32,
    pub status: RunStatus,
    /// Worker error text for ERRORED attempts
    pub error: Option<String>,
    pub steps: Vec<StepRecord>,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_flow_version_json() {
        let flow: FlowVersion = serde_json::from_value(json!({
            "id": "fv-1",
            "flow_id": "flow-1",
            "project_id": "acme",
            "piece_set": { "slack": "0.9.1" },
            "steps": [
                { "name": "notify", "action": { "type": "piece", "piece": "slack", "action": "send" } },
                { "name": "shape", "action": { "type": "code", "source": "return 1" }, "params": { "x": 1 } }
            ],
            "edges": [{ "from": "notify", "to": "shape" }]
        }))
        .unwrap();

        assert_eq!(flow.piece_set, PieceSet::new().with("slack", "0.9.1"));
        assert_eq!(
            flow.steps[0].action,
            StepAction::Piece {
                piece: "slack".into(),
                action: "send".into()
            }
        );
        assert_eq!(flow.steps[0].params, Value::Null);
        assert_eq!(flow.steps[1].params, json!({ "x": 1 }));
    }

    #[test]
    fn run_status_follows_verdict() {
        assert_eq!(RunStatus::from(Verdict::Ok), RunStatus::Succeeded);
        assert_eq!(RunStatus::from(Verdict::RuntimeError), RunStatus::Failed);
        assert_eq!(RunStatus::from(Verdict::Timeout), RunStatus::TimedOut);
        assert_eq!(RunStatus::TimedOut.to_string(), "TIMED_OUT");
    }
}
