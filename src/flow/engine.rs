/// Petgraph-based flow runner
///
/// Compiles a flow version into a DAG, validates it, and runs its steps in
/// topological order inside one READY sandbox. Each step receives
/// `input = { params, trigger, steps }` where `steps` maps earlier step
/// names to their outputs. The run stops at the first non-OK verdict.

use crate::error::{Result, WorkerError};
use crate::flow::types::{FlowRunOutcome, FlowVersion, StepAction, StepRecord};
use crate::sandbox::{Sandbox, Verdict};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Executes flow versions step by step
#[derive(Debug, Clone)]
pub struct FlowRunner {
    /// Timeout applied to every step
    step_timeout: Duration,
}

impl FlowRunner {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Validate `flow` and return its step indexes in execution order
    ///
    /// Rejects duplicate step names, edges to unknown steps, cycles, and piece
    /// actions whose piece is missing from the flow's piece set.
    pub fn plan(&self, flow: &FlowVersion) -> Result<Vec<usize>> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut name_to_index: HashMap<&str, NodeIndex> = HashMap::new();

        for (position, step) in flow.steps.iter().enumerate() {
            if let StepAction::Piece { piece, .. } = &step.action {
                if !flow.piece_set.contains(piece) {
                    return Err(WorkerError::InvalidFlow(format!(
                        "step '{}' uses piece '{}' which is not in the piece set [{}]",
                        step.name, piece, flow.piece_set
                    )));
                }
            }
            let node = graph.add_node(position);
            if name_to_index.insert(step.name.as_str(), node).is_some() {
                return Err(WorkerError::InvalidFlow(format!("duplicate step name '{}'", step.name)));
            }
        }

        for edge in &flow.edges {
            let from = name_to_index
                .get(edge.from.as_str())
                .ok_or_else(|| WorkerError::InvalidFlow(format!("edge references unknown step '{}'", edge.from)))?;
            let to = name_to_index
                .get(edge.to.as_str())
                .ok_or_else(|| WorkerError::InvalidFlow(format!("edge references unknown step '{}'", edge.to)))?;
            graph.add_edge(*from, *to, ());
        }

        let order = toposort(&graph, None)
            .map_err(|_| WorkerError::InvalidFlow(format!("flow version '{}' contains a cycle", flow.id)))?;

        Ok(order.into_iter().map(|node| graph[node]).collect())
    }

    /// Run every step of `flow` in `sandbox`
    ///
    /// Script failures and timeouts end the run with that verdict; only
    /// worker-side faults (invalid flow, sandbox not READY, unknown action)
    /// come back as errors.
    pub async fn run(&self, sandbox: &mut Sandbox, flow: &FlowVersion, trigger: &Value) -> Result<FlowRunOutcome> {
        let started = Instant::now();
        let order = self.plan(flow)?;

        tracing::info!("🚀 Running flow version '{}' ({} steps)", flow.id, order.len());

        let mut outputs = Map::new();
        let mut records = Vec::with_capacity(order.len());
        let mut verdict = Verdict::Ok;

        for (number, position) in order.into_iter().enumerate() {
            let step = &flow.steps[position];
            tracing::debug!("📍 Step {}: '{}'", number + 1, step.name);

            let input = json!({
                "params": step.params,
                "trigger": trigger,
                "steps": Value::Object(outputs.clone()),
            });

            let result = sandbox.execute(&step.action, &input, self.step_timeout).await?;
            verdict = result.verdict();

            if let Some(output) = result.output() {
                outputs.insert(step.name.clone(), output.clone());
            }
            records.push(StepRecord {
                step: step.name.clone(),
                result,
            });

            if verdict != Verdict::Ok {
                tracing::warn!("⏸️ Flow version '{}' stopped at step '{}' with {}", flow.id, step.name, verdict);
                break;
            }
        }

        let duration = started.elapsed();
        tracing::info!("🏁 Flow version '{}' finished with {} in {:?}", flow.id, verdict, duration);

        Ok(FlowRunOutcome {
            flow_version_id: flow.id.clone(),
            verdict,
            steps: records,
            duration_secs: duration.as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::{Edge, Step};
    use crate::sandbox::{CatalogInstaller, PieceSet, SandboxLimits};

    fn flow(steps: Vec<Step>, edges: Vec<(&str, &str)>) -> FlowVersion {
        FlowVersion {
            id: "fv-1".into(),
            flow_id: "flow-1".into(),
            project_id: "acme".into(),
            piece_set: PieceSet::new().with("math", "1"),
            steps,
            edges: edges
                .into_iter()
                .map(|(from, to)| Edge {
                    from: from.into(),
                    to: to.into(),
                })
                .collect(),
        }
    }

    fn code(name: &str, source: &str) -> Step {
        Step {
            name: name.into(),
            action: StepAction::Code { source: source.into() },
            params: Value::Null,
        }
    }

    async fn ready_sandbox(root: &std::path::Path) -> Sandbox {
        let mut sandbox = Sandbox::new(
            root,
            SandboxLimits {
                grace: Duration::from_secs(1),
                output_limit_bytes: 4096,
                memory_limit_bytes: 32 * 1024 * 1024,
                isolation: crate::sandbox::Isolation::Thread,
            },
        );
        sandbox.init().await.unwrap();
        let installer = CatalogInstaller::new().with_action("math", "1", "double", "return input.steps.seed * 2");
        sandbox
            .install(&installer, &PieceSet::new().with("math", "1"))
            .await
            .unwrap();
        sandbox
    }

    #[test]
    fn rejects_cycles_and_unknown_edges() {
        let runner = FlowRunner::new(Duration::from_secs(1));

        let cyclic = flow(vec![code("a", "return 1"), code("b", "return 2")], vec![("a", "b"), ("b", "a")]);
        assert!(matches!(runner.plan(&cyclic), Err(WorkerError::InvalidFlow(_))));

        let dangling = flow(vec![code("a", "return 1")], vec![("a", "ghost")]);
        assert!(matches!(runner.plan(&dangling), Err(WorkerError::InvalidFlow(msg)) if msg.contains("ghost")));

        let duplicate = flow(vec![code("a", "return 1"), code("a", "return 2")], vec![]);
        assert!(runner.plan(&duplicate).is_err());
    }

    #[test]
    fn rejects_piece_outside_piece_set() {
        let runner = FlowRunner::new(Duration::from_secs(1));
        let stray = flow(
            vec![Step {
                name: "post".into(),
                action: StepAction::Piece {
                    piece: "slack".into(),
                    action: "send".into(),
                },
                params: Value::Null,
            }],
            vec![],
        );
        assert!(matches!(runner.plan(&stray), Err(WorkerError::InvalidFlow(msg)) if msg.contains("slack")));
    }

    #[test]
    fn plans_in_dependency_order() {
        let runner = FlowRunner::new(Duration::from_secs(1));
        let chain = flow(
            vec![code("last", "return 3"), code("first", "return 1"), code("middle", "return 2")],
            vec![("first", "middle"), ("middle", "last")],
        );
        assert_eq!(runner.plan(&chain).unwrap(), vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn later_steps_see_earlier_outputs() {
        let root = tempfile::tempdir().unwrap();
        let mut sandbox = ready_sandbox(root.path()).await;
        let runner = FlowRunner::new(Duration::from_secs(5));

        let mut chain = flow(
            vec![
                code("seed", "return input.trigger.n + input.params"),
                Step {
                    name: "double".into(),
                    action: StepAction::Piece {
                        piece: "math".into(),
                        action: "double".into(),
                    },
                    params: Value::Null,
                },
            ],
            vec![("seed", "double")],
        );
        chain.steps[0].params = json!(1);

        let outcome = runner.run(&mut sandbox, &chain, &json!({ "n": 4 })).await.unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.output(), Some(&json!(10)));
    }

    #[tokio::test]
    async fn stops_at_first_failing_step() {
        let root = tempfile::tempdir().unwrap();
        let mut sandbox = ready_sandbox(root.path()).await;
        let runner = FlowRunner::new(Duration::from_secs(5));

        let broken = flow(
            vec![code("boom", "error('kaput')"), code("never", "return 1")],
            vec![("boom", "never")],
        );
        let outcome = runner.run(&mut sandbox, &broken, &Value::Null).await.unwrap();
        assert_eq!(outcome.verdict, Verdict::RuntimeError);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.failed_step().map(|r| r.step.as_str()), Some("boom"));
        assert!(outcome.steps[0].result.stderr().contains("kaput"));
    }
}
