/// Flow definitions, persistence and execution

// Flow versions, steps, run records
pub mod types;

// FlowStore contract with memory and SQLite backends
pub mod store;

// DAG validation and step-by-step execution
pub mod engine;

pub use engine::FlowRunner;
pub use store::{FlowStore, MemoryFlowStore, SqliteFlowStore};
pub use types::{Edge, FlowRunOutcome, FlowVersion, RunRecord, RunStatus, Step, StepAction, StepRecord};
