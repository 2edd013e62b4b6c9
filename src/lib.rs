/// Piecework: flow-execution worker
///
/// Consumes queued flow-run jobs, bounds per-project concurrency through a
/// shared lock store, executes steps inside reusable Lua sandboxes, and keeps
/// externally registered webhook triggers alive.

// Core configuration and setup
pub mod config;

// Error taxonomy shared by every layer
pub mod error;

// Shared SQLite pools
pub mod storage;

// Sandbox lifecycle, execution and pooling
pub mod sandbox;

// Distributed per-project concurrency limiter
pub mod concurrency;

// Flow versions, the step runner and run records
pub mod flow;

// Job queue contract and backends
pub mod job;

// Webhook trigger leases and delivery extraction
pub mod trigger;

// Consumer manager: dequeue loop and per-job pipeline
pub mod consumer;

// HTTP API layer - health probes and webhook ingress
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use concurrency::{ConcurrencyLimiter, Slot};
pub use consumer::{ConsumerManager, QueueConsumer};
pub use error::{Result, WorkerError};
pub use sandbox::{CodeExecutionResult, Sandbox, SandboxState, Verdict};
pub use server::start_server;
pub use trigger::{TriggerLease, TriggerLeaseManager};
