/// Sandbox layer
///
/// Isolated execution of piece actions and inline scripts:
/// - Lifecycle state machine (CREATED → INITIALIZED → READY)
/// - Lua execution with hard timeouts and capped output, optionally in a
///   child process that is killed on timeout
/// - Process-local pool with LRU eviction
/// - Piece installation through an external installer

// Verdict/timing/output record for one execution
pub mod result;

// Lua VM execution with deadline hook
pub mod lua;

// Child-process runner for killable executions
pub mod runner;

// Piece sets and the installer capability
pub mod installer;

// Sandbox lifecycle state machine
pub mod instance;

// Pool of reusable READY sandboxes
pub mod pool;

pub use installer::{CatalogInstaller, FsPieceInstaller, InstalledPieces, PieceInstaller, PieceSet};
pub use instance::{Sandbox, SandboxLimits, SandboxState};
pub use lua::Isolation;
pub use pool::{PoolStats, SandboxPool};
pub use result::{CodeExecutionResult, Verdict};
