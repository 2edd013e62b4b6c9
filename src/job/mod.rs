/// Job queue
///
/// Source of flow-run jobs for the consumer. The consumer only sees the
/// `JobQueue` trait; the backend is chosen at startup.

// Job, payload and dead-letter records
pub mod types;

// JobQueue contract and in-memory backend
pub mod queue;

// Multi-process SQLite backend
pub mod sqlite;

pub use queue::{JobQueue, MemoryJobQueue};
pub use sqlite::SqliteJobQueue;
pub use types::{DeadLetter, Job, JobPayload, NewJob};
