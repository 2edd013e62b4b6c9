/// Distributed concurrency control
///
/// Per-project job limits enforced through a shared lock/counter store.

// Store contract and in-memory backend
pub mod store;

// SQLite backend shared between processes
pub mod sqlite;

// Slot acquisition, release and heartbeat
pub mod limiter;

pub use limiter::{counter_key, ConcurrencyLimiter, LimiterSettings, Slot};
pub use sqlite::SqliteSlotStore;
pub use store::{MemorySlotStore, SlotStore};
