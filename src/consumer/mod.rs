/// Job consumer
///
/// Pulls jobs from the queue and drives each one through the concurrency
/// limiter, the sandbox pool and the flow runner.

// ConsumerManager trait and the queue-driven loop
pub mod manager;

// One job, end to end
pub mod processor;

// Outcome counters
pub mod stats;

pub use manager::{ConsumerManager, ConsumerSettings, QueueConsumer};
pub use processor::{JobOutcome, JobProcessor, RetryPolicy};
pub use stats::{ConsumerStats, StatsSnapshot};
