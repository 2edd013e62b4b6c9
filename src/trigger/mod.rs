/// Webhook triggers
///
/// Lease renewal against external providers and extraction of run payloads
/// from inbound deliveries.

// Trigger, lease, delivery and report types
pub mod types;

// Pure delivery → payload extraction
pub mod extract;

// ArcSwap registry of active triggers and their leases
pub mod registry;

// Provider capability (HTTP backend)
pub mod provider;

// Renewal with backoff and health reporting
pub mod lease;

// Repeated renewal job
pub mod scheduler;

pub use lease::{LeaseSettings, RenewalSummary, TriggerLeaseManager};
pub use provider::{HttpWebhookProvider, WebhookProvider};
pub use registry::{TriggerEntry, TriggerRegistry};
pub use scheduler::RenewalScheduler;
pub use types::{LeaseStatus, RawDelivery, Renewal, RunPayload, TriggerLease, TriggerReport, WebhookTrigger};
