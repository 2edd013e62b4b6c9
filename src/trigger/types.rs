/// Webhook trigger definitions, leases and deliveries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// An externally registered webhook feeding one flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTrigger {
    pub flow_id: String,
    pub project_id: String,
    /// Flow version new runs are started against
    pub flow_version_id: String,
    /// Provider name, for logs ("gmail", "github", ...)
    pub provider: String,
    /// Endpoint the provider exposes for extending the subscription
    pub renew_url: String,
    /// JSONPath selecting the items to fan out, e.g. `$.events[*]`
    #[serde(default)]
    pub items_path: Option<String>,
    /// Body field present only on verification pings
    #[serde(default)]
    pub challenge_field: Option<String>,
    /// Header present only on verification pings
    #[serde(default)]
    pub verification_header: Option<String>,
}

/// One inbound webhook call, as received
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDelivery {
    pub flow_id: String,
    /// Lowercased header names
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

/// Payload for one flow run produced from a delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPayload {
    pub flow_id: String,
    pub flow_version_id: String,
    pub project_id: String,
    pub body: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseStatus {
    Active,
    /// Renewal has failed `max_consecutive_failures` times in a row
    Degraded,
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseStatus::Active => f.write_str("ACTIVE"),
            LeaseStatus::Degraded => f.write_str("DEGRADED"),
        }
    }
}

/// Current registration state of a webhook trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerLease {
    pub flow_id: String,
    pub subscription_id: String,
    pub expires_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub status: LeaseStatus,
}

impl TriggerLease {
    /// Expires within `window` of `now` (or already expired)
    pub fn expires_within(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + window
    }
}

/// What a provider returns for a successful renewal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Renewal {
    pub subscription_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Lease health events published on the reporting channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerReport {
    Renewed { flow_id: String, expires_at: DateTime<Utc> },
    /// Sent once when a lease crosses the failure threshold
    Degraded { flow_id: String, failures: u32, reason: String },
    /// Sent once when a degraded lease renews again
    Recovered { flow_id: String },
}
