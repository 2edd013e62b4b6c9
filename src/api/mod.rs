/// HTTP API Layer
///
/// The worker exposes a small surface next to its consumer loop:
/// - Liveness and readiness probes
/// - Webhook ingress that turns provider deliveries into queued flow runs

use crate::consumer::ConsumerManager;
use crate::job::JobQueue;
use crate::trigger::TriggerLeaseManager;
use axum::Router;
use std::sync::Arc;

// Liveness / readiness endpoints
pub mod health;

// Webhook ingress endpoints
pub mod webhooks;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub consumer: Arc<dyn ConsumerManager>,
    pub triggers: Arc<TriggerLeaseManager>,
    pub queue: Arc<dyn JobQueue>,
}

/// Build the complete router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_routes())
        .merge(webhooks::create_webhook_routes())
        .with_state(state)
}

pub use health::create_health_routes;
pub use webhooks::create_webhook_routes;
