/// Liveness and readiness probes

use crate::api::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, Router},
};

pub fn create_health_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness))
}

/// Process is up; says nothing about its dependencies
async fn health_check() -> &'static str {
    "ok"
}

/// 200 with consumer stats once init() succeeded, 503 before and after close()
async fn readiness(State(state): State<AppState>) -> Response {
    let stats = state.consumer.stats();
    if state.consumer.is_ready() {
        (StatusCode::OK, Json(stats)).into_response()
    } else {
        tracing::debug!("🚧 Readiness probe while consumer is not ready");
        (StatusCode::SERVICE_UNAVAILABLE, Json(stats)).into_response()
    }
}
