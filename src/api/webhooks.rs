/// Webhook ingress endpoints
///
/// Provider deliveries arrive at `/webhook/{flow_id}`. The flow's trigger
/// definition turns each delivery into zero or more run payloads, and every
/// payload is enqueued as the first job of a fresh flow run.

use crate::api::AppState;
use crate::error::WorkerError;
use crate::job::NewJob;
use crate::trigger::{extract, RawDelivery};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{any, Router},
};
use serde_json::{json, Value};
use std::collections::HashMap;

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new().route("/webhook/{flow_id}", any(ingest_webhook))
}

/// Build a delivery from the raw request parts
///
/// Header names are lowercased; an empty body becomes `null`.
pub fn delivery_from(
    flow_id: &str,
    headers: &HeaderMap,
    query: HashMap<String, String>,
    body: &str,
) -> Result<RawDelivery, serde_json::Error> {
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let body = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(body)?
    };

    Ok(RawDelivery {
        flow_id: flow_id.to_string(),
        headers,
        query,
        body,
    })
}

/// ANY /webhook/{flow_id}
///
/// 202 with the created job ids, 200 echoing the challenge for verification
/// pings, 400 for a non-JSON body, 404 for a flow without a trigger.
pub async fn ingest_webhook(
    State(state): State<AppState>,
    Path(flow_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    tracing::info!("📥 Webhook delivery received for flow: {}", flow_id);

    let delivery = delivery_from(&flow_id, &headers, query, &body).map_err(|e| {
        tracing::warn!("❌ Invalid JSON payload for flow {}: {}", flow_id, e);
        StatusCode::BAD_REQUEST
    })?;

    let trigger = state.triggers.registry().trigger(&flow_id).ok_or_else(|| {
        tracing::warn!("❌ Webhook called for flow without a trigger: {}", flow_id);
        StatusCode::NOT_FOUND
    })?;

    if extract::is_verification(&trigger, &delivery) {
        let challenge = trigger
            .challenge_field
            .as_deref()
            .and_then(|field| delivery.body.get(field).cloned())
            .unwrap_or(Value::Null);
        tracing::info!("🤝 Answered verification ping for flow {}", flow_id);
        return Ok((StatusCode::OK, Json(json!({ "challenge": challenge }))));
    }

    let payloads = state.triggers.extract_payloads(&delivery).map_err(|e| match e {
        WorkerError::UnknownTrigger(_) => StatusCode::NOT_FOUND,
        other => {
            tracing::error!("❌ Could not extract payloads for flow {}: {}", flow_id, other);
            StatusCode::UNPROCESSABLE_ENTITY
        }
    })?;

    let mut job_ids = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let job = NewJob::fresh_run(&payload.project_id, &payload.flow_version_id, payload.body);
        match state.queue.enqueue(job).await {
            Ok(job) => job_ids.push(job.id),
            Err(e) => {
                tracing::error!("💥 Failed to enqueue run for flow {}: {}", flow_id, e);
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
        }
    }

    tracing::info!("🚀 Queued {} run(s) for flow {}", job_ids.len(), flow_id);
    Ok((StatusCode::ACCEPTED, Json(json!({ "flow_id": flow_id, "job_ids": job_ids }))))
}
