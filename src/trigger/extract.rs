/// Delivery → run payload extraction
///
/// Pure function of (trigger definition, delivery): no clock, no I/O, so the
/// same delivery always yields the same payloads.

use crate::error::{Result, WorkerError};
use crate::trigger::types::{RawDelivery, RunPayload, WebhookTrigger};
use serde_json::Value;

/// True when the delivery is a provider verification ping, not an event
pub fn is_verification(trigger: &WebhookTrigger, delivery: &RawDelivery) -> bool {
    let challenge = trigger
        .challenge_field
        .as_deref()
        .map(|field| delivery.body.get(field).is_some())
        .unwrap_or(false);

    let header = trigger
        .verification_header
        .as_deref()
        .map(|name| delivery.headers.contains_key(&name.to_ascii_lowercase()))
        .unwrap_or(false);

    challenge || header
}

/// Turn one delivery into zero or more run payloads
///
/// With an `items_path` every JSONPath match becomes one payload (a match
/// that is itself an array contributes each element); otherwise the whole
/// body is a single payload.
pub fn extract(trigger: &WebhookTrigger, delivery: &RawDelivery) -> Result<Vec<RunPayload>> {
    if is_verification(trigger, delivery) {
        tracing::debug!("🤝 Verification ping for flow '{}', no runs", trigger.flow_id);
        return Ok(Vec::new());
    }

    let items: Vec<Value> = match trigger.items_path.as_deref() {
        Some(path) => {
            let matches = jsonpath_lib::select(&delivery.body, path).map_err(|e| {
                WorkerError::InvalidFlow(format!(
                    "trigger of flow '{}' has invalid items_path '{}': {:?}",
                    trigger.flow_id, path, e
                ))
            })?;
            matches
                .into_iter()
                .flat_map(|item| match item {
                    Value::Array(elements) => elements.clone(),
                    other => vec![other.clone()],
                })
                .collect()
        }
        None => vec![delivery.body.clone()],
    };

    Ok(items
        .into_iter()
        .map(|body| RunPayload {
            flow_id: trigger.flow_id.clone(),
            flow_version_id: trigger.flow_version_id.clone(),
            project_id: trigger.project_id.clone(),
            body,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn trigger(items_path: Option<&str>) -> WebhookTrigger {
        WebhookTrigger {
            flow_id: "flow-1".into(),
            project_id: "acme".into(),
            flow_version_id: "fv-1".into(),
            provider: "github".into(),
            renew_url: "http://localhost/renew".into(),
            items_path: items_path.map(String::from),
            challenge_field: Some("challenge".into()),
            verification_header: Some("X-Hook-Verify".into()),
        }
    }

    fn delivery(body: Value) -> RawDelivery {
        RawDelivery {
            flow_id: "flow-1".into(),
            headers: HashMap::new(),
            query: HashMap::new(),
            body,
        }
    }

    #[test]
    fn whole_body_without_items_path() {
        let payloads = extract(&trigger(None), &delivery(json!({ "a": 1 }))).unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].body, json!({ "a": 1 }));
        assert_eq!(payloads[0].flow_version_id, "fv-1");
    }

    #[test]
    fn fans_out_over_items_path() {
        let body = json!({ "events": [{ "id": 1 }, { "id": 2 }, { "id": 3 }] });
        let payloads = extract(&trigger(Some("$.events[*]")), &delivery(body.clone())).unwrap();
        assert_eq!(payloads.iter().map(|p| p.body["id"].clone()).collect::<Vec<_>>(), vec![json!(1), json!(2), json!(3)]);

        // An array match is flattened
        let flattened = extract(&trigger(Some("$.events")), &delivery(body)).unwrap();
        assert_eq!(flattened.len(), 3);
    }

    #[test]
    fn verification_pings_yield_nothing() {
        let ping = delivery(json!({ "challenge": "abc" }));
        assert!(extract(&trigger(None), &ping).unwrap().is_empty());

        let mut header_ping = delivery(json!({ "a": 1 }));
        header_ping.headers.insert("x-hook-verify".into(), "1".into());
        assert!(extract(&trigger(None), &header_ping).unwrap().is_empty());
    }

    #[test]
    fn is_deterministic() {
        let body = json!({ "events": [{ "id": 1 }, { "id": 2 }] });
        let first = extract(&trigger(Some("$.events[*]")), &delivery(body.clone())).unwrap();
        let second = extract(&trigger(Some("$.events[*]")), &delivery(body)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_path_is_an_error() {
        assert!(extract(&trigger(Some("$[")), &delivery(json!({}))).is_err());
    }
}
