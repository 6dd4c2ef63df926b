use chrono::Utc;
use serde_json::{json, Value};

use crate::app::AppState;

/// Best-effort push delivery after a reply has been stored. Failures are
/// logged and swallowed; the polling path stays authoritative.
pub async fn dispatch(state: &AppState, domain: &str, session_id: &str, text: &str) {
    let entry = match state.subscriptions.lookup(domain, session_id).await {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            tracing::debug!(%domain, %session_id, "no push subscription registered");
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, %domain, %session_id, "push subscription lookup failed");
            return;
        }
    };

    let Some(endpoint) = entry.subscription.get("endpoint").and_then(Value::as_str) else {
        tracing::warn!(%domain, %session_id, "push subscription has no endpoint");
        return;
    };

    let payload = json!({
        "text": text,
        "timestamp": Utc::now().timestamp_millis(),
    });

    let result = state
        .http
        .post(endpoint)
        .header("TTL", "86400")
        .json(&payload)
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(%domain, %session_id, "push notification sent");
        }
        Ok(response) => {
            tracing::warn!(status = %response.status(), %domain, %session_id, "push endpoint rejected notification");
        }
        Err(err) => {
            tracing::warn!(error = %err, %domain, %session_id, "push notification dispatch failed");
        }
    }
}
