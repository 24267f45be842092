use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::orchestrator::Orchestrator;

/// GET /health — liveness probe. Returns 503 while the agent is not
/// configured; the body is identical either way so dashboards can render it.
pub async fn health_handler(
    State(orch): State<Arc<Orchestrator>>,
) -> (StatusCode, Json<Value>) {
    let agent = orch.agent().await;
    let uptime = orch.uptime();

    let channels: Value = orch
        .channel_statuses()
        .await
        .into_iter()
        .map(|(name, status)| (name, json!(status)))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    let mut body = json!({
        "ok": agent.is_some(),
        "uptime": format_uptime(uptime.as_secs()),
        "uptime_seconds": uptime.as_secs(),
        "sessions_count": orch.store().count(),
        "tools_registered": orch.registry().len(),
        "channels": channels,
    });
    if let Some(agent) = &agent {
        body["agent"] = json!({
            "provider": agent.provider_name(),
            "model": agent.model(),
        });
    }
    if let Some(at) = orch.last_message_at() {
        body["last_message_at"] = json!(at.to_rfc3339());
    }

    let status = if agent.is_some() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

fn format_uptime(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
