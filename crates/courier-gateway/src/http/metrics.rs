//! GET /metrics — Prometheus text exposition, gated by the same bearer
//! token as the hooks endpoint.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};

use crate::orchestrator::Orchestrator;

pub async fn metrics_handler(
    State(orch): State<Arc<Orchestrator>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = orch.config().await.gateway.hooks_token;
    if super::check_bearer(&headers, token.as_deref()).is_err() {
        return (StatusCode::UNAUTHORIZED, HeaderMap::new(), String::new());
    }

    let body = render(&orch).await;
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    (StatusCode::OK, response_headers, body)
}

async fn render(orch: &Orchestrator) -> String {
    let mut out = String::with_capacity(512);
    gauge(
        &mut out,
        "courier_in_flight_requests",
        "Requests currently inside the pipeline.",
        orch.in_flight() as f64,
    );
    counter(
        &mut out,
        "courier_processed_total",
        "Turns completed successfully.",
        orch.processed_total() as f64,
    );
    counter(
        &mut out,
        "courier_rejected_total",
        "Messages refused by admission control.",
        orch.rejected_total() as f64,
    );
    gauge(
        &mut out,
        "courier_sessions",
        "Live sessions in the store.",
        orch.store().count() as f64,
    );
    gauge(
        &mut out,
        "courier_subagents_active",
        "Sub-agents currently pending or running.",
        orch.subagents().active_count() as f64,
    );
    gauge(
        &mut out,
        "courier_uptime_seconds",
        "Seconds since the gateway started.",
        orch.uptime().as_secs_f64(),
    );
    out
}

fn gauge(out: &mut String, name: &str, help: &str, value: f64) {
    emit(out, name, "gauge", help, value);
}

fn counter(out: &mut String, name: &str, help: &str, value: f64) {
    emit(out, name, "counter", help, value);
}

fn emit(out: &mut String, name: &str, kind: &str, help: &str, value: f64) {
    out.push_str(&format!(
        "# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n"
    ));
}
