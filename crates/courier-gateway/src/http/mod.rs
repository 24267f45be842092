pub mod health;
pub mod hooks;
pub mod metrics;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::orchestrator::Orchestrator;

/// Assemble the gateway's HTTP surface.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/hooks/{source}", post(hooks::hooks_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(orchestrator)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Verify a static bearer token in the `Authorization` header. `None`
/// expected token means the route is open.
pub(crate) fn check_bearer(
    headers: &axum::http::HeaderMap,
    expected: Option<&str>,
) -> Result<(), &'static str> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or("missing or malformed Authorization header")?;
    if token == expected {
        Ok(())
    } else {
        Err("bearer token mismatch")
    }
}
