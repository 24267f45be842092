//! Generic inbound webhook — POST /hooks/{source}.
//!
//! The payload becomes a synthetic message on the `webhook` channel and runs
//! through the same pipeline as any chat turn. The request is acknowledged
//! as soon as the message is queued; webhook callers don't wait on the model.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use courier_channels::InboundSink;
use courier_core::message::meta;
use courier_core::Message;

use crate::orchestrator::Orchestrator;

pub async fn hooks_handler(
    State(orch): State<Arc<Orchestrator>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let token = orch.config().await.gateway.hooks_token;
    if let Err(reason) = super::check_bearer(&headers, token.as_deref()) {
        warn!(source = %source, reason, "webhook authentication failed");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed"})),
        ));
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(source = %source, error = %e, "invalid JSON in webhook body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
    })?;

    info!(source = %source, bytes = body.len(), "webhook accepted");

    let message = Message::user("webhook", &source, &format!("[webhook:{source}] {payload}"))
        .with_meta(meta::USER_ID, format!("hook:{source}"));

    // Fire and forget — the reply (if any) is logged, not returned.
    tokio::spawn(async move {
        let reply = orch.deliver(message).await;
        info!(source = %source, reply_len = reply.len(), "webhook processed");
    });

    Ok(Json(json!({"ok": true})))
}
