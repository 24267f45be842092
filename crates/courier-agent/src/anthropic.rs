use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use courier_core::DeltaSink;

use crate::error::AgentError;
use crate::provider::{Block, ToolInvocation, Turn, TurnProvider, TurnRequest};
use crate::sse::{process_stream, StreamEvent};

const API_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";

/// True when the credential is a subscription OAuth access token rather than
/// a plain API key. Anything else falls back to API-key auth.
pub fn is_oauth_token(token: &str) -> bool {
    token.starts_with(OAUTH_TOKEN_PREFIX)
}

/// Anthropic Messages API transport. Always streams; the non-streaming
/// operations simply discard deltas.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    is_oauth: bool,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        let is_oauth = is_oauth_token(&api_key);
        Self {
            client: reqwest::Client::new(),
            is_oauth,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    /// Apply auth headers — OAuth tokens use Bearer + beta header,
    /// regular API keys use x-api-key.
    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.is_oauth {
            builder
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("anthropic-beta", OAUTH_BETA)
        } else {
            builder.header("x-api-key", &self.api_key)
        }
    }
}

#[async_trait]
impl TurnProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn run_turn(
        &self,
        req: &TurnRequest,
        on_delta: Option<&DeltaSink>,
        cancel: &CancellationToken,
    ) -> Result<Turn, AgentError> {
        let body = build_request_body(req);
        let url = format!("{}/v1/messages", self.base_url);

        debug!(model = %req.model, tools = req.tools.len(), "sending streaming request");

        let builder = self
            .client
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body);

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            resp = self.apply_auth(builder).send() => resp?,
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "provider API error");
            return Err(AgentError::Api {
                status,
                message: text,
            });
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(process_stream(resp, tx));
        collect_turn(rx, on_delta, cancel).await
    }
}

/// Drain stream events into a completed `Turn`, forwarding text deltas.
async fn collect_turn(
    mut rx: mpsc::Receiver<StreamEvent>,
    on_delta: Option<&DeltaSink>,
    cancel: &CancellationToken,
) -> Result<Turn, AgentError> {
    let mut full_text = String::new();
    let mut pending_text = String::new();
    let mut blocks: Vec<Block> = Vec::new();
    let mut done: Option<(String, u64, u64, String)> = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Err(AgentError::Cancelled),
            event = rx.recv() => event,
        };
        match event {
            None => break,
            Some(StreamEvent::TextDelta { text }) => {
                if let Some(sink) = on_delta {
                    sink(text.clone());
                }
                full_text.push_str(&text);
                pending_text.push_str(&text);
            }
            Some(StreamEvent::ToolUse { id, name, input }) => {
                if !pending_text.is_empty() {
                    blocks.push(Block::Text {
                        text: std::mem::take(&mut pending_text),
                    });
                }
                blocks.push(Block::ToolUse(ToolInvocation { id, name, input }));
            }
            Some(StreamEvent::Done {
                model,
                tokens_in,
                tokens_out,
                stop_reason,
            }) => {
                done = Some((model, tokens_in, tokens_out, stop_reason));
            }
            Some(StreamEvent::Error { message }) => {
                return Err(AgentError::Stream(message));
            }
        }
    }

    if !pending_text.is_empty() {
        blocks.push(Block::Text { text: pending_text });
    }

    let (model, tokens_in, tokens_out, stop_reason) =
        done.ok_or_else(|| AgentError::Stream("stream ended without completion".to_string()))?;

    Ok(Turn {
        text: full_text,
        blocks,
        stop_reason,
        model,
        tokens_in,
        tokens_out,
    })
}

fn build_request_body(req: &TurnRequest) -> Value {
    let mut body = json!({
        "model": req.model,
        "max_tokens": req.max_tokens,
        "messages": req.messages,
        "stream": true,
    });
    if let Some(ref system) = req.system {
        body["system"] = Value::String(system.clone());
    }
    if !req.tools.is_empty() {
        body["tools"] = Value::Array(req.tools.clone());
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_detection() {
        assert!(is_oauth_token("sk-ant-oat01-abcdef"));
        assert!(!is_oauth_token("sk-ant-api03-abcdef"));
        assert!(!is_oauth_token(""));
    }

    #[test]
    fn request_body_shape() {
        let req = TurnRequest {
            model: "claude-sonnet-4-6".to_string(),
            system: Some("be terse".to_string()),
            messages: vec![json!({"role": "user", "content": "hi"})],
            tools: vec![json!({"name": "t", "description": "d", "input_schema": {}})],
            max_tokens: 1024,
        };
        let body = build_request_body(&req);
        assert_eq!(body["model"], "claude-sonnet-4-6");
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn request_body_omits_empty_sections() {
        let req = TurnRequest {
            model: "m".to_string(),
            system: None,
            messages: vec![],
            tools: vec![],
            max_tokens: 16,
        };
        let body = build_request_body(&req);
        assert!(body.get("system").is_none());
        assert!(body.get("tools").is_none());
    }

    #[tokio::test]
    async fn collect_turn_orders_blocks() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::TextDelta {
            text: "Let me check.".to_string(),
        })
        .await
        .unwrap();
        tx.send(StreamEvent::ToolUse {
            id: "tool_1".to_string(),
            name: "get_weather".to_string(),
            input: json!({"location": "London"}),
        })
        .await
        .unwrap();
        tx.send(StreamEvent::Done {
            model: "m".to_string(),
            tokens_in: 10,
            tokens_out: 4,
            stop_reason: "tool_use".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        let turn = collect_turn(rx, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(turn.text, "Let me check.");
        assert_eq!(turn.blocks.len(), 2);
        assert!(matches!(turn.blocks[0], Block::Text { .. }));
        assert!(matches!(turn.blocks[1], Block::ToolUse(_)));
        assert_eq!(turn.stop_reason, "tool_use");
    }

    #[tokio::test]
    async fn collect_turn_without_done_is_an_error() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(StreamEvent::TextDelta {
            text: "partial".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        let err = collect_turn(rx, None, &CancellationToken::new())
            .await
            .expect_err("truncated stream must error");
        assert!(matches!(err, AgentError::Stream(_)));
    }

    #[tokio::test]
    async fn collect_turn_forwards_deltas() {
        use std::sync::{Arc, Mutex};

        let (tx, rx) = mpsc::channel(8);
        for part in ["Hel", "lo"] {
            tx.send(StreamEvent::TextDelta {
                text: part.to_string(),
            })
            .await
            .unwrap();
        }
        tx.send(StreamEvent::Done {
            model: "m".to_string(),
            tokens_in: 1,
            tokens_out: 1,
            stop_reason: "end_turn".to_string(),
        })
        .await
        .unwrap();
        drop(tx);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let sink: DeltaSink = Arc::new(move |d| seen2.lock().unwrap().push(d));

        let turn = collect_turn(rx, Some(&sink), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(turn.text, "Hello");
        assert_eq!(*seen.lock().unwrap(), vec!["Hel", "lo"]);
    }
}
