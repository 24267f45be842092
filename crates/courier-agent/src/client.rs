//! The agentic loop and the three client operations.
//!
//! Flow: messages → model → if tool_use → execute tools → inject results →
//! model → repeat. Stops when the model declines further tools, or the
//! iteration cap is reached.

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::{DeltaSink, Message};

use crate::error::AgentError;
use crate::provider::{Block, Turn, TurnProvider, TurnRequest};
use crate::tools::{ToolRegistry, DEFAULT_TOOL_TIMEOUT};

/// Default agentic-loop iteration cap.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Aggregated result of one client operation (possibly many model turns).
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub text: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub stop_reason: String,
}

/// Knobs for `chat_with_tools`.
#[derive(Debug, Clone)]
pub struct ToolLoopOptions {
    pub max_iterations: usize,
    pub tool_timeout: Duration,
    /// Per-call model override (e.g. a session's model setting).
    pub model_override: Option<String>,
}

impl Default for ToolLoopOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            model_override: None,
        }
    }
}

/// LLM provider adapter: one-shot, streaming, and streaming-with-tools.
///
/// Holds the transport behind `dyn TurnProvider` so the orchestrator can swap
/// providers (hot reload, failover) without touching callers.
pub struct AgentClient {
    provider: Box<dyn TurnProvider>,
    model: String,
    max_tokens: u32,
}

impl AgentClient {
    pub fn new(provider: Box<dyn TurnProvider>, model: String, max_tokens: u32) -> Self {
        Self {
            provider,
            model,
            max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// One-shot completion, no tools, no delta callback.
    pub async fn chat(
        &self,
        messages: &[Message],
        model_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        let req = self.build_request(messages, None, model_override, Vec::new())?;
        let turn = self.provider.run_turn(&req, None, cancel).await?;
        Ok(response_from(turn))
    }

    /// Streaming completion: `on_delta` sees each text fragment, the return
    /// value aggregates the full text and usage.
    pub async fn chat_stream(
        &self,
        messages: &[Message],
        system: Option<&str>,
        model_override: Option<&str>,
        on_delta: &DeltaSink,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        let req = self.build_request(messages, system, model_override, Vec::new())?;
        let turn = self.provider.run_turn(&req, Some(on_delta), cancel).await?;
        Ok(response_from(turn))
    }

    /// The agentic loop. Text deltas of every iteration stream to `on_delta`;
    /// tool executor failures become `"Error: …"` tool results and the loop
    /// continues. On iteration exhaustion, whatever text accumulated so far
    /// is returned.
    pub async fn chat_with_tools(
        &self,
        messages: &[Message],
        system: Option<&str>,
        registry: &ToolRegistry,
        opts: &ToolLoopOptions,
        on_delta: Option<&DeltaSink>,
        cancel: &CancellationToken,
    ) -> Result<AgentResponse, AgentError> {
        let mut req = self.build_request(
            messages,
            system,
            opts.model_override.as_deref(),
            registry.wire_definitions(),
        )?;

        let mut total_in: u64 = 0;
        let mut total_out: u64 = 0;
        let mut last_turn: Option<Turn> = None;

        for iteration in 0..opts.max_iterations {
            debug!(iteration, "tool loop iteration");
            let turn = self.provider.run_turn(&req, on_delta, cancel).await?;
            total_in += turn.tokens_in;
            total_out += turn.tokens_out;

            let calls: Vec<_> = turn.tool_calls().into_iter().cloned().collect();
            if turn.stop_reason != "tool_use" || calls.is_empty() {
                info!(iteration, "tool loop complete — no more tool calls");
                let mut resp = response_from(turn);
                resp.input_tokens = total_in;
                resp.output_tokens = total_out;
                return Ok(resp);
            }

            // Echo the assistant turn verbatim: every observed block, in order.
            req.messages.push(json!({
                "role": "assistant",
                "content": blocks_to_wire(&turn.blocks),
            }));

            // Execute each call sequentially, in block order. One tool_result
            // per tool_use, each referencing the originating id.
            let mut results: Vec<Value> = Vec::with_capacity(calls.len());
            for call in &calls {
                let outcome = registry
                    .execute(
                        &call.name,
                        call.input.clone(),
                        cancel.child_token(),
                        opts.tool_timeout,
                    )
                    .await;
                let (content, is_error) = match outcome {
                    Ok(text) => (text, false),
                    Err(e) => {
                        warn!(tool = %call.name, error = %e, "tool execution failed");
                        (format!("Error: {e}"), true)
                    }
                };
                results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": call.id,
                    "content": content,
                    "is_error": is_error,
                }));
            }
            req.messages.push(json!({
                "role": "user",
                "content": results,
            }));

            last_turn = Some(turn);
        }

        warn!(
            max_iterations = opts.max_iterations,
            "tool loop hit maximum iterations"
        );

        let mut resp = match last_turn {
            Some(turn) => response_from(turn),
            None => {
                return Err(AgentError::Parse(
                    "tool loop ran zero iterations".to_string(),
                ))
            }
        };
        resp.input_tokens = total_in;
        resp.output_tokens = total_out;
        Ok(resp)
    }

    fn build_request(
        &self,
        messages: &[Message],
        system: Option<&str>,
        model_override: Option<&str>,
        tools: Vec<Value>,
    ) -> Result<TurnRequest, AgentError> {
        if messages.is_empty() {
            return Err(AgentError::EmptyConversation);
        }
        Ok(TurnRequest {
            model: model_override.unwrap_or(&self.model).to_string(),
            system: system.map(String::from),
            messages: build_wire_messages(messages),
            tools,
            max_tokens: self.max_tokens,
        })
    }
}

fn response_from(turn: Turn) -> AgentResponse {
    AgentResponse {
        text: turn.text,
        model: turn.model,
        input_tokens: turn.tokens_in,
        output_tokens: turn.tokens_out,
        stop_reason: turn.stop_reason,
    }
}

/// Convert core messages to provider wire shape.
///
/// A message carrying `metadata.image` becomes a two-part content array
/// (image, then text); everything else is a plain string. One code path
/// handles both.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = if m.is_bot { "assistant" } else { "user" };
            let content = match m.image() {
                Some(img) => json!([
                    {
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": img.media_type,
                            "data": img.data,
                        },
                    },
                    {"type": "text", "text": m.text},
                ]),
                None => Value::String(m.text.clone()),
            };
            json!({"role": role, "content": content})
        })
        .collect()
}

fn blocks_to_wire(blocks: &[Block]) -> Vec<Value> {
    blocks
        .iter()
        .map(|b| match b {
            Block::Text { text } => json!({"type": "text", "text": text}),
            Block::ToolUse(call) => json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.input,
            }),
        })
        .collect()
}
