use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use courier_core::DeltaSink;

use crate::error::AgentError;

/// One request to the model: wire-format messages plus the declared tools.
///
/// `messages` are provider-shape JSON values rather than `courier_core::Message`
/// because the agentic loop appends structured content (tool_use echoes,
/// tool_result blocks) that a plain text message cannot represent.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<Value>,
    /// Provider-shape tool definitions. Empty → no tools declared.
    pub tools: Vec<Value>,
    pub max_tokens: u32,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A content block observed in the model's reply, in stream order.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Text { text: String },
    ToolUse(ToolInvocation),
}

/// The model's complete output for a single turn.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Concatenation of all text blocks.
    pub text: String,
    /// Ordered blocks — echoed back verbatim when the loop continues.
    pub blocks: Vec<Block>,
    pub stop_reason: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl Turn {
    pub fn tool_calls(&self) -> Vec<&ToolInvocation> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                Block::ToolUse(call) => Some(call),
                Block::Text { .. } => None,
            })
            .collect()
    }
}

/// Low-level LLM transport: runs exactly one streamed model turn.
///
/// Implementations are stateless per call; the shared HTTP client inside is
/// safe for concurrent use. `on_delta`, when present, receives each text
/// fragment as it arrives. The cancellation token descends from the
/// orchestrator root; implementations must return promptly once it fires.
#[async_trait]
pub trait TurnProvider: Send + Sync {
    /// Provider name for logging and health reporting.
    fn name(&self) -> &str;

    async fn run_turn(
        &self,
        req: &TurnRequest,
        on_delta: Option<&DeltaSink>,
        cancel: &CancellationToken,
    ) -> Result<Turn, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_calls_filters_blocks() {
        let turn = Turn {
            text: "checking".to_string(),
            blocks: vec![
                Block::Text {
                    text: "checking".to_string(),
                },
                Block::ToolUse(ToolInvocation {
                    id: "tool_1".to_string(),
                    name: "get_weather".to_string(),
                    input: json!({"location": "London"}),
                }),
            ],
            stop_reason: "tool_use".to_string(),
            model: "m".to_string(),
            tokens_in: 1,
            tokens_out: 2,
        };
        let calls = turn.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
    }
}
