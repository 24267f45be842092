pub mod anthropic;
pub mod client;
pub mod compact;
pub mod error;
pub mod failover;
pub mod provider;
pub mod sse;
pub mod subagent;
pub mod tools;

pub use anthropic::{is_oauth_token, AnthropicProvider};
pub use client::{AgentClient, AgentResponse, ToolLoopOptions};
pub use compact::{estimate_tokens, Compactor, LlmSummarizer, Summarizer};
pub use error::AgentError;
pub use failover::FailoverProvider;
pub use provider::{Block, ToolInvocation, Turn, TurnProvider, TurnRequest};
pub use subagent::{SubAgentManager, SubAgentRunner};
pub use tools::{ToolError, ToolParam, ToolRegistry, ToolSpec};
