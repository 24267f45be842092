//! Context compaction — bounds the token cost of every agent call by
//! replacing the leading span of a conversation with a single summary
//! message, preserving the tail verbatim.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use courier_core::message::meta;
use courier_core::Message;

use crate::client::AgentClient;
use crate::error::AgentError;

/// Rough token estimate: ~4 characters per token.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(|m| m.text.len().div_ceil(4)).sum()
}

/// Produces a plain-text summary of a conversation head.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, head: &[Message]) -> Result<String, AgentError>;
}

/// Replaces a conversation head with a summary once the token budget is
/// exceeded. Idempotent: a compacted history fits the budget, so a repeat
/// call returns it unchanged.
pub struct Compactor {
    threshold_tokens: usize,
    keep_last_n: usize,
    summarizer: Arc<dyn Summarizer>,
}

impl Compactor {
    pub fn new(threshold_tokens: usize, keep_last_n: usize, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            threshold_tokens,
            keep_last_n,
            summarizer,
        }
    }

    pub fn threshold_tokens(&self) -> usize {
        self.threshold_tokens
    }

    /// Returns the input unchanged when under budget or when there is
    /// nothing to summarize; otherwise `[summary] ++ tail`. Summarizer
    /// failures propagate — the caller decides whether to fall back to the
    /// uncompacted history.
    pub async fn compact_if_needed(
        &self,
        messages: &[Message],
    ) -> Result<Vec<Message>, AgentError> {
        if messages.len() <= self.keep_last_n {
            return Ok(messages.to_vec());
        }
        if estimate_tokens(messages) <= self.threshold_tokens {
            return Ok(messages.to_vec());
        }

        let split = messages.len() - self.keep_last_n;
        let (head, tail) = messages.split_at(split);

        let summary_text = self.summarizer.summarize(head).await?;
        let summary = Message::assistant(&messages[0].channel, &summary_text)
            .with_meta(meta::TYPE, meta::TYPE_SUMMARY);

        let mut out = Vec::with_capacity(1 + tail.len());
        out.push(summary);
        out.extend_from_slice(tail);
        Ok(out)
    }
}

const SUMMARY_INSTRUCTION: &str = "Summarize the conversation below into a compact brief that a \
future assistant turn can rely on. Preserve stated facts, names, decisions, preferences, and \
open tasks. Reply with the summary text only.";

/// Summarizer backed by a one-shot model call.
pub struct LlmSummarizer {
    client: Arc<AgentClient>,
}

impl LlmSummarizer {
    pub fn new(client: Arc<AgentClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, head: &[Message]) -> Result<String, AgentError> {
        let transcript: String = head
            .iter()
            .map(|m| {
                format!(
                    "{}: {}",
                    if m.is_bot { "ASSISTANT" } else { "USER" },
                    m.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = Message::user(
            "compactor",
            "compactor",
            &format!("{SUMMARY_INSTRUCTION}\n\n{transcript}"),
        );
        let resp = self
            .client
            .chat(&[prompt], None, &CancellationToken::new())
            .await?;
        Ok(resp.text)
    }
}
