//! SSE decoding for the provider's streaming message API.
//!
//! Event grammar: `message_start`, `content_block_start`,
//! `content_block_delta` (`text_delta` | `input_json_delta`),
//! `content_block_stop`, `message_delta`, `message_stop`.
//! `data: [DONE]` markers are ignored.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events emitted while decoding a streamed model turn.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    TextDelta { text: String },

    /// A complete tool_use block: input JSON fragments have been concatenated
    /// and parsed. Zero fragments normalize to `{}`.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Stream completed.
    Done {
        model: String,
        tokens_in: u64,
        tokens_out: u64,
        stop_reason: String,
    },

    /// Error during streaming.
    Error { message: String },
}

/// Parse a single SSE line.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Incremental SSE decoder. Feed complete lines; collect events.
///
/// Kept separate from the HTTP plumbing so the event grammar is testable
/// without a live byte stream.
#[derive(Default)]
pub struct SseAccumulator {
    current_event: String,
    current_block_type: String,
    tool_use_id: String,
    tool_use_name: String,
    tool_use_input_json: String,
    model: String,
    tokens_in: u64,
    tokens_out: u64,
    stop_reason: String,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one line; return an event when the line completes one.
    pub fn feed_line(&mut self, line: &str) -> Option<StreamEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match parse_sse_line(line)? {
            SseParsed::Event(ev) => {
                self.current_event = ev;
                None
            }
            SseParsed::Data(data) => {
                if data == "[DONE]" {
                    return None;
                }
                self.feed_data(&data)
            }
        }
    }

    /// Terminal event once the byte stream ends.
    pub fn finish(self) -> StreamEvent {
        StreamEvent::Done {
            model: self.model,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            stop_reason: self.stop_reason,
        }
    }

    fn feed_data(&mut self, data: &str) -> Option<StreamEvent> {
        match self.current_event.as_str() {
            "message_start" => {
                if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                    self.model = msg.message.model;
                    self.tokens_in = msg.message.usage.input_tokens;
                }
                None
            }

            "content_block_start" => {
                // Record block type so deltas know what they belong to.
                // For tool_use blocks, capture the call id and tool name.
                if let Ok(start) = serde_json::from_str::<ContentBlockStart>(data) {
                    self.current_block_type = start.content_block.block_type.clone();
                    if start.content_block.block_type == "tool_use" {
                        self.tool_use_id = start.content_block.id.unwrap_or_default();
                        self.tool_use_name = start.content_block.name.unwrap_or_default();
                        self.tool_use_input_json.clear();
                    }
                }
                None
            }

            "content_block_delta" => {
                if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                    match delta.delta.delta_type.as_str() {
                        "text_delta" => {
                            if let Some(text) = delta.delta.text {
                                return Some(StreamEvent::TextDelta { text });
                            }
                        }
                        "input_json_delta" => {
                            if let Some(partial) = delta.delta.partial_json {
                                self.tool_use_input_json.push_str(&partial);
                            }
                        }
                        other => {
                            debug!(delta_type = other, "unhandled delta type");
                        }
                    }
                }
                None
            }

            "content_block_stop" => {
                if self.current_block_type == "tool_use" {
                    // Empty input (zero delta fragments) normalizes to {}.
                    let input = serde_json::from_str::<serde_json::Value>(
                        self.tool_use_input_json.as_str(),
                    )
                    .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));

                    let event = StreamEvent::ToolUse {
                        id: std::mem::take(&mut self.tool_use_id),
                        name: std::mem::take(&mut self.tool_use_name),
                        input,
                    };
                    self.tool_use_input_json.clear();
                    self.current_block_type.clear();
                    return Some(event);
                }
                self.current_block_type.clear();
                None
            }

            "message_delta" => {
                if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                    self.tokens_out = delta.usage.output_tokens;
                    if let Some(reason) = delta.delta.stop_reason {
                        self.stop_reason = reason;
                    }
                }
                None
            }

            "error" => {
                warn!(data, "provider stream error");
                Some(StreamEvent::Error {
                    message: data.to_string(),
                })
            }

            // message_stop, ping, and unknown events — no action needed
            _ => None,
        }
    }
}

/// Decode a streaming HTTP response body and emit events into `tx`.
///
/// The line buffer grows as needed — tool-input JSON deltas can produce
/// single SSE lines beyond 1 MiB and must not be truncated.
pub async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut acc = SseAccumulator::new();
    let mut line_buf = String::with_capacity(8 * 1024);
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        // SSE arrives as arbitrary byte chunks; split on newlines and keep
        // the trailing incomplete line buffered for the next chunk.
        line_buf.push_str(text);
        loop {
            let Some(pos) = line_buf.find('\n') else {
                break;
            };
            let line: String = line_buf.drain(..=pos).collect();
            if let Some(event) = acc.feed_line(&line) {
                if tx.send(event).await.is_err() {
                    return; // receiver dropped
                }
            }
        }
    }

    if let Some(event) = acc.feed_line(&std::mem::take(&mut line_buf)) {
        let _ = tx.send(event).await;
    }
    let _ = tx.send(acc.finish()).await;
}

// Provider SSE data types (private — deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    model: String,
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u64,
}

#[derive(Deserialize)]
struct ContentBlockStart {
    content_block: ContentBlockMeta,
}

#[derive(Deserialize)]
struct ContentBlockMeta {
    #[serde(rename = "type")]
    block_type: String,
    /// Populated for `tool_use` blocks: the tool call id.
    id: Option<String>,
    /// Populated for `tool_use` blocks: the tool name.
    name: Option<String>,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    /// Populated for `text_delta` events.
    text: Option<String>,
    /// Populated for `input_json_delta` events (tool input streaming).
    partial_json: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct MessageDeltaInner {
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u64,
}
