use std::sync::Arc;

use async_trait::async_trait;

use courier_core::{DeltaSink, Message};

use crate::{error::ChannelError, types::ChannelStatus};

/// Inbound side of the gateway, implemented by the orchestrator and handed to
/// every adapter at `start`. Adapters never hold a concrete orchestrator
/// reference — only this trait object.
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// Process one inbound message to completion and return the reply text.
    ///
    /// `message.metadata.user_id` must identify the principal.
    async fn deliver(&self, message: Message) -> String;

    /// Streaming variant: `on_delta` receives each reply fragment as it is
    /// produced; the return value is still the full final reply.
    async fn deliver_streaming(&self, message: Message, on_delta: DeltaSink) -> String;
}

/// Common interface implemented by every channel adapter.
///
/// Implementations must be `Send + Sync` so they can be stored in the
/// orchestrator's registry and driven from multiple Tokio tasks. The core
/// assumes nothing about the transport (long-poll vs webhook); duplicate
/// delivery is the adapter's problem to solve by ID-keyed idempotence.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable lowercase identifier for this channel (e.g. `"telegram"`).
    fn name(&self) -> &str;

    /// Connect and begin delivering inbound messages into `sink`.
    async fn start(&self, sink: Arc<dyn InboundSink>) -> Result<(), ChannelError>;

    /// Stop receiving. In-flight replies may still be sent afterwards.
    async fn stop(&self);

    /// Deliver text to a recipient. Returns the platform message ID of the
    /// (last) sent message, usable with `edit_text`.
    async fn send_text(&self, recipient: &str, text: &str) -> Result<String, ChannelError>;

    /// Update a previously sent message (used to render streaming deltas by
    /// editing a placeholder).
    async fn edit_text(
        &self,
        recipient: &str,
        message_id: &str,
        text: &str,
    ) -> Result<(), ChannelError>;

    /// Current runtime status without blocking.
    fn status(&self) -> ChannelStatus;
}
