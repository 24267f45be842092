//! Streamed reply rendering: deltas accumulate into a shared buffer and a
//! background task edits the placeholder message at most every 500 ms.
//!
//! Telegram rejects an edit whose content matches the current text, so the
//! ticker only edits when new deltas arrived since the last pass.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::MessageId;
use tracing::debug;

use courier_core::DeltaSink;

use crate::send::{self, CHUNK_MAX};

const EDIT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Default)]
struct RenderState {
    buffer: String,
    dirty: bool,
}

/// Renders one in-progress reply by editing a placeholder message.
pub struct StreamRenderer {
    bot: Bot,
    chat_id: ChatId,
    message_id: MessageId,
    state: Arc<Mutex<RenderState>>,
    ticker: tokio::task::JoinHandle<()>,
}

impl StreamRenderer {
    /// Send the "thinking…" placeholder and start the edit ticker.
    pub async fn begin(bot: Bot, chat_id: ChatId) -> Result<Self, teloxide::RequestError> {
        let placeholder = bot.send_message(chat_id, "…").await?;
        let state = Arc::new(Mutex::new(RenderState::default()));
        let ticker = tokio::spawn(edit_loop(
            bot.clone(),
            chat_id,
            placeholder.id,
            Arc::clone(&state),
        ));
        Ok(Self {
            bot,
            chat_id,
            message_id: placeholder.id,
            state,
            ticker,
        })
    }

    /// The delta callback handed to the orchestrator.
    pub fn sink(&self) -> DeltaSink {
        let state = Arc::clone(&self.state);
        Arc::new(move |delta: String| {
            let mut s = state.lock().unwrap();
            s.buffer.push_str(&delta);
            s.dirty = true;
        })
    }

    /// Stop the ticker and render the final reply. The placeholder becomes
    /// the first chunk; any overflow goes out as fresh messages.
    pub async fn finish(self, final_text: &str) {
        self.ticker.abort();

        let text = if final_text.is_empty() {
            "(no reply)"
        } else {
            final_text
        };
        let chunks = send::split_chunks(text);
        if let Err(e) = self
            .bot
            .edit_message_text(self.chat_id, self.message_id, &chunks[0])
            .await
        {
            debug!(error = %e, "final edit failed, sending as new message");
            let _ = send::send_chunked(&self.bot, self.chat_id, text).await;
            return;
        }
        if chunks.len() > 1 {
            let rest = chunks[1..].join("\n");
            let _ = send::send_chunked(&self.bot, self.chat_id, &rest).await;
        }
    }
}

async fn edit_loop(bot: Bot, chat_id: ChatId, message_id: MessageId, state: Arc<Mutex<RenderState>>) {
    let mut interval = tokio::time::interval(EDIT_INTERVAL);
    loop {
        interval.tick().await;
        let snapshot = {
            let mut s = state.lock().unwrap();
            if !s.dirty || s.buffer.is_empty() {
                continue;
            }
            s.dirty = false;
            s.buffer.clone()
        };
        // Keep the in-progress view inside one message; the final render
        // spills overflow into follow-up messages.
        let view: String = if snapshot.len() > CHUNK_MAX {
            let mut cut = CHUNK_MAX;
            while cut > 0 && !snapshot.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}…", &snapshot[..cut])
        } else {
            snapshot
        };
        if let Err(e) = bot.edit_message_text(chat_id, message_id, view).await {
            debug!(error = %e, "streaming edit failed");
        }
    }
}
