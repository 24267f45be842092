//! Chunked message delivery. Telegram caps messages at 4096 characters; we
//! split at 4000 on line boundaries, force-splitting any single oversize line.

use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::MessageId;
use tracing::warn;

use courier_channels::ChannelError;

/// Safe maximum characters per outbound message.
pub const CHUNK_MAX: usize = 4000;

/// Split `text` into chunks of at most [`CHUNK_MAX`] characters, preferring
/// line boundaries, then spaces, then a hard cut.
pub fn split_chunks(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };
        if !current.is_empty() && current.len() + cost > CHUNK_MAX {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Force-split any chunk still over the limit (a single line longer than
    // CHUNK_MAX characters).
    let mut result = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.len() <= CHUNK_MAX {
            result.push(chunk);
            continue;
        }
        let mut remaining = chunk.as_str();
        while remaining.len() > CHUNK_MAX {
            let cut = floor_char_boundary(remaining, CHUNK_MAX);
            let split_at = remaining[..cut]
                .rfind(' ')
                .filter(|&i| i > 0)
                .unwrap_or(cut);
            result.push(remaining[..split_at].to_string());
            remaining = remaining[split_at..].trim_start();
        }
        if !remaining.is_empty() {
            result.push(remaining.to_string());
        }
    }
    result
}

/// Largest index ≤ `max` that falls on a UTF-8 character boundary.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut i = max.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Send `text` to `chat_id` as one or more chunks, pacing consecutive sends
/// by 100 ms to stay under Telegram's rate limits. Returns the ID of the
/// last sent message.
pub async fn send_chunked(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
) -> Result<Option<MessageId>, ChannelError> {
    let mut last_id = None;
    let chunks = split_chunks(text);
    for (i, chunk) in chunks.iter().enumerate() {
        match bot.send_message(chat_id, chunk).await {
            Ok(sent) => last_id = Some(sent.id),
            Err(e) => {
                warn!(error = %e, chunk_index = i, "failed to send message chunk");
                return Err(ChannelError::Api(e.to_string()));
            }
        }
        if i + 1 < chunks.len() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
    Ok(last_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(split_chunks("hello"), vec!["hello"]);
    }

    #[test]
    fn exactly_limit_is_one_chunk() {
        let text = "a".repeat(CHUNK_MAX);
        assert_eq!(split_chunks(&text).len(), 1);
    }

    #[test]
    fn splits_on_line_boundaries() {
        let line = "a".repeat(1500);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX, "chunk too large: {}", c.len());
        }
        // Nothing lost apart from the separators at the cut points.
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert!(total >= 3 * 1500);
    }

    #[test]
    fn force_splits_one_long_line() {
        let text = "x".repeat(9500);
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 3);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn force_split_respects_utf8_boundaries() {
        let text = "é".repeat(CHUNK_MAX); // 2 bytes each
        let chunks = split_chunks(&text);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
            assert!(std::str::from_utf8(c.as_bytes()).is_ok());
        }
    }
}
