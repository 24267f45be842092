use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved metadata keys. Adapters and the orchestrator agree on these;
/// everything else in the map is carried through untouched.
pub mod meta {
    pub const USER_ID: &str = "user_id";
    pub const CHAT_ID: &str = "chat_id";
    pub const IMAGE: &str = "image";
    pub const SUBAGENT_RESULT: &str = "subagent_result";
    pub const SUBAGENT_LABEL: &str = "subagent_label";
    pub const TYPE: &str = "type";
    pub const MODEL: &str = "model";
    pub const INPUT_TOKENS: &str = "input_tokens";
    pub const OUTPUT_TOKENS: &str = "output_tokens";
    pub const EXPORT: &str = "export";
    pub const FILENAME: &str = "filename";

    /// `metadata.type` value stamped on compactor output.
    pub const TYPE_SUMMARY: &str = "summary";
}

/// A single conversation message. Immutable once appended to a session.
///
/// `metadata` is an open string-keyed map — readers tolerate (and persist)
/// keys they do not understand, so the stored format can grow additively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Inbound: channel-assigned ID. Outbound: generated UUID.
    pub id: String,
    pub text: String,
    /// Opaque principal label (username, "assistant", webhook source, …).
    pub from: String,
    /// Channel tag, e.g. "telegram".
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    /// Role bit: false → user/system, true → assistant.
    pub is_bot: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// An inline image attachment carried in `metadata.image`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAttachment {
    /// Base64-encoded bytes.
    pub data: String,
    /// MIME type, e.g. "image/jpeg".
    pub media_type: String,
}

impl Message {
    /// A user-role message as produced by a channel adapter.
    pub fn user(channel: &str, from: &str, text: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            from: from.to_string(),
            channel: channel.to_string(),
            timestamp: Utc::now(),
            is_bot: false,
            metadata: Map::new(),
        }
    }

    /// An assistant-role message (generated ID).
    pub fn assistant(channel: &str, text: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            from: "assistant".to_string(),
            channel: channel.to_string(),
            timestamp: Utc::now(),
            is_bot: true,
            metadata: Map::new(),
        }
    }

    /// Builder-style metadata insertion.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// The principal identifier from `metadata.user_id`, if present.
    pub fn user_id(&self) -> Option<&str> {
        self.metadata.get(meta::USER_ID).and_then(|v| v.as_str())
    }

    /// The platform chat identifier from `metadata.chat_id`, if present.
    pub fn chat_id(&self) -> Option<&str> {
        self.metadata.get(meta::CHAT_ID).and_then(|v| v.as_str())
    }

    /// Decode `metadata.image` into an attachment, if present and well-formed.
    pub fn image(&self) -> Option<ImageAttachment> {
        let obj = self.metadata.get(meta::IMAGE)?.as_object()?;
        Some(ImageAttachment {
            data: obj.get("data")?.as_str()?.to_string(),
            media_type: obj.get("media_type")?.as_str()?.to_string(),
        })
    }

    /// True when this message is compactor output (`metadata.type == "summary"`).
    pub fn is_summary(&self) -> bool {
        self.metadata
            .get(meta::TYPE)
            .and_then(|v| v.as_str())
            .is_some_and(|t| t == meta::TYPE_SUMMARY)
    }

    /// True when this message was injected by a completed sub-agent.
    pub fn is_subagent_result(&self) -> bool {
        self.metadata
            .get(meta::SUBAGENT_RESULT)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_round_trip_preserves_unknown_metadata() {
        let msg = Message::user("telegram", "alice", "hello")
            .with_meta(meta::USER_ID, "123")
            .with_meta("x_custom_key", json!({"nested": [1, 2, 3]}));

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Message = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.metadata["x_custom_key"]["nested"][1], json!(2));
    }

    #[test]
    fn empty_metadata_is_omitted_from_wire() {
        let msg = Message::assistant("telegram", "hi");
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(!encoded.contains("metadata"));

        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert!(decoded.metadata.is_empty());
    }

    #[test]
    fn image_accessor() {
        let msg = Message::user("telegram", "alice", "look").with_meta(
            meta::IMAGE,
            json!({"data": "aGVsbG8=", "media_type": "image/png"}),
        );
        let img = msg.image().unwrap();
        assert_eq!(img.data, "aGVsbG8=");
        assert_eq!(img.media_type, "image/png");

        assert!(Message::user("telegram", "alice", "plain").image().is_none());
    }

    #[test]
    fn summary_marker() {
        let summary =
            Message::assistant("telegram", "[Summary]").with_meta(meta::TYPE, meta::TYPE_SUMMARY);
        assert!(summary.is_summary());
        assert!(!Message::assistant("telegram", "hi").is_summary());
    }

    #[test]
    fn roles() {
        assert!(!Message::user("t", "u", "x").is_bot);
        assert!(Message::assistant("t", "x").is_bot);
    }
}
