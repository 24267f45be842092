use serde::{Deserialize, Serialize};

/// Runtime connection state of a channel adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Fully connected and ready to send/receive.
    Connected,

    /// Attempting to establish or re-establish the connection.
    Connecting,

    /// Cleanly disconnected (not an error condition).
    Disconnected,

    /// An unrecoverable (or pre-retry) error occurred.
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_snake_case() {
        let s = serde_json::to_string(&ChannelStatus::Connected).unwrap();
        assert_eq!(s, r#""connected""#);
        let e = serde_json::to_string(&ChannelStatus::Error("boom".into())).unwrap();
        assert!(e.contains("error"));
    }
}
