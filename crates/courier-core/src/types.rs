use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Callback invoked with each streamed text fragment of an in-progress reply.
///
/// Channel adapters decide how to surface deltas (debounced message edits,
/// terminal writes, …); the core only guarantees the fragments arrive in order.
pub type DeltaSink = Arc<dyn Fn(String) + Send + Sync>;

/// Conversation key: one principal on one channel.
///
/// Format: `<channel>:<user_id>` (e.g. `telegram:123456789`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(pub String);

impl SessionKey {
    pub fn new(channel: &str, user_id: &str) -> Self {
        Self(format!("{}:{}", channel, user_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The channel tag (everything before the first `:`).
    pub fn channel(&self) -> &str {
        self.0.split_once(':').map(|(c, _)| c).unwrap_or(&self.0)
    }

    /// The principal identifier (everything after the first `:`).
    pub fn user_id(&self) -> &str {
        self.0.split_once(':').map(|(_, u)| u).unwrap_or("")
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
