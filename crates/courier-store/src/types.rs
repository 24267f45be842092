use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::Message;

/// One persisted session row, as loaded from the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub key: String,
    pub messages: Vec<Message>,
    pub model: Option<String>,
    pub profile: Option<String>,
    pub updated_at: String,
}

/// User-curated long-term note attached to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: String,
    pub session_key: String,
    pub text: String,
    pub created_at: String,
}

impl Pin {
    pub fn new(session_key: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.to_string(),
            text: text.to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Lifecycle state of a background sub-agent.
/// pending → running → (done | failed | canceled); terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubAgentStatus {
    Pending,
    Running,
    Done,
    Failed,
    Canceled,
}

impl SubAgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubAgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubAgentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown sub-agent status: {}", other)),
        }
    }
}

/// Durable record of one background agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentRecord {
    pub id: String,
    /// Human-readable label shown in notifications.
    pub label: String,
    /// The initial prompt the worker is seeded with.
    pub task: String,
    pub system_prompt: Option<String>,
    pub status: SubAgentStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Session whose conversation receives the completion notification.
    pub parent_session_key: String,
}

impl SubAgentRecord {
    pub fn new(task: &str, label: &str, system_prompt: Option<&str>, parent: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            task: task.to_string(),
            system_prompt: system_prompt.map(String::from),
            status: SubAgentStatus::Pending,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            parent_session_key: parent.to_string(),
        }
    }
}

/// Aggregate usage for one session across its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub compactions: u32,
    /// Tokens of the context window sent on the most recent turn.
    pub last_context_tokens: u64,
}
