use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("conversation is empty")]
    EmptyConversation,

    #[error("operation cancelled")]
    Cancelled,

    #[error("agent not configured")]
    NotConfigured,
}
