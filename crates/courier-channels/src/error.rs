use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel is not connected")]
    NotConnected,

    #[error("platform API error: {0}")]
    Api(String),
}
