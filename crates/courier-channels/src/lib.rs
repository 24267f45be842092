pub mod channel;
pub mod error;
pub mod types;

pub use channel::{ChannelAdapter, InboundSink};
pub use error::ChannelError;
pub use types::ChannelStatus;
