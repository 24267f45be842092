pub mod config;
pub mod error;
pub mod message;
pub mod types;

pub use error::{CourierError, Result};
pub use message::Message;
pub use types::{DeltaSink, SessionKey};
