//! Telegram channel adapter.
//!
//! Long polling via a teloxide `Dispatcher` — no public URL required. Each
//! inbound message is handed to the orchestrator through the `InboundSink`
//! contract; replies render either as one chunked send or, in streaming
//! mode, as debounced edits of a placeholder message.

pub mod adapter;
pub mod allow;
pub mod handler;
pub mod send;
pub mod stream;
pub mod typing;

pub use adapter::TelegramAdapter;
