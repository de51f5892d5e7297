//! Channel adapters for ThreadRelay.
//!
//! Adapters are pure I/O: they convert platform updates to `InboundMessage` and relay
//! `OutboundMessage` text back to a chat.

mod chunk;
mod telegram;
mod traits;
mod types;

pub use chunk::{TELEGRAM_MAX_MESSAGE_CHARS, chunk_text};
pub use telegram::{TelegramAdapter, TelegramMode};
pub use traits::ChannelAdapter;
pub use types::{ChannelId, ChatId, InboundMessage, MessageId, OutboundMessage, SenderId};
