//! Chat channel abstraction and a Telegram adapter.
//!
//! Grounded on the teacher's `channels::base::BaseChannel` trait and
//! message-splitting helper, and `channels::telegram::TelegramChannel`
//! for the send path. The core only ever sees the `ChatChannel` trait
//! (spec §9 "dynamic dispatch over channels").

pub mod base;
pub mod errors;
pub mod telegram;

pub use base::{
    label_parts, split_message, CallbackButton, ChatChannel, InboundUpdate, OutboundNotification,
    MAX_MESSAGE_CHARS,
};
pub use errors::{ChannelError, ChannelResult};
pub use telegram::{TelegramChannel, TelegramConfig};
