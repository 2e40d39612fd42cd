//! Line-delimited JSON command channel.
//!
//! Inbound lines are `{"command": "<verb>", ...}`; every outbound line is a
//! [`StatusMessage`]. Registry events are forwarded in the order they arrive.

pub mod channel;
pub mod message;
pub mod sink;

pub use channel::{ChannelSettings, CommandChannel};
pub use message::{parse_command, Command, ParseError, StatusKind, StatusMessage};
pub use sink::{ChannelSink, StatusSink, WriterSink};
