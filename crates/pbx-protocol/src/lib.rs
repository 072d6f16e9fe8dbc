//! PBX Protocol - Line-oriented wire protocol
//!
//! This crate provides the command and notification types exchanged
//! between telephone clients and the exchange daemon. Every message is a
//! single line terminated by CRLF.

pub mod command;
pub mod notification;
pub mod parse;

pub use command::Command;
pub use notification::Notification;
pub use parse::{strip_terminator, ParseError, LINE_TERMINATOR, MAX_LINE_LENGTH};
