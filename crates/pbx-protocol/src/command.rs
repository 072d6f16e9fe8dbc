//! Commands sent by a telephone client to the exchange.

use std::fmt;

use pbx_core::Extension;

use crate::parse::{strip_terminator, ParseError};

const DIAL_PREFIX: &str = "dial ";
const CHAT_PREFIX: &str = "chat ";

/// A single client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Take the handset off the hook
    Pickup,

    /// Put the handset back on the hook
    Hangup,

    /// Dial another extension
    Dial(Extension),

    /// Send text to the connected peer
    Chat(String),
}

impl Command {
    /// Parses one line of client input.
    ///
    /// The line may still carry its CRLF terminator. Keywords are
    /// case-sensitive and must be followed by exactly one space when they
    /// take an argument. The chat text is everything after `chat `,
    /// including further spaces.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = strip_terminator(line);

        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        match line {
            "pickup" => return Ok(Self::Pickup),
            "hangup" => return Ok(Self::Hangup),
            _ => {}
        }

        if let Some(digits) = line.strip_prefix(DIAL_PREFIX) {
            return Ok(Self::Dial(Extension::parse_digits(digits)?));
        }

        if let Some(text) = line.strip_prefix(CHAT_PREFIX) {
            return Ok(Self::Chat(text.to_string()));
        }

        Err(ParseError::UnknownCommand(line.to_string()))
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pickup => "pickup",
            Self::Hangup => "hangup",
            Self::Dial(_) => "dial",
            Self::Chat(_) => "chat",
        }
    }
}

/// Renders the command as it appears on the wire, without terminator.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pickup | Self::Hangup => f.write_str(self.name()),
            Self::Dial(ext) => write!(f, "{DIAL_PREFIX}{ext}"),
            Self::Chat(text) => write!(f, "{CHAT_PREFIX}{text}"),
        }
    }
}
