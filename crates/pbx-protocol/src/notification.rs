//! Notifications sent by the exchange to a telephone client.

use std::fmt;

use pbx_core::{Extension, TuState};

use crate::parse::{strip_terminator, ParseError, LINE_TERMINATOR};

const CHAT_KEYWORD: &str = "CHAT";

/// A single server-to-client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The unit's current state.
    ///
    /// `extension` is only present for ON_HOOK (own extension) and
    /// CONNECTED (peer's extension).
    State {
        state: TuState,
        extension: Option<Extension>,
    },

    /// Text forwarded from the connected peer
    Chat(String),
}

impl Notification {
    /// Creates a state notification.
    ///
    /// The extension is dropped for states that do not carry one.
    pub fn state(state: TuState, extension: Option<Extension>) -> Self {
        let extension = extension.filter(|_| state.carries_extension());
        Self::State { state, extension }
    }

    /// Creates a chat notification.
    pub fn chat(text: impl Into<String>) -> Self {
        Self::Chat(text.into())
    }

    /// Renders the notification with its CRLF terminator.
    pub fn to_line(&self) -> String {
        format!("{self}{LINE_TERMINATOR}")
    }

    /// Parses one line received from the exchange.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = strip_terminator(line);

        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        if let Some(text) = line.strip_prefix(CHAT_KEYWORD) {
            if let Some(text) = text.strip_prefix(' ') {
                return Ok(Self::Chat(text.to_string()));
            }
        }

        let (name, extension) = match line.split_once(' ') {
            Some((name, ext)) => (name, Some(ext)),
            None => (line, None),
        };

        let state: TuState = name
            .parse()
            .map_err(|_| ParseError::UnknownNotification(line.to_string()))?;

        let extension = match extension {
            Some(digits) if state.carries_extension() => Some(Extension::parse_digits(digits)?),
            Some(_) => return Err(ParseError::UnknownNotification(line.to_string())),
            None => None,
        };

        Ok(Self::State { state, extension })
    }
}

/// Renders the notification as it appears on the wire, without terminator.
impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State {
                state,
                extension: Some(ext),
            } => write!(f, "{state} {ext}"),
            Self::State {
                state,
                extension: None,
            } => write!(f, "{state}"),
            Self::Chat(text) => write!(f, "{CHAT_KEYWORD} {text}"),
        }
    }
}
