//! Framing helpers and parse errors.

use pbx_core::DomainError;
use thiserror::Error;

/// Terminator appended to every outbound line.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Longest accepted line, terminator included (64 KiB).
pub const MAX_LINE_LENGTH: usize = 65_536;

/// Errors produced while parsing protocol lines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed dial target: {0}")]
    BadExtension(#[from] DomainError),

    #[error("unknown notification: {0}")]
    UnknownNotification(String),

    #[error("line too long: {size} bytes (max: {max})")]
    TooLong { size: usize, max: usize },
}

/// Removes a trailing CRLF (or bare LF) from a line.
///
/// A lone carriage return without a following newline is kept, so that
/// `"pickup\r"` is not mistaken for a complete command.
pub fn strip_terminator(line: &str) -> &str {
    match line.strip_suffix('\n') {
        Some(body) => body.strip_suffix('\r').unwrap_or(body),
        None => line,
    }
}
