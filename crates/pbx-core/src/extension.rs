//! Extension numbers: the addresses at which units can be dialed.

use std::fmt;
use std::str::FromStr;

use crate::{DomainError, DomainResult};

/// Numeric address of a registered telephone unit.
///
/// Extensions are assigned by the exchange at registration time and double
/// as slot indices into its fixed-capacity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Extension(u32);

impl Extension {
    /// Creates an extension from its numeric value.
    pub const fn new(number: u32) -> Self {
        Self(number)
    }

    /// Returns the numeric value.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the slot index this extension occupies in the exchange.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Parses an extension from a string of ASCII digits.
    ///
    /// Unlike `u32::from_str`, a leading `+` is rejected: every byte must be a
    /// digit, and at least one digit is required.
    pub fn parse_digits(text: &str) -> DomainResult<Self> {
        if text.is_empty() {
            return Err(DomainError::InvalidExtension {
                value: String::new(),
                reason: "no digits".to_string(),
            });
        }

        if let Some(bad) = text.chars().find(|c| !c.is_ascii_digit()) {
            return Err(DomainError::InvalidExtension {
                value: text.to_string(),
                reason: format!("unexpected character {bad:?}"),
            });
        }

        text.parse::<u32>()
            .map(Self)
            .map_err(|e| DomainError::InvalidExtension {
                value: text.to_string(),
                reason: e.to_string(),
            })
    }
}

impl fmt::Display for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Extension {
    fn from(number: u32) -> Self {
        Self(number)
    }
}

impl FromStr for Extension {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_digits(s)
    }
}
