//! Telephone unit states.

use std::fmt;
use std::str::FromStr;

use crate::DomainError;

/// Call state of a telephone unit (TU).
///
/// The wire name of each state is its SCREAMING_SNAKE_CASE form, e.g.
/// `ON_HOOK` or `BUSY_SIGNAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TuState {
    /// Handset down, no call in progress
    #[default]
    OnHook,

    /// Another unit is calling this one
    Ringing,

    /// Handset up, waiting for a number
    DialTone,

    /// This unit is calling another one
    RingBack,

    /// The dialed unit was unavailable
    BusySignal,

    /// Call answered; chat is possible
    Connected,

    /// The dialed number could not be resolved
    Error,
}

impl TuState {
    /// All states, in declaration order.
    pub const ALL: [TuState; 7] = [
        Self::OnHook,
        Self::Ringing,
        Self::DialTone,
        Self::RingBack,
        Self::BusySignal,
        Self::Connected,
        Self::Error,
    ];

    /// Returns the name used on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OnHook => "ON_HOOK",
            Self::Ringing => "RINGING",
            Self::DialTone => "DIAL_TONE",
            Self::RingBack => "RING_BACK",
            Self::BusySignal => "BUSY_SIGNAL",
            Self::Connected => "CONNECTED",
            Self::Error => "ERROR",
        }
    }

    /// Returns true if notifications for this state carry an extension.
    ///
    /// ON_HOOK reports the unit's own extension, CONNECTED the peer's.
    pub fn carries_extension(&self) -> bool {
        matches!(self, Self::OnHook | Self::Connected)
    }

    /// Returns true if a unit in this state is expected to have a peer.
    pub fn expects_peer(&self) -> bool {
        matches!(self, Self::Ringing | Self::RingBack | Self::Connected)
    }
}

impl fmt::Display for TuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TuState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.name() == s)
            .ok_or_else(|| DomainError::UnknownState(s.to_string()))
    }
}
