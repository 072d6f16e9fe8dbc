//! Unit operation errors.

use std::io;

use pbx_core::{Extension, TuState};
use thiserror::Error;

/// Errors returned by telephone unit operations.
///
/// None of these leave the unit in an inconsistent state: logical
/// rejections change nothing, and delivery failures keep whatever
/// transition was already applied.
#[derive(Debug, Clone, Error)]
pub enum UnitError {
    /// The unit's state requires a peer but none is recorded.
    #[error("no peer in state {state}")]
    NoPeer { state: TuState },

    /// Chat attempted without an established call.
    #[error("not connected (state {state})")]
    NotConnected { state: TuState },

    /// Writing to this unit's own connection failed.
    #[error("failed to notify extension {}: {reason}", display_ext(.extension))]
    Delivery {
        extension: Option<Extension>,
        reason: String,
    },

    /// Writing to the peer's connection failed.
    #[error("failed to notify peer extension {}: {reason}", display_ext(.extension))]
    PeerDelivery {
        extension: Option<Extension>,
        reason: String,
    },
}

impl UnitError {
    pub(crate) fn delivery(extension: Option<Extension>, err: io::Error) -> Self {
        Self::Delivery {
            extension,
            reason: err.to_string(),
        }
    }

    pub(crate) fn peer_delivery(extension: Option<Extension>, err: io::Error) -> Self {
        Self::PeerDelivery {
            extension,
            reason: err.to_string(),
        }
    }

    /// Returns true if the session owning the unit should end.
    ///
    /// Only a broken own connection is fatal; rejections and peer-side
    /// failures leave the session usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Delivery { .. })
    }
}

fn display_ext(extension: &Option<Extension>) -> String {
    extension.map_or_else(|| "-".to_string(), |ext| ext.to_string())
}
