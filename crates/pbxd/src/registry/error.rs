//! Registry errors.

use pbx_core::Extension;
use thiserror::Error;

use crate::unit::UnitError;

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The extension does not fit in the exchange's slot table.
    #[error("extension {extension} out of range (max: {max})")]
    ExtensionOutOfRange { extension: Extension, max: usize },

    /// Another unit already holds the extension.
    #[error("extension already in use: {0}")]
    ExtensionInUse(Extension),

    /// The unit was registered before, possibly under another extension.
    #[error("unit already registered at extension {0}")]
    AlreadyRegistered(Extension),

    /// The unit never received an extension.
    #[error("unit is not registered")]
    NotRegistered,

    /// Shutdown has begun; no new units are accepted.
    #[error("exchange is shutting down")]
    ShuttingDown,

    /// The unit operation itself failed.
    #[error(transparent)]
    Unit(#[from] UnitError),
}

impl RegistryError {
    /// Returns true if the calling session should end.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Unit(err) => err.is_fatal(),
            _ => false,
        }
    }
}
