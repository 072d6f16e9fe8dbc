//! PBX Core - Shared types for the telephone exchange
//!
//! This crate provides the domain vocabulary shared between
//! the exchange daemon (pbxd) and the line protocol (pbx-protocol).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod extension;
pub mod state;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use extension::Extension;
pub use state::TuState;
