//! Extension registry and shutdown coordination.
//!
//! The registry is the central directory of the exchange. It owns the
//! extension table, hands out the registry's reference to each unit while
//! it is plugged in, and counts live sessions so that shutdown can wait for
//! all of them to drain.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  register/unregister  ┌─────────────────┐
//! │ConnectionHandler│──────────────────────▶│       Pbx       │
//! │  (per client)   │        dial           │ ext → Arc<Unit> │
//! └────────┬────────┘                       └────────┬────────┘
//!          │ pickup/hangup/chat                      │ session count
//!          ▼                                         ▼
//! ┌─────────────────┐   peer   ┌────────┐   ┌─────────────────┐
//! │      Unit       │◀────────▶│  Unit  │   │  ShutdownGate   │
//! └─────────────────┘          └────────┘   └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Slot access goes through `get`/`get_mut`, never indexing

mod error;
mod gate;
mod pbx;

pub use error::RegistryError;
pub use gate::ShutdownGate;
pub use pbx::{Pbx, DEFAULT_MAX_EXTENSIONS};
