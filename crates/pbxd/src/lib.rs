//! PBX Daemon - Simulated private branch exchange
//!
//! This crate provides the core infrastructure for the PBX daemon:
//! - `unit` - Telephone units and their call state machine
//! - `registry` - The exchange: extension table, dialing, shutdown
//! - `server` - TCP server and per-client connection handling
//! - `config` - Listening address and capacity settings
//! - `pidfile` - PID and log file locations for the daemon process
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        pbxd daemon                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │   PbxServer     │────▶│           Pbx               │    │
//! │  │ (TCP listener)  │     │  (extension -> Arc<Unit>)   │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │                             │                   │
//! │           │ connections                 │ dial / shutdown   │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ConnectionHandler│────▶│           Unit              │    │
//! │  │  (per client)   │     │  (state, peer, sink)        │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - A failed write to a client ends that client's session only

pub mod config;
pub mod pidfile;
pub mod registry;
pub mod server;
pub mod unit;
