//! TCP server for the PBX daemon.
//!
//! The server:
//! - Listens on a TCP socket for telephone clients
//! - Spawns a ConnectionHandler for each client
//! - On cancellation, stops accepting and shuts the exchange down,
//!   waiting for every live session to unregister
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    PbxServer    │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│     Arc<Pbx>    │
//! │   (per client)  │     │                 │
//! └─────────────────┘     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`

mod connection;

pub use connection::{read_line, ConnectionError, ConnectionHandler};

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use socket2::SockRef;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::PbxConfig;
use crate::registry::Pbx;

/// TCP server for the exchange.
pub struct PbxServer {
    /// Bound listening socket
    listener: TcpListener,

    /// Shared exchange
    pbx: Arc<Pbx>,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,
}

impl PbxServer {
    /// Binds the listening socket described by `config`.
    ///
    /// The exchange is created here, sized by `config.max_extensions`.
    pub async fn bind(config: &PbxConfig, cancel_token: CancellationToken) -> Result<Self, ServerError> {
        let pbx = Arc::new(Pbx::new(config.max_extensions));
        Self::bind_with(config, pbx, cancel_token).await
    }

    /// Binds the listening socket, serving an existing exchange.
    pub async fn bind_with(
        config: &PbxConfig,
        pbx: Arc<Pbx>,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            pbx,
            cancel_token,
        })
    }

    /// Returns the address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::Accept(e.to_string()))
    }

    /// Returns the exchange served by this server.
    pub fn pbx(&self) -> &Arc<Pbx> {
        &self.pbx
    }

    /// Runs the server.
    ///
    /// Accepts connections until the cancellation token is triggered or
    /// accepting fails. Either way the exchange is shut down exactly once
    /// before returning, so every session has finished when this returns.
    ///
    /// # Errors
    ///
    /// `ServerError::Accept` if the accept loop ended on an I/O error.
    pub async fn run(self) -> Result<(), ServerError> {
        let Self {
            listener,
            pbx,
            cancel_token,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "PBX server listening");
        }

        // Accept connections until cancelled
        let outcome = loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            handle_connection(stream, peer_addr, &pbx);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            break Err(ServerError::Accept(e.to_string()));
                        }
                    }
                }
            }
        };

        drop(listener);
        let active = pbx.active_count().await;
        info!(active, "Shutting down exchange");
        pbx.shutdown().await;
        info!("Server stopped");

        outcome
    }
}

/// Spawns a handler task for a new client connection.
fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, pbx: &Arc<Pbx>) {
    if let Err(e) = configure_stream(&stream) {
        error!(peer = %peer_addr, error = %e, "Failed to configure client socket");
    }

    let handler = ConnectionHandler::new(stream, peer_addr, Arc::clone(pbx));
    tokio::spawn(handler.run());
}

/// Enables TCP_NODELAY and SO_KEEPALIVE on an accepted stream.
///
/// Keepalive lets the kernel detect clients that vanished without closing,
/// so their session ends and the extension is freed.
fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("Failed to accept connection: {0}")]
    Accept(String),
}
