//! Connection handler for individual telephone clients.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Creates a unit bound to the connection's write half
//! - Registers it at an extension derived from the socket
//! - Parses incoming command lines and routes them to the unit or exchange
//! - Unregisters the unit when input ends or the exchange disconnects it
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use pbx_core::Extension;
use pbx_protocol::{Command, ParseError, MAX_LINE_LENGTH};

use crate::registry::{Pbx, RegistryError};
use crate::unit::Unit;

/// Connection handler for a single telephone client.
pub struct ConnectionHandler {
    /// Buffered reader for incoming command lines
    reader: BufReader<OwnedReadHalf>,

    /// The unit bound to this connection's write half
    unit: Arc<Unit>,

    /// Extension this connection will be registered at
    extension: Extension,

    /// Shared exchange
    pbx: Arc<Pbx>,

    /// Remote address, for logging
    peer_addr: SocketAddr,
}

impl ConnectionHandler {
    /// Creates a handler for an accepted connection.
    ///
    /// The socket's file descriptor becomes the extension: it is unique
    /// among open connections, and the connection stays open until after
    /// the unit has been unregistered.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr, pbx: Arc<Pbx>) -> Self {
        let extension = Extension::new(u32::try_from(stream.as_raw_fd()).unwrap_or(u32::MAX));
        let (reader, writer) = stream.into_split();

        Self {
            reader: BufReader::new(reader),
            unit: Unit::new(writer),
            extension,
            pbx,
            peer_addr,
        }
    }

    /// Runs the connection handler.
    ///
    /// Registers the unit, processes commands until the client hangs up the
    /// connection or the exchange disconnects it, then unregisters. If
    /// registration fails the connection is closed straight away.
    pub async fn run(mut self) {
        debug!(peer = %self.peer_addr, extension = %self.extension, "New client connected");

        if let Err(e) = self.pbx.register(&self.unit, self.extension).await {
            match e {
                RegistryError::Unit(_) => {
                    warn!(peer = %self.peer_addr, error = %e, "Registered client unreachable");
                }
                _ => {
                    warn!(peer = %self.peer_addr, error = %e, "Registration rejected");
                    return;
                }
            }
        } else if let Err(e) = self.process_commands().await {
            debug!(extension = %self.extension, error = %e, "Connection closed");
        }

        if let Err(e) = self.pbx.unregister(&self.unit).await {
            debug!(extension = %self.extension, error = %e, "Unregistration reported an error");
        }

        info!(peer = %self.peer_addr, extension = %self.extension, "Client disconnected");
    }

    /// Main command loop.
    ///
    /// Returns `Ok(())` on end of input or disconnect, and an error when
    /// the connection itself fails.
    async fn process_commands(&mut self) -> Result<(), ConnectionError> {
        let unit = Arc::clone(&self.unit);

        loop {
            let line = tokio::select! {
                biased;

                _ = unit.disconnected() => {
                    debug!(extension = %self.extension, "Disconnected by exchange");
                    return Ok(());
                }

                line = read_line(&mut self.reader) => line,
            };

            let line = match line {
                Ok(line) => line,
                Err(ConnectionError::Eof) => {
                    debug!(extension = %self.extension, "Client sent EOF");
                    return Ok(());
                }
                Err(e @ (ConnectionError::Malformed(_) | ConnectionError::NotUtf8)) => {
                    debug!(extension = %self.extension, error = %e, "Rejected malformed line");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(e) => {
                    debug!(extension = %self.extension, error = %e, "Rejected malformed command");
                    continue;
                }
            };

            let name = command.name();
            match self.handle_command(command).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(ConnectionError::Registry(e)),
                Err(e) => {
                    debug!(extension = %self.extension, command = name, error = %e, "Command rejected");
                }
            }
        }
    }

    /// Routes one command to the unit or the exchange.
    async fn handle_command(&self, command: Command) -> Result<(), RegistryError> {
        debug!(extension = %self.extension, command = %command, "Received command");

        match command {
            Command::Pickup => self.unit.pickup().await?,
            Command::Hangup => self.unit.hangup().await?,
            Command::Dial(target) => self.pbx.dial(&self.unit, target).await?,
            Command::Chat(text) => self.unit.chat(&text).await?,
        }

        Ok(())
    }
}

/// Reads one line, including its terminator.
///
/// Lines longer than `MAX_LINE_LENGTH` are consumed up to their newline
/// and reported as malformed, as are lines that are not valid UTF-8.
pub async fn read_line<R>(reader: &mut R) -> Result<String, ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = MAX_LINE_LENGTH as u64;

    let bytes_read = (&mut *reader)
        .take(limit)
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|e| ConnectionError::Io(e.to_string()))?;

    if bytes_read == 0 {
        return Err(ConnectionError::Eof);
    }

    if buf.len() >= MAX_LINE_LENGTH && buf.last() != Some(&b'\n') {
        let skipped = skip_line(reader).await?;
        return Err(ConnectionError::Malformed(ParseError::TooLong {
            size: buf.len() + skipped,
            max: MAX_LINE_LENGTH,
        }));
    }

    String::from_utf8(buf).map_err(|_| ConnectionError::NotUtf8)
}

/// Discards input up to and including the next newline.
async fn skip_line<R>(reader: &mut R) -> Result<usize, ConnectionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let chunk = reader
            .fill_buf()
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if chunk.is_empty() {
            return Ok(skipped);
        }

        match chunk.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(skipped + pos + 1);
            }
            None => {
                let len = chunk.len();
                reader.consume(len);
                skipped += len;
            }
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Malformed line: {0}")]
    Malformed(ParseError),

    #[error("Line is not valid UTF-8")]
    NotUtf8,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}
