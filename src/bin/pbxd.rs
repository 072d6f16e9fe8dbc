//! PBX Daemon - Simulated telephone exchange
//!
//! This binary listens for telephone clients on a TCP port, registers each
//! connection as a telephone unit, and switches calls between them.
//!
//! # Usage
//!
//! ```bash
//! # Start the exchange on port 3000 (foreground)
//! pbxd start -p 3000
//!
//! # Start the exchange (background/daemonized)
//! pbxd start -p 3000 -d
//!
//! # Stop the daemon
//! pbxd stop
//!
//! # Check daemon status
//! pbxd status
//!
//! # Bind only to loopback, with 64 extension slots
//! PBX_HOST=127.0.0.1 PBX_MAX_EXTENSIONS=64 pbxd start -p 3000
//!
//! # Enable debug logging
//! RUST_LOG=pbxd=debug pbxd start -p 3000
//! ```
//!
//! # Signal Handling
//!
//! - SIGHUP/SIGTERM/SIGINT: Graceful shutdown. Every client is disconnected
//!   and the process exits once all sessions have ended.

use std::fs::{self, File};
use std::future::Future;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pbxd::config::{parse_max_extensions, PbxConfig};
use pbxd::pidfile::{self, PidFile};
use pbxd::server::PbxServer;

/// PBX daemon - telephone exchange simulator
#[derive(Parser, Debug)]
#[command(name = "pbxd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the exchange
    Start {
        /// TCP port to listen on
        #[arg(short = 'p', long)]
        port: u16,

        /// Host or address to bind (overrides PBX_HOST)
        #[arg(long)]
        host: Option<String>,

        /// Number of extension slots (overrides PBX_MAX_EXTENSIONS)
        #[arg(long, value_parser = |s: &str| parse_max_extensions("--max-extensions", s))]
        max_extensions: Option<usize>,

        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

/// Sends SIGTERM to the daemon process.
fn stop_daemon(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: kill has no memory-safety preconditions.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {}", pid);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let pidfile = PidFile::default_location();

    match args.command {
        Command::Start {
            port,
            host,
            max_extensions,
            daemon,
        } => {
            // Resolve configuration before forking so errors reach the terminal
            let mut config = PbxConfig::from_env(port)?;
            if let Some(host) = host {
                config = config.with_host(host);
            }
            if let Some(max_extensions) = max_extensions {
                config = config.with_max_extensions(max_extensions);
            }

            if let Some(pid) = pidfile.running_pid() {
                eprintln!("Daemon is already running (PID {})", pid);
                eprintln!("Use 'pbxd stop' to stop it first.");
                process::exit(1);
            }

            if daemon {
                // Daemonize before starting tokio runtime
                daemonize()?;
            }

            pidfile.write().context("Failed to write PID file")?;

            let result = run_daemon(config);

            pidfile.remove();

            result
        }
        Command::Stop => {
            if let Some(pid) = pidfile.running_pid() {
                println!("Stopping daemon (PID {})...", pid);
                stop_daemon(pid)?;

                // Shutdown waits for every client, so allow a little longer
                for _ in 0..100 {
                    if !pidfile::is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = pidfile.running_pid() {
                println!("Daemon is running (PID {})", pid);
                println!("PID file: {}", pidfile.path().display());
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

/// Daemonizes the current process.
fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = pidfile::log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to duplicate log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

/// Runs the exchange (async entry point).
#[tokio::main]
async fn run_daemon(config: PbxConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pbxd=info".parse()?)
                .add_directive("pbx_core=info".parse()?)
                .add_directive("pbx_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "PBX daemon starting"
    );

    let cancel_token = CancellationToken::new();

    tokio::spawn(cancel_on_signal(
        wait_for_shutdown_signal(),
        cancel_token.clone(),
    ));

    let server = PbxServer::bind(&config, cancel_token)
        .await
        .context("Failed to start server")?;

    info!(
        addr = %config.listen_addr(),
        max_extensions = config.max_extensions,
        "Starting server"
    );

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("PBX daemon stopped");
    Ok(())
}

/// Cancels `token` once `signal` reports a shutdown signal.
///
/// If the signal handlers could not be installed the token is left alone
/// and the server keeps running.
async fn cancel_on_signal<F>(signal: F, token: CancellationToken)
where
    F: Future<Output = Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("Shutdown signal received");
            token.cancel();
        }
        Err(e) => {
            error!(error = %e, "Error waiting for shutdown signal");
        }
    }
}

/// Waits for a shutdown signal (SIGHUP, SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sighup.recv() => {
            info!("Received SIGHUP");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
