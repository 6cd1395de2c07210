//! Client Module
//!
//! Client side of the session protocol. CLI commands use this module to run
//! subcommands in the daemon.

pub mod connection;

pub use connection::DaemonClient;

use std::path::Path;

use thiserror::Error;

/// Errors that can occur when communicating with the daemon
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Daemon is not running. Start it with: sigmet_raw daemon start")]
    DaemonNotRunning,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Daemon closed the connection without a status")]
    UnexpectedResponse,
}

/// Run one subcommand in the daemon at `dir`, forwarding its output to this
/// process's standard output and error. Returns the subcommand's status.
pub async fn run_command(dir: &Path, args: Vec<String>) -> Result<i32, ClientError> {
    let mut client = DaemonClient::connect(dir).await?;
    let mut out = tokio::io::stdout();
    let mut err = tokio::io::stderr();
    client.run(args, &mut out, &mut err).await
}

/// Run a subcommand and collect its standard output
pub async fn capture(dir: &Path, args: Vec<String>) -> Result<(i32, String), ClientError> {
    let mut client = DaemonClient::connect(dir).await?;
    let mut out = Vec::new();
    let mut err = tokio::io::stderr();
    let status = client.run(args, &mut out, &mut err).await?;
    Ok((status, String::from_utf8_lossy(&out).into_owned()))
}

/// Ask the daemon to stop
pub async fn shutdown(dir: &Path) -> Result<(), ClientError> {
    match capture(dir, vec!["stop".to_string()]).await? {
        (0, _) => Ok(()),
        (status, _) => Err(ClientError::RequestFailed(format!("stop returned {}", status))),
    }
}

/// Daemon status report
pub async fn status(dir: &Path) -> Result<String, ClientError> {
    match capture(dir, vec!["status".to_string()]).await? {
        (0, report) => Ok(report),
        (status, _) => Err(ClientError::RequestFailed(format!("status returned {}", status))),
    }
}
