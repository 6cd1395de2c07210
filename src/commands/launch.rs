use std::os::unix::process::ExitStatusExt;

use anyhow::{Context, Result};
use sigmet_raw::{
    client::{self, ClientError},
    config::{Config, DIR_ENV},
    daemon::Daemon,
};
use tracing::{debug, info};

/// Send a subcommand to the running daemon and return its status
pub async fn forward(config: &Config, args: Vec<String>) -> Result<i32> {
    debug!("Forwarding {:?}", args);
    match client::run_command(&config.daemon.dir, args).await {
        Ok(status) => Ok(status),
        Err(ClientError::DaemonNotRunning) => anyhow::bail!(
            "No daemon in {}. Start one with: sigmet_raw daemon start",
            config.daemon.dir.display()
        ),
        Err(e) => Err(e.into()),
    }
}

/// Start a daemon, run `command` with `SIGMET_RAWD_DIR` pointing at it, and
/// stop the daemon when the command exits. Returns the command's status.
pub async fn run_with_daemon(config: Config, command: Vec<String>) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("No command given");
    };
    let dir = config.daemon.dir.clone();

    let daemon = Daemon::start(config).await?;
    let stop = daemon.shutdown_sender();
    info!("Running {} with daemon in {}", program, dir.display());

    let child = async {
        let status = tokio::process::Command::new(program)
            .args(args)
            .env(DIR_ENV, &dir)
            .status()
            .await;
        let _ = stop.send(());
        status
    };

    let (served, status) = tokio::join!(daemon.run(), child);
    let status = status.with_context(|| format!("Failed to run {}", program))?;
    served?;

    Ok(status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1))
}
