use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use sigmet_raw::{
    client::{self, ClientError},
    config::Config,
    daemon::{self, Daemon},
};
use tracing::info;

use crate::DaemonAction;

/// How long a background start waits for the socket to appear
const STARTUP_WAIT: Duration = Duration::from_secs(5);

/// Handle daemon management commands
pub async fn handle_daemon(config: Config, config_path: Option<&Path>, action: DaemonAction) -> Result<()> {
    let dir = config.daemon.dir.clone();
    match action {
        DaemonAction::Start { foreground } => {
            if daemon::is_daemon_running(&dir) {
                println!("Daemon is already running");
                return Ok(());
            }

            if foreground {
                let daemon = Daemon::start(config).await?;
                daemon.run().await?;
                return Ok(());
            }

            let pid = spawn_background(&config, config_path)?;
            wait_for_socket(&config).await?;
            println!("Daemon started (PID {})", pid);
            Ok(())
        }
        DaemonAction::Stop => {
            if !daemon::is_daemon_running(&dir) {
                println!("Daemon is not running");
                return Ok(());
            }

            println!("Stopping daemon...");
            match client::shutdown(&dir).await {
                Ok(()) => println!("Daemon stopped"),
                Err(ClientError::DaemonNotRunning) => println!("Daemon is not running"),
                Err(e) => anyhow::bail!("Failed to stop daemon: {}", e),
            }
            Ok(())
        }
        DaemonAction::Status => {
            match client::status(&dir).await {
                Ok(report) => {
                    println!("Daemon Status:");
                    println!("  Directory: {}", dir.display());
                    if let Some(pid) = daemon::get_daemon_pid(&dir) {
                        println!("  PID: {}", pid);
                    }
                    for line in report.lines() {
                        println!("  {}", line);
                    }
                }
                Err(ClientError::DaemonNotRunning) => {
                    println!("Daemon is not running");
                    if dir.join(sigmet_raw::config::PID_FILE_NAME).exists() {
                        println!("  Stale PID file found in {}", dir.display());
                    }
                }
                Err(e) => anyhow::bail!("Failed to get status: {}", e),
            }
            Ok(())
        }
    }
}

/// Re-run this executable as a foreground daemon in its own process group
fn spawn_background(config: &Config, config_path: Option<&Path>) -> Result<u32> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe().context("Failed to locate own executable")?;
    let mut cmd = std::process::Command::new(exe);
    if let Some(path) = config_path {
        cmd.arg("--config").arg(path);
    }
    cmd.arg("--dir")
        .arg(&config.daemon.dir)
        .args(["daemon", "start", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    let child = cmd.spawn().context("Failed to spawn daemon process")?;
    info!("Spawned daemon process {}", child.id());
    Ok(child.id())
}

async fn wait_for_socket(config: &Config) -> Result<()> {
    let socket = config.socket_path();
    let deadline = tokio::time::Instant::now() + STARTUP_WAIT;
    while tokio::time::Instant::now() < deadline {
        if socket.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!(
        "Daemon did not create {} within {:?}",
        socket.display(),
        STARTUP_WAIT
    )
}
