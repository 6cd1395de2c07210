//! Daemon Lifecycle Management
//!
//! Handles daemon startup, shutdown, and single-instance guarantees.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{Config, PID_FILE_NAME};

use super::handler::DaemonState;
use super::metrics::DaemonMetrics;
use super::server::IpcServer;

/// Resource limit signals that end the daemon
const FATAL_SIGNALS: [(libc::c_int, &str); 3] = [
    (libc::SIGXCPU, "SIGXCPU"),
    (libc::SIGXFSZ, "SIGXFSZ"),
    (libc::SIGSYS, "SIGSYS"),
];

/// Daemon instance: the command socket server plus the PID lock
pub struct Daemon {
    config: Config,
    server: Arc<IpcServer>,
    listener: UnixListener,
    metrics: Arc<DaemonMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    pid_file_path: PathBuf,
}

impl Daemon {
    /// Take the lock and bind the command socket. Clients can connect as
    /// soon as this returns.
    pub async fn start(config: Config) -> Result<Self> {
        info!("Starting sigmet_raw daemon");

        let dir = &config.daemon.dir;
        create_private_dir(dir)
            .with_context(|| format!("Failed to create daemon directory {}", dir.display()))?;

        let pid_file_path = config.pid_path();
        Self::acquire_lock(&pid_file_path)?;
        install_panic_hook();

        let (shutdown_tx, _) = broadcast::channel(16);
        let metrics = Arc::new(DaemonMetrics::new());
        let state = DaemonState::new(&config.daemon, metrics.clone());
        let server = IpcServer::new(
            config.socket_path(),
            dir.clone(),
            config.daemon.max_args,
            state,
            shutdown_tx.clone(),
        );

        let listener = match server.bind() {
            Ok(listener) => listener,
            Err(e) => {
                let _ = Self::release_lock(&pid_file_path);
                return Err(e);
            }
        };

        info!("Daemon initialized");
        info!("Working directory: {}", dir.display());
        info!("Socket path: {}", server.socket_path().display());

        Ok(Self {
            config,
            server: Arc::new(server),
            listener,
            metrics,
            shutdown_tx,
            pid_file_path,
        })
    }

    /// Handle for requesting shutdown from outside the daemon
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Serve until `stop`, Ctrl+C, SIGTERM or a resource limit signal
    pub async fn run(self) -> Result<()> {
        info!("Daemon running");

        let shutdown_rx = self.shutdown_tx.subscribe();

        let metrics_for_memory = self.metrics.clone();
        let mut shutdown_rx_memory = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(15));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        metrics_for_memory.update_memory_usage();
                    }
                    _ = shutdown_rx_memory.recv() => break,
                }
            }
        });

        let shutdown_rx_server = self.shutdown_tx.subscribe();
        let listener = self.listener;
        let server = self.server.clone();
        let server_shutdown = self.shutdown_tx.clone();
        let server_handle = tokio::spawn(async move {
            match server.run(listener, shutdown_rx_server).await {
                Ok(()) => info!("IPC server shut down cleanly"),
                Err(e) => {
                    error!("IPC server failed: {:#}", e);
                    let _ = server_shutdown.send(());
                }
            }
        });

        let mut fatal = None;
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = Self::wait_for_sigterm() => {
                info!("Received SIGTERM, shutting down");
            }
            name = Self::wait_for_fatal_signal() => {
                error!("Received {}, exiting", name);
                fatal = Some(name);
            }
            _ = Self::wait_for_shutdown(shutdown_rx) => {
                info!("Shutdown requested via IPC");
            }
        }

        let _ = self.shutdown_tx.send(());

        let server_abort = server_handle.abort_handle();
        if tokio::time::timeout(Duration::from_secs(5), server_handle).await.is_err() {
            warn!("IPC server did not shut down within 5s, aborting");
            server_abort.abort();
        }

        Self::shutdown(&self.pid_file_path, self.server.socket_path())?;

        if let Some(name) = fatal {
            anyhow::bail!("Daemon terminated by {}", name);
        }
        Ok(())
    }

    /// Remove the socket and release the lock
    fn shutdown(pid_file_path: &Path, socket_path: &Path) -> Result<()> {
        info!("Shutting down daemon");
        if socket_path.exists() {
            if let Err(e) = std::fs::remove_file(socket_path) {
                warn!("Failed to remove {}: {}", socket_path.display(), e);
            }
        }
        Self::release_lock(pid_file_path)?;
        info!("Daemon shutdown complete");
        Ok(())
    }

    /// Acquire single-instance lock via PID file
    ///
    /// Uses `create_new(true)` for atomic creation so two starting daemons
    /// cannot both pass the existence check.
    fn acquire_lock(pid_file_path: &Path) -> Result<()> {
        use std::fs::OpenOptions;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(pid_file_path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(e).context("Failed to create PID file");
            }
        }

        if let Some(pid) = read_pid(pid_file_path) {
            if process_exists(pid) {
                anyhow::bail!(
                    "Daemon is already running (PID {}). Stop it first or remove {}",
                    pid,
                    pid_file_path.display()
                );
            }
        }

        warn!("Removing stale PID file {}", pid_file_path.display());
        std::fs::remove_file(pid_file_path)?;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(pid_file_path)
        {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(())
            }
            Err(e) => Err(e).context("Failed to create PID file after removing stale lock"),
        }
    }

    fn release_lock(pid_file_path: &Path) -> Result<()> {
        if pid_file_path.exists() {
            std::fs::remove_file(pid_file_path)?;
        }
        Ok(())
    }

    async fn wait_for_sigterm() {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}. Falling back to pending future.", e);
                std::future::pending::<()>().await;
            }
        }
    }

    /// Resolves with the name of the first resource limit signal received
    async fn wait_for_fatal_signal() -> &'static str {
        use tokio::signal::unix::{signal, SignalKind};

        let (tx, mut rx) = tokio::sync::mpsc::channel(FATAL_SIGNALS.len());
        for (signo, name) in FATAL_SIGNALS {
            match signal(SignalKind::from_raw(signo)) {
                Ok(mut stream) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if stream.recv().await.is_some() {
                            let _ = tx.send(name).await;
                        }
                    });
                }
                Err(e) => warn!("Failed to register {} handler: {}", name, e),
            }
        }
        drop(tx);
        match rx.recv().await {
            Some(name) => name,
            None => std::future::pending().await,
        }
    }

    async fn wait_for_shutdown(mut rx: broadcast::Receiver<()>) {
        let _ = rx.recv().await;
    }
}

fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

/// Log panics through tracing before the default hook prints them
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        error!("Daemon panicked: {}", info);
        default_hook(info);
    }));
}

fn read_pid(pid_file_path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(pid_file_path)
        .ok()?
        .read_to_string(&mut contents)
        .ok()?;
    contents.trim().parse().ok()
}

/// `kill(pid, 0)` succeeds for live processes
fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Check if a daemon holds the lock in `dir`
pub fn is_daemon_running(dir: &Path) -> bool {
    get_daemon_pid(dir).is_some()
}

/// Get the PID of the running daemon, if any
pub fn get_daemon_pid(dir: &Path) -> Option<u32> {
    read_pid(&dir.join(PID_FILE_NAME)).filter(|&pid| process_exists(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pid_lock_acquire_release() {
        let temp_dir = TempDir::new().unwrap();
        let pid_path = temp_dir.path().join(PID_FILE_NAME);

        Daemon::acquire_lock(&pid_path).unwrap();
        assert!(pid_path.exists());
        assert_eq!(get_daemon_pid(temp_dir.path()), Some(std::process::id()));
        assert!(Daemon::acquire_lock(&pid_path).is_err());

        Daemon::release_lock(&pid_path).unwrap();
        assert!(!pid_path.exists());
        assert!(!is_daemon_running(temp_dir.path()));
    }

    #[test]
    fn test_stale_lock_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let pid_path = temp_dir.path().join(PID_FILE_NAME);
        // Larger than any pid_max
        std::fs::write(&pid_path, "4194399\n").unwrap();
        assert!(!is_daemon_running(temp_dir.path()));

        Daemon::acquire_lock(&pid_path).unwrap();
        assert_eq!(read_pid(&pid_path), Some(std::process::id()));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("rawd");
        let daemon = Daemon::start(Config::with_dir(&dir)).await.unwrap();
        let socket = daemon.config().socket_path();
        assert!(socket.exists());
        assert!(is_daemon_running(&dir));

        let stop = daemon.shutdown_sender();
        let run = tokio::spawn(daemon.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.send(()).unwrap();
        run.await.unwrap().unwrap();

        assert!(!socket.exists());
        assert!(!dir.join(PID_FILE_NAME).exists());
    }
}
