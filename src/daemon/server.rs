//! IPC Server
//!
//! Unix domain socket server for the command channel. Connections are
//! accepted concurrently, but sessions run one at a time: each holds the
//! daemon state until its status has been produced.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::handler::{CommandRegistry, DaemonState};
use super::metrics::{DaemonMetrics, Timer};
use super::protocol::{read_request, write_status, Request};
use super::session::Session;

struct ServerContext {
    dir: PathBuf,
    max_args: usize,
    state: Mutex<DaemonState>,
    /// Current session budget in milliseconds, readable without the state lock
    budget_ms: AtomicU64,
    registry: CommandRegistry,
    metrics: Arc<DaemonMetrics>,
    /// Serializes sessions so a budget only runs while its session does
    session_gate: tokio::sync::Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Outcome of one completed session
struct Completed {
    status: i32,
    stop: bool,
}

/// IPC server listening on a Unix domain socket
pub struct IpcServer {
    socket_path: PathBuf,
    ctx: Arc<ServerContext>,
}

impl IpcServer {
    /// `dir` is where client output sockets live
    pub fn new(
        socket_path: PathBuf,
        dir: PathBuf,
        max_args: usize,
        state: DaemonState,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let metrics = state.metrics.clone();
        let budget_ms = AtomicU64::new(millis(state.timeout.budget()));
        Self {
            socket_path,
            ctx: Arc::new(ServerContext {
                dir,
                max_args,
                state: Mutex::new(state),
                budget_ms,
                registry: CommandRegistry::new(),
                metrics,
                session_gate: tokio::sync::Mutex::new(()),
                shutdown_tx,
            }),
        }
    }

    /// Bind the command socket, replacing a leftover socket file
    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .context("Failed to bind to Unix socket")?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o660))?;
        }

        info!("IPC server listening on: {}", self.socket_path.display());
        Ok(listener)
    }

    /// Accept connections on `listener` until shutdown is broadcast
    pub async fn run(&self, listener: UnixListener, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            debug!("New client connection");
                            let ctx = self.ctx.clone();
                            tokio::spawn(async move {
                                ctx.metrics.connections_total.inc();
                                ctx.metrics.active_connections.inc();
                                if let Err(e) = handle_connection(stream, &ctx).await {
                                    warn!("Connection error: {:#}", e);
                                }
                                ctx.metrics.active_connections.dec();
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }

        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Serve requests on one command connection until the client closes it,
/// sends garbage, or stays idle for a whole session budget.
async fn handle_connection(mut stream: UnixStream, ctx: &Arc<ServerContext>) -> Result<()> {
    loop {
        let idle = Duration::from_millis(ctx.budget_ms.load(Ordering::Relaxed));
        let request = match tokio::time::timeout(idle, read_request(&mut stream, ctx.max_args)).await {
            Err(_) => {
                debug!("Closing connection idle for {:?}", idle);
                return Ok(());
            }
            Ok(Ok(None)) => {
                debug!("Client disconnected");
                return Ok(());
            }
            Ok(Ok(Some(request))) => request,
            Ok(Err(e)) => {
                ctx.metrics.sessions_dropped.inc();
                warn!("Dropping malformed request: {}", e);
                return Ok(());
            }
        };

        let Some(done) = run_session(ctx, request).await else {
            return Ok(());
        };

        write_status(&mut stream, done.status)
            .await
            .context("Failed to send session status")?;

        if done.stop {
            info!("Stopping at client request");
            let _ = ctx.shutdown_tx.send(());
            return Ok(());
        }
    }
}

/// Run one session under the timeout supervisor. `None` if the session had
/// to be dropped without a status.
async fn run_session(ctx: &Arc<ServerContext>, request: Request) -> Option<Completed> {
    let _gate = ctx.session_gate.lock().await;
    let pid = request.pid;
    let budget = ctx.state.lock().timeout.budget();
    ctx.metrics.sessions_total.inc();
    let timer = Timer::start();

    let work_ctx = ctx.clone();
    let mut task = tokio::task::spawn_blocking(move || -> std::io::Result<Completed> {
        let mut session = Session::connect(request, &work_ctx.dir, budget)?;
        let mut state = work_ctx.state.lock();
        let status = work_ctx.registry.dispatch(&mut state, &mut session);
        let stop = state.stop_requested;
        drop(state);
        if let Err(e) = session.finish() {
            warn!("Could not flush output for pid {}: {}", pid, e);
        }
        Ok(Completed { status, stop })
    });

    let (joined, timed_out) = match tokio::time::timeout(budget, &mut task).await {
        Ok(joined) => (joined, false),
        Err(_) => {
            warn!("Session for pid {} exceeded {:?}, terminating client", pid, budget);
            terminate_client(pid);
            (task.await, true)
        }
    };

    let elapsed = timer.record(&ctx.metrics.session_latency);
    {
        let mut state = ctx.state.lock();
        if timed_out {
            ctx.metrics.sessions_timed_out.inc();
            state.timeout.on_timeout();
        } else {
            state.timeout.record(elapsed);
        }
        ctx.budget_ms.store(millis(state.timeout.budget()), Ordering::Relaxed);
    }

    match joined {
        Ok(Ok(done)) => {
            if done.status != 0 {
                ctx.metrics.sessions_failed.inc();
            }
            debug!("Session for pid {} finished with {} in {:?}", pid, done.status, elapsed);
            Some(done)
        }
        Ok(Err(e)) => {
            ctx.metrics.sessions_dropped.inc();
            warn!("Dropping session for pid {}: could not reach its output sockets: {}", pid, e);
            None
        }
        Err(e) => {
            ctx.metrics.sessions_failed.inc();
            error!("Session for pid {} panicked: {}", pid, e);
            None
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Ask a client that overran its budget to terminate
fn terminate_client(pid: i32) {
    if pid <= 0 {
        return;
    }
    // SAFETY: kill has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        debug!("Could not signal pid {}: {}", pid, std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::daemon::protocol::{encode_request, output_paths, read_status};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn server(dir: &Path) -> (IpcServer, broadcast::Sender<()>) {
        let mut config = DaemonConfig::default();
        config.dir = dir.to_path_buf();
        let (tx, _) = broadcast::channel(1);
        let state = DaemonState::new(&config, Arc::new(DaemonMetrics::new()));
        let server = IpcServer::new(dir.join("sigmet.in"), dir.to_path_buf(), 8, state, tx.clone());
        (server, tx)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let dir = TempDir::new().unwrap();
        let (server, tx) = server(dir.path());
        let socket = server.socket_path().to_path_buf();
        let listener = server.bind().unwrap();
        let rx = tx.subscribe();
        let handle = tokio::spawn(async move { server.run(listener, rx).await });

        let pid = 424242;
        let (out_path, err_path) = output_paths(dir.path(), pid);
        let out_listener = UnixListener::bind(&out_path).unwrap();
        let err_listener = UnixListener::bind(&err_path).unwrap();

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        let request = Request::new(pid, dir.path(), vec!["timeout".into()]);
        stream.write_all(&encode_request(&request)).await.unwrap();

        let (mut out, _) = out_listener.accept().await.unwrap();
        let (mut err, _) = err_listener.accept().await.unwrap();
        let mut text = String::new();
        out.read_to_string(&mut text).await.unwrap();
        let mut err_text = String::new();
        err.read_to_string(&mut err_text).await.unwrap();
        assert_eq!(read_status(&mut stream).await.unwrap(), 0);
        assert_eq!(text.trim(), "30");
        assert!(err_text.is_empty());

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn test_malformed_request_closes_connection() {
        let dir = TempDir::new().unwrap();
        let (server, tx) = server(dir.path());
        let socket = server.socket_path().to_path_buf();
        let listener = server.bind().unwrap();
        let rx = tx.subscribe();
        let handle = tokio::spawn(async move { server.run(listener, rx).await });

        let mut stream = UnixStream::connect(&socket).await.unwrap();
        let args: Vec<String> = (0..20).map(|i| i.to_string()).collect();
        let request = Request::new(1, "/", args);
        stream.write_all(&encode_request(&request)).await.unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_terminate_ignores_invalid_pids() {
        terminate_client(0);
        terminate_client(-5);
    }
}
