//! Client Connection
//!
//! Handles the Unix socket connection to the daemon and the per-session
//! output sockets.

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::daemon::protocol::{encode_request, output_paths, read_status, Request, SOCKET_NAME};

use super::ClientError;

/// Client connection to the daemon
pub struct DaemonClient {
    stream: UnixStream,
    dir: PathBuf,
}

/// Listening output sockets for one session. Unlinked on drop.
struct OutputSockets {
    out: UnixListener,
    err: UnixListener,
    paths: (PathBuf, PathBuf),
}

impl OutputSockets {
    fn bind(dir: &Path, pid: i32) -> io::Result<Self> {
        let paths = output_paths(dir, pid);
        for path in [&paths.0, &paths.1] {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed leftover socket {}", path.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        let out = UnixListener::bind(&paths.0)?;
        let err = UnixListener::bind(&paths.1)?;
        Ok(Self { out, err, paths })
    }

    /// Accept the daemon's connections and copy both streams until the
    /// daemon closes them
    async fn forward<O, E>(&self, out: &mut O, err: &mut E) -> io::Result<()>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let ((mut out_stream, _), (mut err_stream, _)) =
            tokio::try_join!(self.out.accept(), self.err.accept())?;
        tokio::try_join!(
            tokio::io::copy(&mut out_stream, out),
            tokio::io::copy(&mut err_stream, err)
        )?;
        out.flush().await?;
        err.flush().await
    }
}

impl Drop for OutputSockets {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.paths.0);
        let _ = std::fs::remove_file(&self.paths.1);
    }
}

impl DaemonClient {
    /// Connect to the daemon working in `dir`
    pub async fn connect(dir: &Path) -> Result<Self, ClientError> {
        Self::connect_to(dir.join(SOCKET_NAME), dir.to_path_buf()).await
    }

    /// Connect to the daemon at a specific socket path. Output sockets go
    /// in `dir`.
    pub async fn connect_to(socket_path: PathBuf, dir: PathBuf) -> Result<Self, ClientError> {
        debug!("Connecting to daemon at: {}", socket_path.display());

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound
                    || e.kind() == io::ErrorKind::ConnectionRefused
                {
                    ClientError::DaemonNotRunning
                } else {
                    ClientError::ConnectionFailed(e.to_string())
                }
            })?;

        debug!("Connected to daemon");
        Ok(Self { stream, dir })
    }

    /// Run `args` as this process, from the current working directory
    pub async fn run<O, E>(&mut self, args: Vec<String>, out: &mut O, err: &mut E) -> Result<i32, ClientError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let cwd = std::env::current_dir()
            .map_err(|e| ClientError::RequestFailed(format!("Failed to get working directory: {}", e)))?;
        let pid = i32::try_from(std::process::id())
            .map_err(|_| ClientError::RequestFailed("Process id out of range".to_string()))?;
        self.send(Request::new(pid, cwd, args), out, err).await
    }

    /// Send a request, copy the session's output into `out` and `err`, and
    /// return the command's exit status
    pub async fn send<O, E>(&mut self, request: Request, out: &mut O, err: &mut E) -> Result<i32, ClientError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let sockets = OutputSockets::bind(&self.dir, request.pid)
            .map_err(|e| ClientError::ConnectionFailed(format!("Failed to create output sockets: {}", e)))?;

        self.stream
            .write_all(&encode_request(&request))
            .await
            .map_err(|e| ClientError::RequestFailed(format!("Failed to send request: {}", e)))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ClientError::RequestFailed(format!("Failed to flush: {}", e)))?;

        let forward = sockets.forward(out, err);
        let status = read_status(&mut self.stream);
        tokio::pin!(forward, status);

        let output_failed = |e: io::Error| ClientError::RequestFailed(format!("Failed to read output: {}", e));
        let status = tokio::select! {
            forwarded = &mut forward => {
                forwarded.map_err(output_failed)?;
                status.await
            }
            received = &mut status => {
                if received.is_ok() {
                    forward.await.map_err(output_failed)?;
                }
                received
            }
        };

        status.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ClientError::UnexpectedResponse
            } else {
                ClientError::RequestFailed(format!("Failed to read status: {}", e))
            }
        })
    }
}
