//! Session I/O
//!
//! A session is one client command: the request, a deadline, and the two
//! output channels the handler writes to. Output channels are Unix sockets
//! the client listens on; the daemon connects to them when the session
//! starts and closes them when it ends.

use std::io::{self, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use super::protocol::{output_paths, Request};

/// Shortest write timeout applied to output sockets
const MIN_WRITE_TIMEOUT: Duration = Duration::from_millis(1);

pub struct Session {
    pub pid: i32,
    pub cwd: PathBuf,
    pub args: Vec<String>,
    deadline: Instant,
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
}

fn connect_output(path: &Path, deadline: Instant) -> io::Result<BufWriter<UnixStream>> {
    let stream = UnixStream::connect(path)?;
    let remaining = deadline.saturating_duration_since(Instant::now());
    stream.set_write_timeout(Some(remaining.max(MIN_WRITE_TIMEOUT)))?;
    Ok(BufWriter::new(stream))
}

impl Session {
    /// Connect to the output sockets of the client that sent `request`
    pub fn connect(request: Request, dir: &Path, budget: Duration) -> io::Result<Self> {
        let deadline = Instant::now() + budget;
        let (out_path, err_path) = output_paths(dir, request.pid);
        let out = connect_output(&out_path, deadline)?;
        let err = connect_output(&err_path, deadline)?;
        debug!("Session for pid {} connected to output sockets", request.pid);
        Ok(Self::with_writers(request, deadline, Box::new(out), Box::new(err)))
    }

    /// Session writing to arbitrary sinks
    pub fn with_writers(
        request: Request,
        deadline: Instant,
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            pid: request.pid,
            cwd: request.cwd,
            args: request.args,
            deadline,
            out,
            err,
        }
    }

    pub fn out(&mut self) -> &mut dyn Write {
        &mut *self.out
    }

    pub fn err(&mut self) -> &mut dyn Write {
        &mut *self.err
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Interpret `path` relative to the client's working directory
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.cwd.join(p)
        }
    }

    /// Flush and close both output channels
    pub fn finish(mut self) -> io::Result<()> {
        let out = self.out.flush();
        let err = self.err.flush();
        out.and(err)
    }
}
