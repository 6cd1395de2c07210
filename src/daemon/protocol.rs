//! IPC Protocol
//!
//! Wire format of the command connection. All integers are little-endian.
//!
//! ```text
//! request   pid:i32  cwd_len:u64  cwd  argc:i32  args_len:u64  args
//! response  status:i32
//! ```
//!
//! `args` holds `argc` arguments, each terminated by a NUL byte. Command
//! output does not travel on this connection; it goes to the per-session
//! sockets `<dir>/<pid>.1` (standard) and `<dir>/<pid>.2` (error).

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Cap on the variable-length parts of a request
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Name of the command socket in the daemon directory
pub const SOCKET_NAME: &str = "sigmet.in";

/// Status returned for commands the daemon does not know
pub const STATUS_UNKNOWN_COMMAND: i32 = 1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Argument count {argc} exceeds limit {max}")]
    TooManyArgs { argc: i64, max: usize },

    #[error("Negative {0} in request")]
    Negative(&'static str),

    #[error("{what} of {len} bytes exceeds limit")]
    TooLarge { what: &'static str, len: u64 },

    #[error("Argument line is not NUL terminated")]
    Unterminated,

    #[error("Request declares {declared} arguments but carries {found}")]
    ArgCount { declared: usize, found: usize },

    #[error("Request is not valid UTF-8")]
    Encoding,
}

/// One command sent by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub pid: i32,
    pub cwd: PathBuf,
    pub args: Vec<String>,
}

impl Request {
    pub fn new(pid: i32, cwd: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            pid,
            cwd: cwd.into(),
            args,
        }
    }
}

/// Standard and error output socket paths for a client process
pub fn output_paths(dir: &Path, pid: i32) -> (PathBuf, PathBuf) {
    (dir.join(format!("{}.1", pid)), dir.join(format!("{}.2", pid)))
}

/// Serialize a request frame
pub fn encode_request(request: &Request) -> Vec<u8> {
    let cwd = request.cwd.to_string_lossy();
    let args_len: usize = request.args.iter().map(|a| a.len() + 1).sum();
    let mut buf = Vec::with_capacity(4 + 8 + cwd.len() + 4 + 8 + args_len);

    buf.extend_from_slice(&request.pid.to_le_bytes());
    buf.extend_from_slice(&(cwd.len() as u64).to_le_bytes());
    buf.extend_from_slice(cwd.as_bytes());
    buf.extend_from_slice(&(request.args.len() as i32).to_le_bytes());
    buf.extend_from_slice(&(args_len as u64).to_le_bytes());
    for arg in &request.args {
        buf.extend_from_slice(arg.as_bytes());
        buf.push(0);
    }
    buf
}

async fn read_len<R: AsyncRead + Unpin>(r: &mut R, what: &'static str) -> Result<usize, ProtocolError> {
    let len = r.read_u64_le().await?;
    if len > MAX_MESSAGE_SIZE as u64 {
        return Err(ProtocolError::TooLarge { what, len });
    }
    Ok(len as usize)
}

/// Read one request frame.
///
/// Returns `Ok(None)` if the peer closed the connection before the first
/// byte of a frame.
pub async fn read_request<R: AsyncRead + Unpin>(
    r: &mut R,
    max_args: usize,
) -> Result<Option<Request>, ProtocolError> {
    let pid = match r.read_i32_le().await {
        Ok(pid) => pid,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let cwd_len = read_len(r, "working directory").await?;
    let mut cwd = vec![0u8; cwd_len];
    r.read_exact(&mut cwd).await?;
    let cwd = String::from_utf8(cwd).map_err(|_| ProtocolError::Encoding)?;

    let argc = r.read_i32_le().await?;
    let argc = usize::try_from(argc).map_err(|_| ProtocolError::Negative("argument count"))?;
    if argc > max_args {
        return Err(ProtocolError::TooManyArgs {
            argc: argc as i64,
            max: max_args,
        });
    }

    let args_len = read_len(r, "argument line").await?;
    let mut line = vec![0u8; args_len];
    r.read_exact(&mut line).await?;

    Ok(Some(Request {
        pid,
        cwd: PathBuf::from(cwd),
        args: split_args(&line, argc)?,
    }))
}

/// Split a NUL-terminated argument line
fn split_args(line: &[u8], argc: usize) -> Result<Vec<String>, ProtocolError> {
    if argc == 0 && line.is_empty() {
        return Ok(Vec::new());
    }
    let body = line.strip_suffix(&[0]).ok_or(ProtocolError::Unterminated)?;
    let args = body
        .split(|&b| b == 0)
        .map(|a| String::from_utf8(a.to_vec()).map_err(|_| ProtocolError::Encoding))
        .collect::<Result<Vec<_>, _>>()?;
    if args.len() != argc {
        return Err(ProtocolError::ArgCount {
            declared: argc,
            found: args.len(),
        });
    }
    Ok(args)
}

pub async fn write_status<W: AsyncWrite + Unpin>(w: &mut W, status: i32) -> std::io::Result<()> {
    w.write_i32_le(status).await?;
    w.flush().await
}

pub async fn read_status<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<i32> {
    r.read_i32_le().await
}
