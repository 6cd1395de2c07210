//! Decompression Supervisor
//!
//! Opens a volume file as a byte stream. Compressed files are piped through
//! an external decompressor whose process is killed and reaped when the
//! stream is dropped, whatever the reason.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, Stdio};

use tracing::{debug, warn};

/// Decompressor command for a file name suffix
fn decompressor(path: &Path) -> Option<(&'static str, &'static [&'static str])> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("gz") | Some("Z") => Some(("gunzip", &["-c"])),
        Some("bz2") => Some(("bunzip2", &["-c"])),
        _ => None,
    }
}

/// A running child process read through its standard output
pub struct Subprocess {
    child: Child,
    stdout: ChildStdout,
    program: &'static str,
}

impl Subprocess {
    /// Start `program args.. path` with standard output piped back.
    ///
    /// Standard library pipes and files are opened close-on-exec, so none of
    /// the daemon's descriptors reach the child besides its three standard
    /// streams.
    pub fn spawn(program: &'static str, args: &[&str], path: &Path) -> io::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(io::ErrorKind::Other, "child has no stdout pipe"));
            }
        };
        debug!("Started {} (pid {}) for {}", program, child.id(), path.display());
        Ok(Self {
            child,
            stdout,
            program,
        })
    }
}

impl Read for Subprocess {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stdout.read(buf)
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        // kill fails harmlessly if the child already exited
        let _ = self.child.kill();
        match self.child.wait() {
            Ok(status) => debug!("{} (pid {}) finished: {}", self.program, self.child.id(), status),
            Err(e) => warn!("Failed to reap {} (pid {}): {}", self.program, self.child.id(), e),
        }
    }
}

/// Byte stream of a volume file, decompressed if needed
pub enum VolumeSource {
    File(BufReader<File>),
    Pipe(Subprocess),
}

impl VolumeSource {
    /// Open `path`, starting a decompressor for `.gz`, `.Z` and `.bz2` files
    pub fn open(path: &Path) -> io::Result<Self> {
        match decompressor(path) {
            Some((program, args)) => {
                // Surface a missing file as NotFound instead of an empty pipe
                File::open(path)?;
                Ok(Self::Pipe(Subprocess::spawn(program, args, path)?))
            }
            None => Ok(Self::File(BufReader::new(File::open(path)?))),
        }
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, Self::Pipe(_))
    }
}

impl Read for VolumeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::File(f) => f.read(buf),
            Self::Pipe(p) => p.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn have(program: &str) -> bool {
        Command::new(program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    }

    #[test]
    fn plain_files_are_read_directly() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.raw");
        std::fs::write(&path, b"raw bytes").unwrap();

        let mut src = VolumeSource::open(&path).unwrap();
        assert!(!src.is_pipe());
        let mut out = Vec::new();
        src.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"raw bytes");
    }

    #[test]
    fn missing_compressed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = VolumeSource::open(&dir.path().join("nope.gz")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn gzip_files_are_piped_through_gunzip() {
        if !have("gzip") || !have("gunzip") {
            return;
        }
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vol.raw");
        std::fs::write(&path, vec![7u8; 10_000]).unwrap();
        let status = Command::new("gzip").arg(&path).status().unwrap();
        assert!(status.success());

        let mut src = VolumeSource::open(&dir.path().join("vol.raw.gz")).unwrap();
        assert!(src.is_pipe());
        let mut out = Vec::new();
        src.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![7u8; 10_000]);
    }

    #[test]
    fn abandoned_pipe_kills_child() {
        if !have("gunzip") {
            return;
        }
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.gz");
        let mut f = File::create(&path).unwrap();
        f.write_all(b"not really gzip").unwrap();
        drop(f);

        let src = VolumeSource::open(&path).unwrap();
        // Dropping without reading must not hang or leak the child
        drop(src);
    }
}
