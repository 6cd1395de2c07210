//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the daemon working directory
pub const DIR_ENV: &str = "SIGMET_RAWD_DIR";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Working directory holding the command socket, PID file and session sockets
    pub dir: PathBuf,
    /// Number of volumes the cache can hold
    pub cache_slots: usize,
    /// Initial session budget in seconds
    pub session_timeout_secs: u64,
    pub min_timeout_secs: u64,
    pub max_timeout_secs: u64,
    /// Requests with more arguments are dropped
    pub max_args: usize,
    /// Sessions timed per adaptive sample
    pub sample_window: usize,
}

/// `$SIGMET_RAWD_DIR`, else `~/.sigmet_raw`
pub fn default_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    directories::BaseDirs::new()
        .map(|d| d.home_dir().join(".sigmet_raw"))
        .unwrap_or_else(|| PathBuf::from(".sigmet_raw"))
}

impl DaemonConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn min_timeout(&self) -> Duration {
        Duration::from_secs(self.min_timeout_secs)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_timeout_secs)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            cache_slots: 32,
            session_timeout_secs: 30,
            min_timeout_secs: 1,
            max_timeout_secs: 3600,
            max_args: 512,
            sample_window: 8,
        }
    }
}
