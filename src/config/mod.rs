//! Configuration for sigmet_raw

mod daemon;
mod logging;

pub use daemon::{default_dir, DaemonConfig, DIR_ENV};
pub use logging::{LogFormat, LogLevel, LoggingConfig};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::daemon::protocol::SOCKET_NAME;

/// Name of the single-instance lock in the daemon directory
pub const PID_FILE_NAME: &str = "sigmet_rawd.pid";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration fields, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();
        let d = &self.daemon;

        if d.dir.as_os_str().is_empty() {
            errors.push("daemon dir must not be empty".to_string());
        }
        if d.cache_slots == 0 {
            errors.push("cache_slots must be positive".to_string());
        }
        if d.min_timeout_secs == 0 {
            errors.push("min_timeout_secs must be positive".to_string());
        }
        if d.min_timeout_secs > d.max_timeout_secs {
            errors.push(format!(
                "min_timeout_secs ({}) must not exceed max_timeout_secs ({})",
                d.min_timeout_secs, d.max_timeout_secs
            ));
        }
        if d.session_timeout_secs < d.min_timeout_secs || d.session_timeout_secs > d.max_timeout_secs {
            errors.push(format!(
                "session_timeout_secs ({}) must be between {} and {}",
                d.session_timeout_secs, d.min_timeout_secs, d.max_timeout_secs
            ));
        }
        if d.max_args == 0 {
            errors.push("max_args must be positive".to_string());
        }
        if d.max_args > i32::MAX as usize {
            errors.push(format!("max_args must be <= {}", i32::MAX));
        }
        if d.sample_window == 0 {
            errors.push("sample_window must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon.dir.join(SOCKET_NAME)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.daemon.dir.join(PID_FILE_NAME)
    }

    /// Configuration rooted at `dir`, everything else default
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.daemon.dir = dir.into();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_passes_validation() {
        let config = Config::with_dir("/tmp/sigmet");
        assert!(config.validate().is_ok());
        assert_eq!(config.daemon.cache_slots, 32);
        assert_eq!(config.daemon.max_args, 512);
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/sigmet/sigmet.in"));
        assert_eq!(config.pid_path(), PathBuf::from("/tmp/sigmet/sigmet_rawd.pid"));
    }

    #[test]
    fn validate_rejects_zero_cache_slots() {
        let mut config = Config::with_dir("/tmp/sigmet");
        config.daemon.cache_slots = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("cache_slots"));
    }

    #[test]
    fn validate_rejects_inverted_timeout_bounds() {
        let mut config = Config::with_dir("/tmp/sigmet");
        config.daemon.min_timeout_secs = 100;
        config.daemon.max_timeout_secs = 10;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("min_timeout_secs"));
    }

    #[test]
    fn validate_collects_multiple_errors() {
        let mut config = Config::with_dir("");
        config.daemon.max_args = 0;
        config.daemon.sample_window = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("dir must not be empty"));
        assert!(err.contains("max_args"));
        assert!(err.contains("sample_window"));
    }

    #[test]
    fn load_partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[daemon]\ndir = \"/var/tmp/radar\"\ncache_slots = 4\n\n[logging]\nformat = \"json\"\nlevel = \"debug\""
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.daemon.dir, PathBuf::from("/var/tmp/radar"));
        assert_eq!(config.daemon.cache_slots, 4);
        assert_eq!(config.daemon.session_timeout_secs, 30);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[daemon]\ndir = \"/tmp/x\"\nsample_window = 0").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn verbosity_raises_level() {
        assert_eq!(LogLevel::Info.raised_by(0), LogLevel::Info);
        assert_eq!(LogLevel::Info.raised_by(1), LogLevel::Debug);
        assert_eq!(LogLevel::Warn.raised_by(9), LogLevel::Trace);
    }
}
