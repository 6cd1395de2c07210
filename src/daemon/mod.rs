//! Daemon Module
//!
//! A long-lived process that keeps decoded volumes in memory and serves
//! commands from short-lived clients.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     sigmet_raw daemon                         │
//! │                                                               │
//! │  <dir>/sigmet.in ──▶ IpcServer ──▶ CommandRegistry            │
//! │                          │               │                    │
//! │                   TimeoutPolicy     DaemonState               │
//! │                                     ┌─────────────┐           │
//! │                                     │ VolumeCache │◀── gunzip │
//! │                                     └─────────────┘   bunzip2 │
//! │                                                               │
//! │  output ──▶ <dir>/<pid>.1 (standard)  <dir>/<pid>.2 (error)   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! sigmet_raw daemon start
//! sigmet_raw read vol.raw
//! sigmet_raw data DB_DBZ 0 vol.raw
//! sigmet_raw daemon stop
//! ```

pub mod cache;
pub mod handler;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod subprocess;
pub mod timeout;

pub use cache::{CacheError, VolumeCache};
pub use handler::{CommandRegistry, DaemonState};
pub use lifecycle::{get_daemon_pid, is_daemon_running, Daemon};
pub use metrics::{DaemonMetrics, MetricsSnapshot, Timer};
pub use protocol::Request;
pub use server::IpcServer;
pub use session::Session;
pub use timeout::TimeoutPolicy;
