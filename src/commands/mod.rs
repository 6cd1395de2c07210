//! CLI command implementations

pub mod daemon;
pub mod launch;

pub use daemon::handle_daemon;
pub use launch::{forward, run_with_daemon};
