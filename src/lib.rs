//! sigmet_raw: Sigmet/IRIS raw product volumes
//!
//! - Decoding of raw product files into sweeps, rays and per-type bin values
//! - A daemon that caches decoded volumes and answers queries over a Unix socket
//! - Transparent reading of gzip, compress and bzip2 inputs through external tools
//! - A client for the daemon's session protocol

pub mod client;
pub mod config;
pub mod daemon;
pub mod volume;

pub use config::Config;
pub use volume::{DataType, Volume, VolumeError};
