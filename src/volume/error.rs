//! Volume decode errors

use thiserror::Error;

/// Errors raised while decoding or querying a raw product volume
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sigmet volume has bad magic number (should be 27, found {found})")]
    BadMagicNumber { found: i16 },

    #[error("Could not read record {record} of Sigmet volume")]
    MissingHeader { record: usize },

    #[error("Raw product file records out of sequence: expected {expected}, found {found}")]
    RecordOutOfSequence { expected: i32, found: i32 },

    #[error("Garbled sweep time in sweep {sweep}")]
    GarbledSweepTime { sweep: usize },

    #[error("Could not allocate storage for volume ({what})")]
    AllocFailure { what: &'static str },

    #[error("No data type named {0}")]
    UnknownDataType(String),

    #[error("{what} index {index} out of range (count {count})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        count: usize,
    },

    #[error("Read of {len} bytes at offset {offset} overruns {size} byte buffer")]
    Overrun {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("Malformed volume: {0}")]
    Malformed(String),

    #[error("Session deadline passed while decoding volume")]
    DeadlineExceeded,
}

pub type Result<T> = std::result::Result<T, VolumeError>;
