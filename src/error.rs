//! Error types for pagelog.
//!
//! Every storage failure is fatal for the logger that hit it: nothing here is
//! retried, and there is no degraded mode that silently drops records.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for pagelog operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A backing file could not be created or opened.
    #[error("failed to open backing file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A backing file could not be extended to hold the next page.
    #[error("failed to grow {path} to {len} bytes: {source}")]
    Grow {
        path: PathBuf,
        len: u64,
        #[source]
        source: io::Error,
    },

    /// A page could not be mapped into memory.
    #[error("failed to map page {index} of {path}: {source}")]
    Map {
        path: PathBuf,
        index: u64,
        #[source]
        source: io::Error,
    },

    /// A named shared-memory segment could not be created, opened or mapped.
    #[error("shared segment {name}: {source}")]
    Segment {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Mapped bytes could not be scheduled for write-back.
    #[error("failed to flush {path}: {source}")]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A single append is bigger than a whole page and can never fit.
    #[error("record of {size} bytes does not fit in a {capacity} byte page")]
    RecordTooLarge { size: u64, capacity: u64 },

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The background pre-warm worker could not be started or failed.
    #[error("page pre-warm failed: {0}")]
    Prewarm(String),

    /// A log file could not be opened or mapped for decoding.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
