//! # pagelog
//!
//! A low-latency structured binary logger that writes straight into
//! memory-mapped pages:
//!
//! * **No formatting on the hot path**: every argument becomes a fixed-size
//!   16-byte tagged value; rendering happens later, in a reader.
//! * **No locks on the hot path**: writers share one active page and claim
//!   space with a single atomic reservation. Only the writer that finds the
//!   page full takes the rotation lock.
//! * **No copies of literals**: short string literals ride inline in the
//!   value, long ones are stored as their FNV-1 hash. Runtime strings go to
//!   a second page sequence and are referenced by offset.
//!
//! ## Main Components
//!
//! * [`Logger`]: level gate plus record and string page sequences
//! * [`PageSequencer`]: rotates through the pages of a growing backing file
//! * [`SharedLogger`]: the same over pages shared between processes
//! * [`LogReader`]: decodes a log, resolving interned strings and, with a
//!   [`SymbolTable`], hashed literals
//!
//! ## Quick Start
//!
//! ```
//! use pagelog::{info, warn, LogConfig, LogReader, Logger};
//!
//! # fn main() -> pagelog::Result<()> {
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("app.binlog");
//! let logger = Logger::open(LogConfig::new(&path))?;
//!
//! let peer = String::from("10.0.0.7");
//! info!(logger, "accepted", peer, 443u16)?;
//! warn!(logger, "queue depth above threshold", 1024usize)?;
//! logger.flush()?;
//!
//! let reader = LogReader::open(&path, logger.config().page_size)?;
//! assert_eq!(reader.count_records(), 2);
//! # Ok(())
//! # }
//! ```

pub mod arg;
pub mod backing;
pub mod clock;
pub mod config;
pub mod error;
pub mod interner;
pub mod interprocess;
pub mod level;
pub mod logger;
pub mod page;
pub mod reader;
pub mod sequencer;
pub mod symbols;

pub use arg::{fnv1_64, Arg, ErrorCode, LiteralArg, ToArg, ARG_SIZE};
pub use config::LogConfig;
pub use error::{Error, Result};
pub use interner::StringInterner;
pub use interprocess::{SharedLogger, SharedSequencer};
pub use level::{Level, LevelFilter};
pub use logger::{Logger, Sink};
pub use page::{MappedPage, Position};
pub use reader::{LogEntry, LogReader, LogValue};
pub use sequencer::{PageSequencer, SequencerOptions};
pub use symbols::SymbolTable;
