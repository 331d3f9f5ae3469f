//! The leveled logging façade.
//!
//! A record is the flat value array
//! `[Timestamp, arg_0, .., arg_n, Terminator]`, written into the active
//! page with a single reservation. The level check in front of it is one
//! relaxed atomic load and a compare; nothing else is touched when a level
//! is disabled.

use std::iter;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::arg::{Arg, ARG_SIZE};
use crate::clock;
use crate::config::LogConfig;
use crate::interner::StringInterner;
use crate::level::{Level, LevelFilter};
use crate::page::Position;
use crate::sequencer::{PageSequencer, SequencerOptions};
use crate::Result;

/// Destination of the logging macros.
///
/// Implemented by [`Logger`] and [`SharedLogger`](crate::SharedLogger), and
/// by references and `Arc`s of any sink, so the macros accept all of them.
pub trait Sink {
    /// Whether records of `level` are currently accepted.
    fn enabled(&self, level: Level) -> bool;

    /// Stores runtime string bytes and returns the reference to log.
    fn intern(&self, bytes: &[u8]) -> Result<Arg>;

    /// Writes one record: a timestamp, `args`, and a terminator.
    fn write_args(&self, args: &[Arg]) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for &S {
    #[inline(always)]
    fn enabled(&self, level: Level) -> bool {
        (**self).enabled(level)
    }

    #[inline(always)]
    fn intern(&self, bytes: &[u8]) -> Result<Arg> {
        (**self).intern(bytes)
    }

    #[inline(always)]
    fn write_args(&self, args: &[Arg]) -> Result<()> {
        (**self).write_args(args)
    }
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    #[inline(always)]
    fn enabled(&self, level: Level) -> bool {
        (**self).enabled(level)
    }

    #[inline(always)]
    fn intern(&self, bytes: &[u8]) -> Result<Arg> {
        (**self).intern(bytes)
    }

    #[inline(always)]
    fn write_args(&self, args: &[Arg]) -> Result<()> {
        (**self).write_args(args)
    }
}

/// Encoded size of a record carrying `args` values.
#[inline(always)]
pub(crate) const fn record_len(args: usize) -> usize {
    (args + 2) * ARG_SIZE
}

/// Encodes `[Timestamp(timestamp), args.., Terminator]` into `dst`, which
/// must be exactly [`record_len`] bytes.
#[inline]
pub(crate) fn encode_record(dst: &mut [u8], timestamp: u64, args: &[Arg]) {
    let values = iter::once(Arg::Timestamp(timestamp))
        .chain(args.iter().copied())
        .chain(iter::once(Arg::Terminator));
    for (slot, value) in dst.chunks_exact_mut(ARG_SIZE).zip(values) {
        slot.copy_from_slice(&value.encode());
    }
}

/// A process-local binary logger over two page sequences: records in the
/// primary file and runtime strings in `<primary>.strings`.
///
/// One active page is shared by every thread; writers never lock unless
/// they are the one rotating a full page.
///
/// # Examples
///
/// ```
/// use pagelog::{info, trace, LevelFilter, LogConfig, Logger};
///
/// # fn main() -> pagelog::Result<()> {
/// let dir = tempfile::tempdir().unwrap();
/// let logger = Logger::open(LogConfig::new(dir.path().join("app.binlog")).with_level(LevelFilter::Info))?;
///
/// let user = String::from("alice");
/// info!(logger, "login", user, 7)?;
/// trace!(logger, "not written")?;
/// # Ok(())
/// # }
/// ```
pub struct Logger {
    config: LogConfig,
    level: AtomicU8,
    records: PageSequencer,
    strings: StringInterner,
}

impl Logger {
    /// Creates (truncating) the record and string files and activates their
    /// first pages.
    pub fn open(config: LogConfig) -> Result<Self> {
        config.validate()?;
        clock::init();

        let options = SequencerOptions {
            grow_pages: config.grow_pages,
            prewarm: config.prewarm,
            populate: config.populate,
        };
        let records = PageSequencer::open(&config.path, config.page_size, options)?;
        let strings = StringInterner::open(config.strings_path(), config.string_page_size, options)?;

        tracing::info!(path = %config.path.display(), level = %config.level, "logger opened");
        Ok(Self {
            level: AtomicU8::new(config.level as u8),
            config,
            records,
            strings,
        })
    }

    #[inline(always)]
    pub fn enabled(&self, level: Level) -> bool {
        level.passes(self.level.load(Ordering::Relaxed))
    }

    /// Current runtime level.
    pub fn level(&self) -> LevelFilter {
        LevelFilter::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Changes the level at runtime. Takes effect for the next call on any
    /// thread; records already past the gate are still written.
    ///
    /// # Examples
    ///
    /// ```
    /// use pagelog::{info, LevelFilter, LogConfig, Logger};
    ///
    /// # fn main() -> pagelog::Result<()> {
    /// let dir = tempfile::tempdir().unwrap();
    /// let logger = Logger::open(LogConfig::new(dir.path().join("app.binlog")))?;
    /// logger.set_level(LevelFilter::Warn);
    /// info!(logger, "dropped")?;
    /// assert_eq!(logger.records().position().offset, 0);
    /// # Ok(())
    /// # }
    /// ```
    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// Writes `args` as one record if `level` is enabled.
    pub fn log(&self, level: Level, args: &[Arg]) -> Result<()> {
        if !self.enabled(level) {
            return Ok(());
        }
        self.write_args(args)
    }

    /// Writes `args` as one record regardless of the level.
    #[inline]
    pub fn write_args(&self, args: &[Arg]) -> Result<()> {
        let timestamp = clock::now();
        self.records
            .append_with(record_len(args.len()), |dst| encode_record(dst, timestamp, args))?;
        Ok(())
    }

    /// Copies `bytes` into the strings file. The returned [`Arg::Interned`]
    /// goes into a record passed to [`write_args`](Self::write_args); the
    /// macros do this for every runtime string argument.
    ///
    /// # Examples
    ///
    /// ```
    /// use pagelog::{Arg, Level, LogConfig, Logger};
    ///
    /// # fn main() -> pagelog::Result<()> {
    /// let dir = tempfile::tempdir().unwrap();
    /// let logger = Logger::open(LogConfig::new(dir.path().join("app.binlog")))?;
    /// let user = logger.intern(b"alice")?;
    /// assert_eq!(user, Arg::Interned { len: 5, offset: 0 });
    /// logger.log(Level::Info, &[Arg::from_literal("login"), user])?;
    /// # Ok(())
    /// # }
    /// ```
    #[inline]
    pub fn intern(&self, bytes: &[u8]) -> Result<Arg> {
        self.strings.intern(bytes)
    }

    /// Configuration the logger was opened with. The level in it is the
    /// initial one; see [`level`](Self::level) for the current value.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Record file.
    pub fn path(&self) -> &Path {
        self.records.path()
    }

    pub fn strings_path(&self) -> &Path {
        self.strings.path()
    }

    /// Page sequence holding the records.
    pub fn records(&self) -> &PageSequencer {
        &self.records
    }

    /// Interner behind the strings file.
    pub fn strings(&self) -> &StringInterner {
        &self.strings
    }

    /// Positions of the record and string sequences.
    pub fn positions(&self) -> (Position, Position) {
        (self.records.position(), self.strings.position())
    }

    /// Schedules write-back of both active pages.
    pub fn flush(&self) -> Result<()> {
        self.records.flush()?;
        self.strings.flush()
    }
}

impl Sink for Logger {
    #[inline(always)]
    fn enabled(&self, level: Level) -> bool {
        Logger::enabled(self, level)
    }

    #[inline(always)]
    fn intern(&self, bytes: &[u8]) -> Result<Arg> {
        Logger::intern(self, bytes)
    }

    #[inline(always)]
    fn write_args(&self, args: &[Arg]) -> Result<()> {
        Logger::write_args(self, args)
    }
}

/// Logs a record at `level` to any [`Sink`].
///
/// String literals are inlined or hashed at the call site; runtime strings
/// are interned; other values are copied. Arguments are only evaluated when
/// the level is enabled. Evaluates to `pagelog::Result<()>`.
///
/// ```
/// # use pagelog::{emit, Level, LogConfig, Logger};
/// # let dir = tempfile::tempdir().unwrap();
/// # let logger = Logger::open(LogConfig::new(dir.path().join("log"))).unwrap();
/// emit!(logger, Level::Warn, "disk usage", 93u8, 0.93f32).unwrap();
/// ```
#[macro_export]
macro_rules! emit {
    ($sink:expr, $level:expr $(, $($arg:tt)*)?) => {{
        #[allow(unused_imports)]
        use $crate::Sink as _;
        let sink = &$sink;
        if sink.enabled($level) {
            (|| -> $crate::Result<()> {
                let args: &[$crate::Arg] = &$crate::__record_args!(sink; []; $($($arg)*)?);
                sink.write_args(args)
            })()
        } else {
            ::core::result::Result::Ok(())
        }
    }};
}

/// Converts macro arguments one by one, literals first.
#[doc(hidden)]
#[macro_export]
macro_rules! __record_args {
    ($sink:ident; [$($done:expr,)*];) => {
        [$($done,)*]
    };
    ($sink:ident; [$($done:expr,)*]; $lit:literal $(, $($rest:tt)*)?) => {
        $crate::__record_args!(
            $sink;
            [$($done,)* $crate::arg::LiteralArg::literal_arg($lit),];
            $($($rest)*)?
        )
    };
    ($sink:ident; [$($done:expr,)*]; $value:expr $(, $($rest:tt)*)?) => {
        $crate::__record_args!(
            $sink;
            [$($done,)* $crate::arg::ToArg::to_arg(&$value, $sink)?,];
            $($($rest)*)?
        )
    };
}

#[macro_export]
macro_rules! fatal {
    ($sink:expr $(, $($arg:tt)*)?) => {
        $crate::emit!($sink, $crate::Level::Fatal $(, $($arg)*)?)
    };
}

#[macro_export]
macro_rules! warn {
    ($sink:expr $(, $($arg:tt)*)?) => {
        $crate::emit!($sink, $crate::Level::Warn $(, $($arg)*)?)
    };
}

#[macro_export]
macro_rules! info {
    ($sink:expr $(, $($arg:tt)*)?) => {
        $crate::emit!($sink, $crate::Level::Info $(, $($arg)*)?)
    };
}

#[macro_export]
macro_rules! debug {
    ($sink:expr $(, $($arg:tt)*)?) => {
        $crate::emit!($sink, $crate::Level::Debug $(, $($arg)*)?)
    };
}

#[macro_export]
macro_rules! trace {
    ($sink:expr $(, $($arg:tt)*)?) => {
        $crate::emit!($sink, $crate::Level::Trace $(, $($arg)*)?)
    };
}
