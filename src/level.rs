//! Log levels and the level filter that gates every emit call.
//!
//! Levels are ordered by decreasing severity: `Fatal` is the most severe and
//! `Trace` the least. A [`LevelFilter`] enables its own level and everything
//! more severe; `LevelFilter::None` disables logging entirely.

use std::fmt;
use std::str::FromStr;

/// Severity of a single emit call.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    Fatal = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

/// Threshold stored in a logger. Ordinals match [`Level`], with `None = 0`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum LevelFilter {
    None = 0,
    Fatal = 1,
    Warn = 2,
    #[default]
    Info = 3,
    Debug = 4,
    Trace = 5,
}

const LEVEL_NAMES: [&str; 6] = ["NONE", "FATAL", "WARN", "INFO", "DEBUG", "TRACE"];

impl Level {
    /// Whether a logger set to `filter` accepts this level.
    #[inline(always)]
    pub const fn passes(self, filter: u8) -> bool {
        self as u8 <= filter
    }
}

impl LevelFilter {
    /// Inverse of `as u8`; out-of-range values saturate to `Trace`.
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => LevelFilter::None,
            1 => LevelFilter::Fatal,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

impl From<Level> for LevelFilter {
    fn from(level: Level) -> Self {
        LevelFilter::from_u8(level as u8)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(LEVEL_NAMES[*self as usize])
    }
}

impl fmt::Display for LevelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(LEVEL_NAMES[*self as usize])
    }
}

impl FromStr for LevelFilter {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LEVEL_NAMES
            .iter()
            .position(|name| name.eq_ignore_ascii_case(s.trim()))
            .map(|i| LevelFilter::from_u8(i as u8))
            .ok_or_else(|| crate::Error::InvalidConfig(format!("unknown log level `{s}`")))
    }
}
