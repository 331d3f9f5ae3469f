//! Side channel for runtime string bytes.
//!
//! Strings are copied once into a page sequence of their own and the record
//! stream only carries an [`Arg::Interned`] reference (length plus absolute
//! offset in the strings file). Every call writes; identical strings are not
//! deduplicated.

use std::path::Path;

use crate::arg::Arg;
use crate::page::Position;
use crate::sequencer::{PageSequencer, SequencerOptions};
use crate::{Error, Result};

/// Appends runtime strings to `<log>.strings` and hands back references.
pub struct StringInterner {
    pages: PageSequencer,
}

impl StringInterner {
    /// Creates the strings file and maps its first page.
    ///
    /// # Arguments
    ///
    /// * `path` - the strings file, usually [`LogConfig::strings_path`](crate::LogConfig::strings_path)
    /// * `page_size` - bytes per string page; also the longest string that can be interned
    /// * `options` - growth, pre-warm and populate settings, shared with the record sequence
    pub fn open(path: impl AsRef<Path>, page_size: u64, options: SequencerOptions) -> Result<Self> {
        Ok(Self {
            pages: PageSequencer::open(path, page_size, options)?,
        })
    }

    /// Copies `bytes` into the strings file and returns the reference to
    /// store in the record.
    #[inline]
    pub fn intern(&self, bytes: &[u8]) -> Result<Arg> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::RecordTooLarge {
            size: bytes.len() as u64,
            capacity: self.pages.page_size(),
        })?;
        let offset = self.pages.append(bytes)?;
        Ok(Arg::Interned { len, offset })
    }

    pub fn path(&self) -> &Path {
        self.pages.path()
    }

    /// Where the next string will land.
    pub fn position(&self) -> Position {
        self.pages.position()
    }

    /// Underlying page sequence.
    pub fn pages(&self) -> &PageSequencer {
        &self.pages
    }

    pub fn flush(&self) -> Result<()> {
        self.pages.flush()
    }
}
