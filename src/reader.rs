//! Decoding of page files back into records.
//!
//! The reader walks the primary file page by page in steps of
//! [`ARG_SIZE`]. A record starts at a `Timestamp` value and ends at the next
//! `Terminator`. Zero-filled slots (unused page tails, reservations that
//! were never filled) are skipped; a record interrupted by one, or by an
//! unknown tag, is dropped, and so is a record still open at the end of a
//! page.

use std::fmt;
use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;

use crate::arg::{Arg, ARG_SIZE, UNUSED_TAG};
use crate::config::strings_path_for;
use crate::symbols::SymbolTable;
use crate::{Error, Result};

/// A decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    /// An inline string or a resolved interned one.
    Str(String),
    /// A hashed literal, with its text when the symbol table knows it.
    Symbol { hash: u64, text: Option<String> },
    ErrorCode(u64),
    /// Nanoseconds since the UNIX epoch.
    Timestamp(u64),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    /// An interned reference pointing past the end of the strings file.
    Unresolved { offset: u64, len: u32 },
}

impl fmt::Display for LogValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogValue::Str(s) => f.write_str(s),
            LogValue::Symbol { text: Some(text), .. } => f.write_str(text),
            LogValue::Symbol { hash, text: None } => write!(f, "#{hash:016x}"),
            LogValue::ErrorCode(code) => write!(f, "error({code})"),
            LogValue::Timestamp(nanos) => write_timestamp(f, *nanos),
            LogValue::U8(v) => write!(f, "{v}"),
            LogValue::I8(v) => write!(f, "{v}"),
            LogValue::U16(v) => write!(f, "{v}"),
            LogValue::I16(v) => write!(f, "{v}"),
            LogValue::U32(v) => write!(f, "{v}"),
            LogValue::I32(v) => write!(f, "{v}"),
            LogValue::U64(v) => write!(f, "{v}"),
            LogValue::I64(v) => write!(f, "{v}"),
            LogValue::F32(v) => write!(f, "{v}"),
            LogValue::F64(v) => write!(f, "{v}"),
            LogValue::Unresolved { offset, len } => write!(f, "<unresolved {len}@{offset}>"),
        }
    }
}

fn write_timestamp(f: &mut fmt::Formatter<'_>, nanos: u64) -> fmt::Result {
    write!(f, "{}.{:09}", nanos / 1_000_000_000, nanos % 1_000_000_000)
}

/// One record read back from a log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Page the record was found in.
    pub page: u64,
    /// Timestamp stamped by the logger.
    pub timestamp: u64,
    /// The logged arguments, in call order.
    pub values: Vec<LogValue>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_timestamp(f, self.timestamp)?;
        for value in &self.values {
            write!(f, " {value}")?;
        }
        Ok(())
    }
}

enum Bytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for Bytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Bytes::Mapped(map) => &map[..],
            Bytes::Owned(bytes) => &bytes[..],
        }
    }
}

fn map_read_only(path: &Path) -> Result<Bytes> {
    let read_error = |source| Error::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(read_error)?;
    if file.metadata().map_err(read_error)?.len() == 0 {
        return Ok(Bytes::Owned(Vec::new()));
    }
    // SAFETY: the map is read-only; a writer still appending may change
    // bytes under us, which the decoder tolerates as unfinished records.
    let map = unsafe { Mmap::map(&file) }.map_err(read_error)?;
    Ok(Bytes::Mapped(map))
}

/// Reader over a record file and its strings file.
///
/// ```no_run
/// use pagelog::{LogReader, SymbolTable};
///
/// # fn main() -> pagelog::Result<()> {
/// let symbols: SymbolTable = ["request served in"].into_iter().collect();
/// let reader = LogReader::open("app.binlog", 1024 * 1024)?.with_symbols(symbols);
/// for entry in reader.entries() {
///     println!("{entry}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct LogReader {
    records: Bytes,
    strings: Bytes,
    page_size: usize,
    symbols: SymbolTable,
}

impl LogReader {
    /// Maps `path` and `<path>.strings` read-only. A missing strings file
    /// reads as empty.
    pub fn open(path: impl AsRef<Path>, page_size: u64) -> Result<Self> {
        let path = path.as_ref();
        let records = map_read_only(path)?;
        let strings_path = strings_path_for(path);
        let strings = if strings_path.exists() {
            map_read_only(&strings_path)?
        } else {
            Bytes::Owned(Vec::new())
        };
        Self::build(records, strings, page_size)
    }

    /// Reader over in-memory copies of both files.
    pub fn from_bytes(records: Vec<u8>, strings: Vec<u8>, page_size: u64) -> Result<Self> {
        Self::build(Bytes::Owned(records), Bytes::Owned(strings), page_size)
    }

    fn build(records: Bytes, strings: Bytes, page_size: u64) -> Result<Self> {
        if page_size == 0 || page_size % ARG_SIZE as u64 != 0 {
            return Err(Error::InvalidConfig(format!(
                "page size {page_size} is not a multiple of {ARG_SIZE}"
            )));
        }
        let page_size = usize::try_from(page_size)
            .map_err(|_| Error::InvalidConfig(format!("page size {page_size} does not fit in memory")))?;
        Ok(Self {
            records,
            strings,
            page_size,
            symbols: SymbolTable::new(),
        })
    }

    /// Uses `symbols` to turn hashed literals back into text.
    pub fn with_symbols(mut self, symbols: SymbolTable) -> Self {
        self.symbols = symbols;
        self
    }

    /// Pages present in the record file, the last one possibly partial.
    pub fn page_count(&self) -> u64 {
        self.records.len().div_ceil(self.page_size) as u64
    }

    pub fn entries(&self) -> Entries<'_> {
        Entries {
            reader: self,
            pos: 0,
        }
    }

    /// Number of complete records, without resolving any value.
    pub fn count_records(&self) -> usize {
        let mut count = 0;
        let mut open = false;
        for (i, slot) in self.records.chunks_exact(ARG_SIZE).enumerate() {
            // A new page always starts outside a record.
            if (i * ARG_SIZE) % self.page_size == 0 {
                open = false;
            }
            let mut raw = [0u8; ARG_SIZE];
            raw.copy_from_slice(slot);
            // Same acceptance as `entries`: a slot `decode` rejects ends the record.
            match Arg::decode(&raw) {
                Some(Arg::Timestamp(_)) if !open => open = true,
                Some(Arg::Terminator) if open => {
                    count += 1;
                    open = false;
                }
                Some(_) => {}
                None => open = false,
            }
        }
        count
    }

    /// Decoded form of a value slot; `None` for a terminator, which carries
    /// no value.
    fn value(&self, arg: Arg) -> Option<LogValue> {
        let value = match arg {
            Arg::Inline { len, bytes } => {
                LogValue::Str(String::from_utf8_lossy(&bytes[..len as usize]).into_owned())
            }
            Arg::Interned { len, offset } => match self.interned(offset, len) {
                Some(bytes) => LogValue::Str(String::from_utf8_lossy(bytes).into_owned()),
                None => LogValue::Unresolved { offset, len },
            },
            Arg::Hash(hash) => LogValue::Symbol {
                hash,
                text: self.symbols.resolve(hash).map(str::to_owned),
            },
            Arg::ErrorCode(code) => LogValue::ErrorCode(code),
            Arg::Timestamp(nanos) => LogValue::Timestamp(nanos),
            Arg::U8(v) => LogValue::U8(v),
            Arg::I8(v) => LogValue::I8(v),
            Arg::U16(v) => LogValue::U16(v),
            Arg::I16(v) => LogValue::I16(v),
            Arg::U32(v) => LogValue::U32(v),
            Arg::I32(v) => LogValue::I32(v),
            Arg::U64(v) => LogValue::U64(v),
            Arg::I64(v) => LogValue::I64(v),
            Arg::F32(v) => LogValue::F32(v),
            Arg::F64(v) => LogValue::F64(v),
            Arg::Terminator => return None,
        };
        Some(value)
    }

    fn interned(&self, offset: u64, len: u32) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len as usize)?;
        self.strings.get(start..end)
    }
}

/// Iterator over the complete records of a [`LogReader`].
pub struct Entries<'a> {
    reader: &'a LogReader,
    pos: usize,
}

impl Iterator for Entries<'_> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        let data = &*self.reader.records;
        let page_size = self.reader.page_size;
        let mut current: Option<LogEntry> = None;

        while self.pos + ARG_SIZE <= data.len() {
            let at = self.pos;
            self.pos += ARG_SIZE;

            if at % page_size == 0 && current.take().is_some() {
                tracing::trace!(page = at / page_size - 1, "dropping record cut off at page end");
            }

            let mut raw = [0u8; ARG_SIZE];
            raw.copy_from_slice(&data[at..at + ARG_SIZE]);
            let Some(arg) = Arg::decode(&raw) else {
                if current.take().is_some() && raw[0] != UNUSED_TAG {
                    tracing::trace!(offset = at, tag = raw[0], "dropping record with unknown tag");
                }
                continue;
            };

            match arg {
                Arg::Terminator if current.is_some() => return current,
                // Stray terminator outside a record.
                Arg::Terminator => {}
                Arg::Timestamp(timestamp) if current.is_none() => {
                    current = Some(LogEntry {
                        page: (at / page_size) as u64,
                        timestamp,
                        values: Vec::new(),
                    });
                }
                value => {
                    if let Some(entry) = current.as_mut() {
                        entry.values.extend(self.reader.value(value));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 64;

    fn record(args: &[Arg]) -> Vec<u8> {
        let mut out = Arg::Timestamp(1_000_000_007).encode().to_vec();
        for arg in args {
            out.extend_from_slice(&arg.encode());
        }
        out.extend_from_slice(&Arg::Terminator.encode());
        out
    }

    #[test]
    fn zero_slots_between_records_are_skipped() {
        let mut data = record(&[Arg::U8(1)]);
        data.extend_from_slice(&[0u8; ARG_SIZE]);
        data.resize(PAGE, 0);
        data.extend_from_slice(&record(&[Arg::I64(-2)]));

        let reader = LogReader::from_bytes(data, Vec::new(), PAGE as u64).unwrap();
        let entries: Vec<_> = reader.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].values, vec![LogValue::U8(1)]);
        assert_eq!(entries[1].page, 1);
        assert_eq!(entries[1].values, vec![LogValue::I64(-2)]);
        assert_eq!(reader.count_records(), 2);
    }

    #[test]
    fn broken_and_unterminated_records_are_dropped() {
        let mut data = Arg::Timestamp(5).encode().to_vec();
        data.extend_from_slice(&[0u8; ARG_SIZE]);
        data.extend_from_slice(&record(&[Arg::U16(9)]));
        data.extend_from_slice(&Arg::Timestamp(6).encode());

        let reader = LogReader::from_bytes(data, Vec::new(), 1024).unwrap();
        let entries: Vec<_> = reader.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].values, vec![LogValue::U16(9)]);
        assert_eq!(reader.count_records(), 1);
    }

    #[test]
    fn interned_reference_past_the_end_is_unresolved() {
        let data = record(&[Arg::Interned { len: 4, offset: 2 }, Arg::Interned { len: 4, offset: 10 }]);
        let reader = LogReader::from_bytes(data, b"..abcd..".to_vec(), 1024).unwrap();
        let entry = reader.entries().next().unwrap();
        assert_eq!(
            entry.values,
            vec![LogValue::Str("abcd".into()), LogValue::Unresolved { offset: 10, len: 4 }]
        );
    }

    #[test]
    fn display_renders_timestamp_and_values() {
        let data = record(&[Arg::from_literal("ready"), Arg::I32(-7), Arg::Hash(0xabc)]);
        let reader = LogReader::from_bytes(data, Vec::new(), 1024).unwrap();
        let entry = reader.entries().next().unwrap();
        assert_eq!(entry.to_string(), "1.000000007 ready -7 #0000000000000abc");
    }
}
