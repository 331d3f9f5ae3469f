//! Page sequences shared between processes.
//!
//! Every page of a shared log has a small named control segment holding its
//! write cursor and a count of attached handles:
//!
//! ```text
//! {shm_dir}/pagelog-head-{key}          active page index, attached handles
//! {shm_dir}/pagelog-offset-{i}-{key}    cursor, refcount and index of page i
//! ```
//!
//! `{key}` is the log's file name and a hash of its directory, see
//! [`segment_key`].
//!
//! A handle attaches to the page named by the head, bumps its refcount and
//! then checks that the head did not move in between; if it did, it lets go
//! and tries again. A control segment is unlinked by whoever drops its
//! refcount to zero, and only once the page is retired, so an attached page
//! is never removed and a retired one is never re-created under a writer.
//!
//! Rotation is decided by `create_new` on the next control segment: exactly
//! one process creates it, grows the data file, advances the head and seals
//! the old cursor. Everybody else waits for the head to move and joins.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::arg::{fnv1_64, Arg};
use crate::backing::Backing;
use crate::clock;
use crate::config::{validate_page_size, LogConfig};
use crate::level::{Level, LevelFilter};
use crate::logger::{encode_record, record_len, Sink};
use crate::page::{Cursor, MappedPage, Position};
use crate::sequencer::SequencerOptions;
use crate::{Error, Result};

/// Bytes in every named segment.
pub const SEGMENT_SIZE: usize = 64;

const HEAD_PREFIX: &str = "pagelog-head-";
const OFFSET_PREFIX: &str = "pagelog-offset-";

/// How long a process that lost the race to create the next page waits for
/// the winner to publish it.
const ROTATION_TIMEOUT: Duration = Duration::from_secs(5);
const ROTATION_POLL: Duration = Duration::from_micros(20);

/// Layout of a per-page control segment.
#[repr(C)]
pub struct ControlBlock {
    /// Write cursor of the page, shared by all attached processes.
    pub offset: AtomicU64,
    /// Handles currently attached to the page.
    pub refcount: AtomicU64,
    /// Page index, for inspection.
    pub index: AtomicU64,
    _reserved: [u64; 5],
}

/// Layout of the per-log head segment.
#[repr(C)]
pub struct HeadBlock {
    /// Index of the page new writers attach to.
    pub active: AtomicU64,
    /// Open logger handles across all processes.
    pub attached: AtomicU64,
    _reserved: [u64; 6],
}

const _: () = assert!(mem::size_of::<ControlBlock>() == SEGMENT_SIZE);
const _: () = assert!(mem::size_of::<HeadBlock>() == SEGMENT_SIZE);

/// Key that names the segments of the log at `path`: its file name followed
/// by the FNV-1 hash of its canonical directory, so logs with the same file
/// name in different directories never share a head.
///
/// # Examples
///
/// ```
/// # fn main() -> pagelog::Result<()> {
/// let dir = tempfile::tempdir().unwrap();
/// let key = pagelog::interprocess::segment_key(&dir.path().join("app.log"))?;
/// assert!(key.starts_with("app.log."));
/// # Ok(())
/// # }
/// ```
pub fn segment_key(path: &Path) -> Result<String> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidConfig(format!("log path {} has no file name", path.display())))?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let dir = fs::canonicalize(parent).map_err(|source| Error::Read {
        path: parent.to_path_buf(),
        source,
    })?;
    let dir_hash = fnv1_64(dir.to_string_lossy().as_bytes());
    Ok(format!("{file_name}.{dir_hash:016x}"))
}

/// File name of the head segment for `key`.
pub fn head_segment_name(key: &str) -> String {
    format!("{HEAD_PREFIX}{key}")
}

pub fn offset_segment_name(index: u64, key: &str) -> String {
    format!("{OFFSET_PREFIX}{index}-{key}")
}

/// A mapped [`SEGMENT_SIZE`] byte file under the shared-memory directory.
struct NamedSegment {
    name: String,
    path: PathBuf,
    map: MmapMut,
}

impl NamedSegment {
    /// Creates the segment, failing with `AlreadyExists` if anyone else did.
    fn create_new(dir: &Path, name: String) -> io::Result<Self> {
        let path = dir.join(&name);
        let file = OpenOptions::new().read(true).write(true).create_new(true).open(&path)?;
        file.set_len(SEGMENT_SIZE as u64)?;
        Self::map(name, path, &file)
    }

    /// Opens an existing segment. A segment whose creator has not sized it
    /// yet reports `WouldBlock`.
    fn open_existing(dir: &Path, name: String) -> io::Result<Self> {
        let path = dir.join(&name);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if file.metadata()?.len() < SEGMENT_SIZE as u64 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "segment is still being created"));
        }
        Self::map(name, path, &file)
    }

    fn open_or_create(dir: &Path, name: String) -> io::Result<Self> {
        let path = dir.join(&name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.metadata()?.len() < SEGMENT_SIZE as u64 {
            file.set_len(SEGMENT_SIZE as u64)?;
        }
        Self::map(name, path, &file)
    }

    fn map(name: String, path: PathBuf, file: &File) -> io::Result<Self> {
        // SAFETY: segment contents are only accessed through atomics.
        let map = unsafe { MmapOptions::new().len(SEGMENT_SIZE).map_mut(file)? };
        Ok(Self { name, path, map })
    }

    /// # Safety
    ///
    /// `T` must be `repr(C)`, at most [`SEGMENT_SIZE`] bytes, valid for any
    /// bit pattern and only mutated through atomics.
    unsafe fn view<T>(&self) -> &T {
        &*(self.map.as_ptr() as *const T)
    }
}

/// The head segment of one shared log file.
pub(crate) struct HeadSegment {
    segment: NamedSegment,
}

impl HeadSegment {
    fn open(dir: &Path, key: &str) -> Result<Self> {
        let name = head_segment_name(key);
        let segment = NamedSegment::open_or_create(dir, name.clone())
            .map_err(|source| Error::Segment { name, source })?;
        Ok(Self { segment })
    }

    pub(crate) fn block(&self) -> &HeadBlock {
        // SAFETY: HeadBlock is a repr(C) set of atomics sized to the segment.
        unsafe { self.segment.view::<HeadBlock>() }
    }

    fn active(&self) -> u64 {
        self.block().active.load(Ordering::Acquire)
    }
}

/// The control segment of one page. While attached it holds a reference on
/// the page, dropped with the segment.
pub(crate) struct ControlSegment {
    segment: NamedSegment,
    index: u64,
    head: Option<Arc<HeadSegment>>,
}

impl ControlSegment {
    fn create_new(dir: &Path, index: u64, key: &str) -> io::Result<Self> {
        let segment = NamedSegment::create_new(dir, offset_segment_name(index, key))?;
        let control = Self {
            segment,
            index,
            head: None,
        };
        control.block().index.store(index, Ordering::Release);
        Ok(control)
    }

    fn open_existing(dir: &Path, index: u64, key: &str) -> io::Result<Self> {
        let segment = NamedSegment::open_existing(dir, offset_segment_name(index, key))?;
        Ok(Self {
            segment,
            index,
            head: None,
        })
    }

    pub(crate) fn block(&self) -> &ControlBlock {
        // SAFETY: ControlBlock is a repr(C) set of atomics sized to the segment.
        unsafe { self.segment.view::<ControlBlock>() }
    }

    pub(crate) fn name(&self) -> &str {
        &self.segment.name
    }

    fn attach(&mut self, head: &Arc<HeadSegment>) {
        self.block().refcount.fetch_add(1, Ordering::AcqRel);
        self.head = Some(Arc::clone(head));
    }
}

impl Drop for ControlSegment {
    fn drop(&mut self) {
        let Some(head) = self.head.take() else {
            return;
        };
        let previous = self.block().refcount.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && head.active() > self.index {
            match fs::remove_file(&self.segment.path) {
                Ok(()) => tracing::trace!(segment = %self.segment.name, "removed retired control segment"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(segment = %self.segment.name, error = %err, "could not remove control segment")
                }
            }
        }
    }
}

fn segment_error(name: String) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::Segment { name, source }
}

/// A page sequence whose cursor and rotation are shared with every other
/// process that opens the same file with the same shared-memory directory.
///
/// The data file is opened without truncation. Pre-warming does not apply
/// here: the next page is mapped by whichever process rotates.
pub struct SharedSequencer {
    backing: Backing,
    head: Arc<HeadSegment>,
    shm_dir: PathBuf,
    key: String,
    active: ArcSwap<MappedPage>,
    rotation: Mutex<()>,
    populate: bool,
}

impl SharedSequencer {
    pub fn open(
        path: impl AsRef<Path>,
        page_size: u64,
        options: SequencerOptions,
        shm_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        validate_page_size(page_size)?;
        let path = path.as_ref();
        let shm_dir = shm_dir.as_ref().to_path_buf();

        let backing = Backing::open_shared(path, page_size, options.grow_pages)?;
        let key = segment_key(path)?;
        let head = Arc::new(HeadSegment::open(&shm_dir, &key)?);
        let first = attach(&backing, &head, &shm_dir, &key, options.populate)?;
        head.block().attached.fetch_add(1, Ordering::AcqRel);

        tracing::debug!(
            path = %path.display(),
            page = first.index(),
            offset = first.used(),
            "attached to shared page sequence"
        );
        Ok(Self {
            backing,
            head,
            shm_dir,
            key,
            active: ArcSwap::from_pointee(first),
            rotation: Mutex::new(()),
            populate: options.populate,
        })
    }

    /// Path of the shared data file.
    pub fn path(&self) -> &Path {
        self.backing.path()
    }

    /// Bytes per page; every process must use the same value.
    pub fn page_size(&self) -> u64 {
        self.backing.page_size()
    }

    /// Page and cursor this handle would write to next. Another process may
    /// move the cursor at any time, so the offset is only a snapshot.
    pub fn position(&self) -> Position {
        self.active.load().position()
    }

    /// Key naming this log's segments, as returned by [`segment_key`].
    pub fn segment_key(&self) -> &str {
        &self.key
    }

    /// Refcount of the page this handle writes to.
    pub fn active_refcount(&self) -> u64 {
        match self.active.load().cursor() {
            Cursor::Shared(control) => control.block().refcount.load(Ordering::Acquire),
            Cursor::Local(_) => 1,
        }
    }

    /// Logger handles open on this file across all processes.
    pub fn attached_handles(&self) -> u64 {
        self.head.block().attached.load(Ordering::Acquire)
    }

    /// Location of the control segment for page `index`.
    pub fn segment_path(&self, index: u64) -> PathBuf {
        self.shm_dir.join(offset_segment_name(index, &self.key))
    }

    #[inline]
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        self.append_with(bytes.len(), |dst| dst.copy_from_slice(bytes))
    }

    /// Reserves `len` bytes on the shared cursor and lets `fill` write them.
    #[inline]
    pub fn append_with<F: FnOnce(&mut [u8])>(&self, len: usize, fill: F) -> Result<u64> {
        let size = len as u64;
        if size > self.page_size() {
            return Err(Error::RecordTooLarge {
                size,
                capacity: self.page_size(),
            });
        }

        loop {
            let page = self.active.load();
            if let Some(offset) = page.reserve(size) {
                // SAFETY: the shared cursor handed this range to us alone.
                fill(unsafe { page.reserved_mut(offset, len) });
                return Ok(page.absolute(offset));
            }
            let seen = page.index();
            drop(page);
            self.rotate(seen)?;
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.active.load().flush().map_err(|source| Error::Flush {
            path: self.backing.path().to_path_buf(),
            source,
        })
    }

    fn rotate(&self, seen: u64) -> Result<()> {
        let _rotation = self.rotation.lock();
        let current = self.active.load_full();
        if current.index() != seen {
            return Ok(());
        }
        if self.head.active() > seen {
            return self.rejoin();
        }

        let next_index = seen + 1;
        let mut control = match ControlSegment::create_new(&self.shm_dir, next_index, &self.key) {
            Ok(control) => control,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                self.wait_for_head(seen, next_index)?;
                return self.rejoin();
            }
            Err(source) => {
                return Err(Error::Segment {
                    name: offset_segment_name(next_index, &self.key),
                    source,
                })
            }
        };
        control.attach(&self.head);
        let next = match MappedPage::activate_with(&self.backing, next_index, self.populate, Cursor::Shared(control)) {
            Ok(next) => next,
            Err(err) => {
                // Unpublished, so nobody else holds it. Let the next writer retry.
                let _ = fs::remove_file(self.segment_path(next_index));
                return Err(err);
            }
        };

        if let Err(actual) =
            self.head
                .block()
                .active
                .compare_exchange(seen, next_index, Ordering::AcqRel, Ordering::Acquire)
        {
            tracing::debug!(page = next_index, head = actual, "abandoning stale rotation");
            drop(next);
            return self.rejoin();
        }

        current.seal();
        self.active.store(Arc::new(next));
        tracing::debug!(path = %self.backing.path().display(), page = next_index, "rotated shared page");
        Ok(())
    }

    /// Waits for the process that created page `next_index` to publish it.
    fn wait_for_head(&self, seen: u64, next_index: u64) -> Result<()> {
        let started = Instant::now();
        while self.head.active() <= seen {
            if started.elapsed() > ROTATION_TIMEOUT {
                return Err(Error::Segment {
                    name: offset_segment_name(next_index, &self.key),
                    source: io::Error::new(io::ErrorKind::TimedOut, "page was created but never published"),
                });
            }
            thread::sleep(ROTATION_POLL);
        }
        Ok(())
    }

    fn rejoin(&self) -> Result<()> {
        let page = attach(&self.backing, &self.head, &self.shm_dir, &self.key, self.populate)?;
        tracing::trace!(page = page.index(), "joined shared page");
        self.active.store(Arc::new(page));
        Ok(())
    }
}

impl Drop for SharedSequencer {
    fn drop(&mut self) {
        self.head.block().attached.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Attaches to the page currently named by the head.
fn attach(
    backing: &Backing,
    head: &Arc<HeadSegment>,
    shm_dir: &Path,
    key: &str,
    populate: bool,
) -> Result<MappedPage> {
    loop {
        let index = head.active();
        let mut control = match ControlSegment::open_existing(shm_dir, index, key) {
            Ok(control) => control,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if head.active() != index {
                    continue;
                }
                match ControlSegment::create_new(shm_dir, index, key) {
                    Ok(control) => control,
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                    Err(source) => return Err(segment_error(offset_segment_name(index, key))(source)),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::yield_now();
                continue;
            }
            Err(source) => return Err(segment_error(offset_segment_name(index, key))(source)),
        };

        control.attach(head);
        if head.active() != index {
            tracing::trace!(segment = control.name(), "head moved while attaching, retrying");
            continue;
        }
        return MappedPage::activate_with(backing, index, populate, Cursor::Shared(control));
    }
}

/// A logger whose record and string pages are shared between processes.
/// The level threshold is per handle.
pub struct SharedLogger {
    level: AtomicU8,
    records: SharedSequencer,
    strings: SharedSequencer,
}

impl SharedLogger {
    /// Attaches to (or starts) the shared log at `config.path`.
    pub fn open(config: &LogConfig) -> Result<Self> {
        config.validate()?;
        clock::init();

        let options = SequencerOptions {
            grow_pages: config.grow_pages,
            prewarm: false,
            populate: config.populate,
        };
        let records = SharedSequencer::open(&config.path, config.page_size, options, &config.shm_dir)?;
        let strings =
            SharedSequencer::open(config.strings_path(), config.string_page_size, options, &config.shm_dir)?;

        tracing::info!(
            path = %config.path.display(),
            handles = records.attached_handles(),
            "shared logger opened"
        );
        Ok(Self {
            level: AtomicU8::new(config.level as u8),
            records,
            strings,
        })
    }

    #[inline(always)]
    pub fn enabled(&self, level: Level) -> bool {
        level.passes(self.level.load(Ordering::Relaxed))
    }

    pub fn level(&self) -> LevelFilter {
        LevelFilter::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Changes the level of this handle only. Other handles, in this
    /// process or another, keep their own.
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

    #[inline]
    pub fn write_args(&self, args: &[Arg]) -> Result<()> {
        let timestamp = clock::now();
        self.records
            .append_with(record_len(args.len()), |dst| encode_record(dst, timestamp, args))?;
        Ok(())
    }

    #[inline]
    pub fn intern(&self, bytes: &[u8]) -> Result<Arg> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::RecordTooLarge {
            size: bytes.len() as u64,
            capacity: self.strings.page_size(),
        })?;
        let offset = self.strings.append(bytes)?;
        Ok(Arg::Interned { len, offset })
    }

    /// Shared sequence holding the records.
    pub fn records(&self) -> &SharedSequencer {
        &self.records
    }

    /// Shared sequence of the strings file.
    pub fn strings(&self) -> &SharedSequencer {
        &self.strings
    }

    pub fn flush(&self) -> Result<()> {
        self.records.flush()?;
        self.strings.flush()
    }

    /// Removes every named segment of the log at `config.path`. Only safe
    /// once no handle is attached. Returns the number of files removed.
    pub fn purge(config: &LogConfig) -> Result<usize> {
        let mut removed = 0;
        for path in [config.path.clone(), config.strings_path()] {
            let key = segment_key(&path)?;
            removed += purge_segments(&config.shm_dir, &key)?;
        }
        tracing::debug!(path = %config.path.display(), removed, "purged shared segments");
        Ok(removed)
    }
}

fn purge_segments(shm_dir: &Path, key: &str) -> Result<usize> {
    let read_error = |source| Error::Read {
        path: shm_dir.to_path_buf(),
        source,
    };
    let mut removed = 0;
    for entry in fs::read_dir(shm_dir).map_err(read_error)? {
        let entry = entry.map_err(read_error)?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !is_segment_of(&name, key) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(Error::Segment {
                    name: name.into_owned(),
                    source,
                })
            }
        }
    }
    Ok(removed)
}

/// Whether `name` is the head or a control segment of the log keyed `key`.
fn is_segment_of(name: &str, key: &str) -> bool {
    if name.strip_prefix(HEAD_PREFIX) == Some(key) {
        return true;
    }
    name.strip_prefix(OFFSET_PREFIX)
        .and_then(|rest| rest.split_once('-'))
        .is_some_and(|(index, rest)| rest == key && index.parse::<u64>().is_ok())
}

impl Sink for SharedLogger {
    #[inline(always)]
    fn enabled(&self, level: Level) -> bool {
        SharedLogger::enabled(self, level)
    }

    #[inline(always)]
    fn intern(&self, bytes: &[u8]) -> Result<Arg> {
        SharedLogger::intern(self, bytes)
    }

    #[inline(always)]
    fn write_args(&self, args: &[Arg]) -> Result<()> {
        SharedLogger::write_args(self, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names_follow_the_key() {
        assert_eq!(head_segment_name("app.log.00ff"), "pagelog-head-app.log.00ff");
        assert_eq!(offset_segment_name(3, "app.log.00ff"), "pagelog-offset-3-app.log.00ff");
    }

    #[test]
    fn segment_key_depends_on_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::create_dir(dir.path().join("b")).unwrap();
        let a = segment_key(&dir.path().join("a").join("app.log")).unwrap();
        let b = segment_key(&dir.path().join("b").join("app.log")).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("app.log."));
        assert_eq!(a, segment_key(&dir.path().join("a").join(".").join("app.log")).unwrap());
    }

    #[test]
    fn segment_key_needs_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = segment_key(&dir.path().join("missing").join("app.log")).unwrap_err();
        assert!(matches!(err, Error::Read { .. }));
    }

    #[test]
    fn purge_matches_only_its_own_segments() {
        let key = "app.log.00000000000000ff";
        assert!(is_segment_of("pagelog-head-app.log.00000000000000ff", key));
        assert!(is_segment_of("pagelog-offset-12-app.log.00000000000000ff", key));
        assert!(!is_segment_of("pagelog-offset-12-app.log.strings.00000000000000ff", key));
        assert!(!is_segment_of("pagelog-offset-12-app.log.00000000000000aa", key));
        assert!(!is_segment_of("pagelog-offset-x-app.log.00000000000000ff", key));
        assert!(!is_segment_of("pagelog-offset-1-x-app.log.00000000000000ff", key));
    }

    #[test]
    fn detach_of_the_active_page_keeps_its_segment() {
        let dir = tempfile::tempdir().unwrap();
        let head = Arc::new(HeadSegment::open(dir.path(), "log").unwrap());
        let mut control = ControlSegment::create_new(dir.path(), 0, "log").unwrap();
        control.attach(&head);
        assert_eq!(control.block().refcount.load(Ordering::Acquire), 1);
        drop(control);
        assert!(dir.path().join(offset_segment_name(0, "log")).exists());
    }

    #[test]
    fn last_detach_of_a_retired_page_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let head = Arc::new(HeadSegment::open(dir.path(), "log").unwrap());
        let mut first = ControlSegment::create_new(dir.path(), 0, "log").unwrap();
        let mut second = ControlSegment::open_existing(dir.path(), 0, "log").unwrap();
        first.attach(&head);
        second.attach(&head);
        head.block().active.store(1, Ordering::Release);

        let path = dir.path().join(offset_segment_name(0, "log"));
        drop(first);
        assert!(path.exists(), "still referenced");
        drop(second);
        assert!(!path.exists());
    }

    #[test]
    fn creating_an_existing_segment_fails() {
        let dir = tempfile::tempdir().unwrap();
        let _first = ControlSegment::create_new(dir.path(), 4, "log").unwrap();
        let err = ControlSegment::create_new(dir.path(), 4, "log").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
