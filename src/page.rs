//! One memory-mapped page with a lock-free write cursor.

use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use memmap2::MmapMut;

use crate::backing::Backing;
use crate::interprocess::ControlSegment;
use crate::{Error, Result};

/// High bit of the cursor word. Once set the page accepts no reservation.
const SEALED: u64 = 1 << 63;

/// A page index and the number of bytes consumed in it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd)]
pub struct Position {
    pub page: u64,
    pub offset: u64,
}

/// Where a page keeps its write cursor: in this process, or in a named
/// segment shared with other processes.
pub(crate) enum Cursor {
    Local(CachePadded<AtomicU64>),
    Shared(ControlSegment),
}

impl Cursor {
    #[inline(always)]
    fn word(&self) -> &AtomicU64 {
        match self {
            Cursor::Local(word) => &**word,
            Cursor::Shared(segment) => &segment.block().offset,
        }
    }
}

/// A fixed-size window of a [`Backing`] file, mapped into memory.
///
/// Writers claim byte ranges with [`reserve`](Self::reserve) and then copy
/// into them without further synchronization; two reservations never
/// overlap. The mapping is released when the page is dropped.
pub struct MappedPage {
    index: u64,
    capacity: u64,
    base: *mut u8,
    map: Option<MmapMut>,
    cursor: Cursor,
}

// SAFETY: `base` points into `map`, which lives as long as the page. Concurrent
// writes go to disjoint reserved ranges only.
unsafe impl Send for MappedPage {}
unsafe impl Sync for MappedPage {}

impl MappedPage {
    /// Maps page `index` of `backing`, growing the file first when needed.
    pub fn activate(backing: &Backing, index: u64, populate: bool) -> Result<Self> {
        Self::activate_with(backing, index, populate, Cursor::Local(CachePadded::new(AtomicU64::new(0))))
    }

    pub(crate) fn activate_with(
        backing: &Backing,
        index: u64,
        populate: bool,
        cursor: Cursor,
    ) -> Result<Self> {
        backing.ensure_page(index)?;
        let mut map = backing.map_page(index, populate)?;
        if (map.len() as u64) < backing.page_size() {
            return Err(Error::Map {
                path: backing.path().to_path_buf(),
                index,
                source: std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short mapping"),
            });
        }
        let base = map.as_mut_ptr();
        Ok(Self {
            index,
            capacity: backing.page_size(),
            base,
            map: Some(map),
            cursor,
        })
    }

    /// Position of this page in the backing file, counting from zero.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Usable bytes, equal to the page size.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn used(&self) -> u64 {
        self.cursor.word().load(Ordering::Acquire) & !SEALED
    }

    #[inline]
    pub fn free_space(&self) -> u64 {
        self.capacity - self.used()
    }

    pub fn position(&self) -> Position {
        Position {
            page: self.index,
            offset: self.used(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.cursor.word().load(Ordering::Acquire) & SEALED != 0
    }

    /// Freezes the cursor. In-flight writers keep their reservations; no new
    /// ones are granted.
    pub fn seal(&self) {
        self.cursor.word().fetch_or(SEALED, Ordering::AcqRel);
    }

    /// Claims `len` bytes and returns their offset within the page, or `None`
    /// when they do not fit or the page is sealed.
    #[inline]
    pub fn reserve(&self, len: u64) -> Option<u64> {
        if self.base.is_null() {
            return None;
        }
        let capacity = self.capacity;
        self.cursor
            .word()
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current & SEALED != 0 {
                    return None;
                }
                let next = current.checked_add(len)?;
                (next <= capacity).then_some(next)
            })
            .ok()
    }

    /// Appends `bytes`, returning the absolute file position written to.
    #[inline]
    pub fn write(&self, bytes: &[u8]) -> Option<u64> {
        self.write_with(bytes.len(), |dst| dst.copy_from_slice(bytes))
    }

    /// Reserves `len` bytes and lets `fill` write them in place.
    #[inline]
    pub fn write_with<F: FnOnce(&mut [u8])>(&self, len: usize, fill: F) -> Option<u64> {
        let offset = self.reserve(len as u64)?;
        // SAFETY: the range was just reserved by this caller.
        fill(unsafe { self.reserved_mut(offset, len) });
        Some(self.absolute(offset))
    }

    /// Absolute file position of `offset` within this page.
    #[inline(always)]
    pub fn absolute(&self, offset: u64) -> u64 {
        self.index * self.capacity + offset
    }

    /// The bytes of a reservation.
    ///
    /// # Safety
    ///
    /// `[offset, offset + len)` must come from a successful
    /// [`reserve`](Self::reserve) on this page, and must not be handed out
    /// twice.
    #[allow(clippy::mut_from_ref)]
    #[inline(always)]
    pub(crate) unsafe fn reserved_mut(&self, offset: u64, len: usize) -> &mut [u8] {
        slice::from_raw_parts_mut(self.base.add(offset as usize), len)
    }

    /// Schedules write-back of the mapped bytes.
    pub fn flush(&self) -> std::io::Result<()> {
        match &self.map {
            Some(map) => map.flush_async(),
            None => Ok(()),
        }
    }

    /// Unmaps the page. Safe to call more than once. The cursor is left as
    /// is, since a shared cursor may still serve other processes.
    pub fn release(&mut self) {
        if let Some(map) = self.map.take() {
            self.base = ptr::null_mut();
            drop(map);
        }
    }

    pub(crate) fn cursor(&self) -> &Cursor {
        &self.cursor
    }
}

impl Drop for MappedPage {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 64 * 1024;

    fn page(index: u64) -> (tempfile::TempDir, Backing, MappedPage) {
        let dir = tempfile::tempdir().unwrap();
        let backing = Backing::create(dir.path().join("page"), PAGE, 1).unwrap();
        let page = MappedPage::activate(&backing, index, false).unwrap();
        (dir, backing, page)
    }

    #[test]
    fn write_advances_offset_and_returns_position() {
        let (_dir, _backing, page) = page(2);
        assert_eq!(page.free_space(), PAGE);
        assert_eq!(page.write(b"hello"), Some(2 * PAGE));
        assert_eq!(page.write(b"world"), Some(2 * PAGE + 5));
        assert_eq!(page.used(), 10);
        assert_eq!(page.free_space(), PAGE - 10);
    }

    #[test]
    fn reservation_never_passes_capacity() {
        let (_dir, _backing, page) = page(0);
        assert_eq!(page.reserve(PAGE - 8), Some(0));
        assert_eq!(page.reserve(9), None);
        assert_eq!(page.used(), PAGE - 8);
        assert_eq!(page.reserve(8), Some(PAGE - 8));
        assert_eq!(page.free_space(), 0);
        assert_eq!(page.reserve(0), Some(PAGE));
    }

    #[test]
    fn sealed_page_refuses_writes() {
        let (_dir, _backing, page) = page(0);
        page.write(b"abc").unwrap();
        page.seal();
        assert!(page.is_sealed());
        assert_eq!(page.write(b"d"), None);
        assert_eq!(page.used(), 3, "offset is frozen");
    }

    #[test]
    fn release_is_idempotent() {
        let (_dir, _backing, mut page) = page(0);
        page.write(b"abc").unwrap();
        page.release();
        page.release();
        assert_eq!(page.write(b"x"), None);
    }

    #[test]
    fn written_bytes_land_in_the_file() {
        let (dir, backing, page) = page(1);
        page.write(b"persisted").unwrap();
        page.flush().unwrap();
        drop(page);
        drop(backing);
        let data = std::fs::read(dir.path().join("page")).unwrap();
        assert_eq!(&data[PAGE as usize..PAGE as usize + 9], b"persisted");
    }
}
