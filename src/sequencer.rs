//! Page rotation over one backing file.
//!
//! All writers share the active page and claim their bytes with a lock-free
//! reservation on its cursor. Only a writer whose reservation does not fit
//! takes the rotation lock; it seals the full page, activates the next one
//! and swaps it in. Retired pages stay mapped until the last writer still
//! holding one lets go of it, and are never written again.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::backing::Backing;
use crate::config::validate_page_size;
use crate::page::{MappedPage, Position};
use crate::{Error, Result};

/// How long a rotating writer sleeps between checks of an unfinished
/// pre-warm.
const PREWARM_POLL: Duration = Duration::from_micros(20);

/// Tunables for a [`PageSequencer`].
#[derive(Debug, Clone, Copy)]
pub struct SequencerOptions {
    /// Pages the backing file grows by at a time.
    pub grow_pages: u64,
    /// Prepare the next page on a background thread.
    pub prewarm: bool,
    /// Pre-fault mappings.
    pub populate: bool,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            grow_pages: 16,
            prewarm: false,
            populate: false,
        }
    }
}

/// A page prepared ahead of time by a detached worker.
struct PrewarmSlot {
    index: u64,
    ready: AtomicBool,
    page: Mutex<Option<Result<MappedPage>>>,
}

impl PrewarmSlot {
    fn spawn(backing: Arc<Backing>, index: u64, populate: bool) -> std::io::Result<Arc<Self>> {
        let slot = Arc::new(Self {
            index,
            ready: AtomicBool::new(false),
            page: Mutex::new(None),
        });
        let worker = Arc::clone(&slot);
        thread::Builder::new()
            .name(format!("pagelog-prewarm-{index}"))
            .spawn(move || {
                let page = MappedPage::activate(&backing, worker.index, populate);
                if let Err(err) = &page {
                    tracing::warn!(index = worker.index, error = %err, "page pre-warm failed");
                }
                *worker.page.lock() = Some(page);
                worker.ready.store(true, Ordering::Release);
            })?;
        Ok(slot)
    }

    fn wait(&self) -> Result<MappedPage> {
        while !self.ready.load(Ordering::Acquire) {
            thread::sleep(PREWARM_POLL);
        }
        self.page
            .lock()
            .take()
            .unwrap_or_else(|| Err(Error::Prewarm(format!("page {} was already taken", self.index))))
    }
}

struct RotationState {
    pending: Option<Arc<PrewarmSlot>>,
}

/// Owns the active page of one backing file and rotates through its pages
/// in index order.
pub struct PageSequencer {
    backing: Arc<Backing>,
    active: ArcSwap<MappedPage>,
    rotation: Mutex<RotationState>,
    options: SequencerOptions,
}

impl PageSequencer {
    /// Creates (truncating) the backing file at `path` and activates page 0.
    pub fn open(path: impl AsRef<Path>, page_size: u64, options: SequencerOptions) -> Result<Self> {
        validate_page_size(page_size)?;
        let backing = Arc::new(Backing::create(path, page_size, options.grow_pages)?);
        let first = MappedPage::activate(&backing, 0, options.populate)?;

        let pending = if options.prewarm {
            let slot = PrewarmSlot::spawn(Arc::clone(&backing), 1, options.populate)
                .map_err(|err| Error::Prewarm(err.to_string()))?;
            Some(slot)
        } else {
            None
        };

        tracing::debug!(path = %backing.path().display(), page_size, prewarm = options.prewarm, "opened page sequence");
        Ok(Self {
            backing,
            active: ArcSwap::from_pointee(first),
            rotation: Mutex::new(RotationState { pending }),
            options,
        })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        self.backing.path()
    }

    /// Bytes per page, and so the largest single append.
    pub fn page_size(&self) -> u64 {
        self.backing.page_size()
    }

    /// Active page index and bytes used in it.
    pub fn position(&self) -> Position {
        self.active.load().position()
    }

    /// Free bytes left in the active page.
    pub fn free_space(&self) -> u64 {
        self.active.load().free_space()
    }

    /// Appends `bytes` as one contiguous run and returns its absolute file
    /// position.
    #[inline]
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        self.append_with(bytes.len(), |dst| dst.copy_from_slice(bytes))
    }

    /// Reserves `len` contiguous bytes, rotating first if the active page
    /// cannot hold them, and lets `fill` write them in place.
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
                // SAFETY: `offset..offset + len` was reserved just above.
                fill(unsafe { page.reserved_mut(offset, len) });
                return Ok(page.absolute(offset));
            }
            let seen = page.index();
            drop(page);
            self.rotate(seen)?;
        }
    }

    /// Schedules write-back of the active page.
    pub fn flush(&self) -> Result<()> {
        self.active.load().flush().map_err(|source| Error::Flush {
            path: self.backing.path().to_path_buf(),
            source,
        })
    }

    /// Retires page `seen` and activates its successor, unless another
    /// writer already did.
    fn rotate(&self, seen: u64) -> Result<()> {
        let mut state = self.rotation.lock();
        let current = self.active.load();
        if current.index() != seen {
            return Ok(());
        }

        let next_index = seen + 1;
        let next = match state.pending.take() {
            Some(slot) if slot.index == next_index => slot.wait()?,
            _ => MappedPage::activate(&self.backing, next_index, self.options.populate)?,
        };

        current.seal();
        self.active.store(Arc::new(next));
        drop(current);
        tracing::debug!(path = %self.backing.path().display(), page = next_index, "rotated page");

        if self.options.prewarm {
            match PrewarmSlot::spawn(Arc::clone(&self.backing), next_index + 1, self.options.populate) {
                Ok(slot) => state.pending = Some(slot),
                Err(err) => {
                    tracing::warn!(page = next_index + 1, error = %err, "could not start pre-warm, next rotation maps inline");
                }
            }
        }
        Ok(())
    }
}
