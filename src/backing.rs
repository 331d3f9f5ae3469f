//! The file a page sequence maps its pages from.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::{Error, Result};

/// A growable backing file addressed in fixed-size pages.
///
/// Page `i` covers bytes `[i * page_size, (i + 1) * page_size)`. The file must
/// outlive every mapping taken from it, which the sequencers guarantee by
/// sharing it through an `Arc`.
pub struct Backing {
    path: PathBuf,
    file: File,
    page_size: u64,
    grow_pages: u64,
    len: Mutex<u64>,
}

impl Backing {
    /// Creates (or truncates) a backing file owned by this process.
    pub fn create(path: impl AsRef<Path>, page_size: u64, grow_pages: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|source| Error::Create {
                path: path.clone(),
                source,
            })?;
        Ok(Self::from_file(path, file, 0, page_size, grow_pages))
    }

    /// Opens a backing file that other processes may be appending to.
    /// Existing contents are kept.
    pub fn open_shared(path: impl AsRef<Path>, page_size: u64, grow_pages: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| Error::Create {
                path: path.clone(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| Error::Create {
                path: path.clone(),
                source,
            })?
            .len();
        Ok(Self::from_file(path, file, len, page_size, grow_pages))
    }

    fn from_file(path: PathBuf, file: File, len: u64, page_size: u64, grow_pages: u64) -> Self {
        Self {
            path,
            file,
            page_size,
            grow_pages: grow_pages.max(1),
            len: Mutex::new(len),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes per page. Page `i` starts at `i * page_size`.
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Current length of the file as last observed by this handle.
    pub fn len(&self) -> u64 {
        *self.len.lock()
    }

    /// Grows the file so that page `index` lies inside it. The file is
    /// extended by `grow_pages` pages at a time and never shrunk.
    pub fn ensure_page(&self, index: u64) -> Result<()> {
        let required = (index + 1).saturating_mul(self.page_size);
        let mut len = self.len.lock();
        if *len >= required {
            return Ok(());
        }

        // Another process sharing the file may already have grown it.
        if let Ok(meta) = self.file.metadata() {
            *len = (*len).max(meta.len());
            if *len >= required {
                return Ok(());
            }
        }

        let target = required.saturating_add((self.grow_pages - 1).saturating_mul(self.page_size));
        self.file.set_len(target).map_err(|source| Error::Grow {
            path: self.path.clone(),
            len: target,
            source,
        })?;
        tracing::trace!(path = %self.path.display(), from = *len, to = target, "grew backing file");
        *len = target;
        Ok(())
    }

    /// Maps page `index` read-write. The page must already lie inside the
    /// file (see [`ensure_page`](Self::ensure_page)).
    pub fn map_page(&self, index: u64, populate: bool) -> Result<MmapMut> {
        let mut options = MmapOptions::new();
        options
            .offset(index.saturating_mul(self.page_size))
            .len(self.page_size as usize);
        if populate {
            options.populate();
        }
        // SAFETY: the file is only ever modified through page mappings whose
        // byte ranges are handed out by exclusive reservations.
        unsafe { options.map_mut(&self.file) }.map_err(|source| Error::Map {
            path: self.path.clone(),
            index,
            source,
        })
    }
}
