//! Logger configuration.

use std::path::{Path, PathBuf};

use crate::level::LevelFilter;
use crate::{Error, Result};

/// Pages must be a multiple of this, the coarsest mapping granularity
/// among supported platforms.
pub const PAGE_ALIGN: u64 = 64 * 1024;

/// Largest page a sequencer will map.
pub const MAX_PAGE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default record page: 1 MiB.
pub const DEFAULT_PAGE_SIZE: u64 = 1024 * 1024;

/// Default string page: 1 MiB.
pub const DEFAULT_STRING_PAGE_SIZE: u64 = 1024 * 1024;

/// Suffix appended to the primary file name to name the strings file.
pub const STRINGS_SUFFIX: &str = ".strings";

/// Configuration for a [`Logger`](crate::Logger) or
/// [`SharedLogger`](crate::SharedLogger).
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Primary record file.
    pub path: PathBuf,
    /// Size of one record page in bytes.
    pub page_size: u64,
    /// Size of one string page in bytes.
    pub string_page_size: u64,
    /// How many pages the backing file grows by when it runs out.
    pub grow_pages: u64,
    /// Prepare the next page on a background thread.
    pub prewarm: bool,
    /// Pre-fault page mappings when they are created.
    pub populate: bool,
    /// Initial level threshold.
    pub level: LevelFilter,
    /// Directory holding named shared segments (interprocess variant only).
    pub shm_dir: PathBuf,
}

impl LogConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            string_page_size: DEFAULT_STRING_PAGE_SIZE,
            grow_pages: 16,
            prewarm: false,
            populate: false,
            level: LevelFilter::default(),
            shm_dir: default_shm_dir(),
        }
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_string_page_size(mut self, page_size: u64) -> Self {
        self.string_page_size = page_size;
        self
    }

    pub fn with_grow_pages(mut self, pages: u64) -> Self {
        self.grow_pages = pages;
        self
    }

    pub fn with_prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = prewarm;
        self
    }

    pub fn with_populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    pub fn with_level(mut self, level: LevelFilter) -> Self {
        self.level = level;
        self
    }

    pub fn with_shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = dir.into();
        self
    }

    /// Path of the string interning file: the primary path plus
    /// [`STRINGS_SUFFIX`].
    pub fn strings_path(&self) -> PathBuf {
        strings_path_for(&self.path)
    }

    pub fn validate(&self) -> Result<()> {
        validate_page_size(self.page_size)?;
        validate_page_size(self.string_page_size)?;
        if self.grow_pages == 0 {
            return Err(Error::InvalidConfig("grow_pages must be at least 1".into()));
        }
        if self.path.file_name().is_none() {
            return Err(Error::InvalidConfig(format!(
                "log path {} has no file name",
                self.path.display()
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_page_size(page_size: u64) -> Result<()> {
    if page_size == 0 || page_size % PAGE_ALIGN != 0 || page_size > MAX_PAGE_SIZE {
        return Err(Error::InvalidConfig(format!(
            "page size {page_size} must be a non-zero multiple of {PAGE_ALIGN} no larger than {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

/// Derives the strings file name from a primary log path.
pub fn strings_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(STRINGS_SUFFIX);
    PathBuf::from(name)
}

fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}
