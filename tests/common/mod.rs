#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use pagelog::{LevelFilter, LogConfig, Logger};
use tempfile::TempDir;

pub const PAGE: u64 = 64 * 1024;

static TRACING: Once = Once::new();

/// Routes the crate's own diagnostics to the test output, filtered by
/// `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn config(dir: &TempDir) -> LogConfig {
    LogConfig::new(dir.path().join("test.binlog"))
        .with_page_size(PAGE)
        .with_string_page_size(PAGE)
        .with_grow_pages(2)
        .with_level(LevelFilter::Trace)
        .with_shm_dir(dir.path())
}

pub fn logger() -> (TempDir, Logger) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let logger = Logger::open(config(&dir)).unwrap();
    (dir, logger)
}

pub fn log_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.binlog")
}
