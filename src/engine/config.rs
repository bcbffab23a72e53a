use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    // Directory holding the table files
    pub root_path: PathBuf,

    // Seal the active memtable once it holds this many bytes
    #[serde(default = "default_table_byte_size")]
    pub table_byte_size: usize,

    // Sealed memtables allowed to wait for flush before writers block
    #[serde(default = "default_memtable_pool_size")]
    pub memtable_pool_size: usize,

    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    // Wait for the flush worker on close before interrupting it
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    #[serde(default = "default_flush_retry_attempts")]
    pub flush_retry_attempts: u32,

    // First wait between flush attempts, doubled on every retry
    #[serde(default = "default_flush_retry_backoff")]
    pub flush_retry_backoff: Duration,
}

impl Config {
    pub fn default_config_with_path(root_path: impl Into<PathBuf>) -> Self {
        Config {
            root_path: root_path.into(),
            table_byte_size: default_table_byte_size(),
            memtable_pool_size: default_memtable_pool_size(),
            worker_threads: default_worker_threads(),
            shutdown_timeout: default_shutdown_timeout(),
            flush_retry_attempts: default_flush_retry_attempts(),
            flush_retry_backoff: default_flush_retry_backoff(),
        }
    }
}

#[inline]
fn default_table_byte_size() -> usize {
    4 * 1024 * 1024
}

#[inline]
fn default_memtable_pool_size() -> usize {
    2
}

#[inline]
fn default_worker_threads() -> usize {
    4
}

#[inline]
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(60)
}

#[inline]
fn default_flush_retry_attempts() -> u32 {
    3
}

#[inline]
fn default_flush_retry_backoff() -> Duration {
    Duration::from_millis(100)
}
