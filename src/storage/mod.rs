//! # 持久化键值存储
//!
//! Small string key-value stores standing in for browser local storage.
//! [`RefreshStateStore`] layers the typed throttling fields on top.

mod file;
mod memory;
mod refresh_state;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use refresh_state::{RefreshField, RefreshSnapshot, RefreshStateStore};

use thiserror::Error;

/// Errors raised by a [`KeyValueStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the backing file failed
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Stored content could not be parsed
    #[error("storage content is corrupt: {0}")]
    Corrupt(String),

    /// The store cannot be reached
    #[error("storage is unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Persistent string key-value storage.
///
/// Implementations must be safe to share between tasks. Writes are
/// last-write-wins; there is no locking across processes.
pub trait KeyValueStore: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Delete a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;
}
