use std::time::Duration;

use thiserror::Error;

mod memory;
mod rocks;

pub use memory::MemoryBackend;
pub use rocks::RocksBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("backend lock was poisoned")]
    Poisoned,
    #[error("failed to decode stored entry: {0}")]
    Codec(#[from] bincode::Error),
}

/// A value to write, plus how long the backend should keep it around.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub value: Vec<u8>,
    pub ttl: Option<Duration>,
}

impl Entry {
    pub const fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self { value, ttl }
    }
}

/// Key-value storage the paste store is built on.
///
/// Entries whose TTL has lapsed must read as absent everywhere, whether or not
/// they have been physically removed yet.
pub trait Backend: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Atomically replaces the live value at `key` with `new` if the live value
    /// is currently `expected`. `None` on either side means "absent", so this
    /// doubles as create-if-absent and as a conditional delete.
    ///
    /// Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Entry>,
    ) -> Result<bool, BackendError>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Physically removes entries whose TTL lapsed, returning how many went.
    fn purge_expired(&self) -> Result<usize, BackendError>;

    fn ping(&self) -> Result<(), BackendError>;
}
