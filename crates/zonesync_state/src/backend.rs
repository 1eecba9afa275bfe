//! State backend trait definition.

use crate::error::StateResult;

/// A persisted key/blob store for sync bookkeeping.
///
/// State backends are **opaque blob stores**. The sync engine owns the
/// meaning of every key and value; backends never inspect them.
///
/// # Invariants
///
/// - `get` returns exactly the bytes passed to the last `put` for that key
/// - `remove` makes the key absent, it does not store an empty value
/// - `flush` ensures every completed `put`/`remove` survives process exit
/// - All methods serialize internally; callers never lock around them
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent state
pub trait StateBackend: Send + Sync {
    /// Returns the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn put(&self, key: &str, value: &[u8]) -> StateResult<()>;

    /// Removes `key`. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn remove(&self, key: &str) -> StateResult<()>;

    /// Returns every key starting with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn keys_with_prefix(&self, prefix: &str) -> StateResult<Vec<String>>;

    /// Flushes all completed writes to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StateResult<()>;

    /// Returns true if a value is stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    fn contains(&self, key: &str) -> StateResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}
