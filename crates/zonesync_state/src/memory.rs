//! In-memory state backend for testing.

use crate::backend::StateBackend;
use crate::error::StateResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// An in-memory state backend.
///
/// This backend keeps all state in a map and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Hosts that rebuild sync state from scratch on every launch
///
/// # Example
///
/// ```rust
/// use zonesync_state::{StateBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("flag/subscription/db", &[1]).unwrap();
/// assert!(backend.contains("flag/subscription/db").unwrap());
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every stored entry.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries.read().clone()
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StateBackend for InMemoryBackend {
    fn get(&self, key: &str) -> StateResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StateResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StateResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StateResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn flush(&self) -> StateResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get() {
        let backend = InMemoryBackend::new();
        backend.put("a", b"1").unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("b").unwrap(), None);
    }

    #[test]
    fn put_replaces() {
        let backend = InMemoryBackend::new();
        backend.put("a", b"1").unwrap();
        backend.put("a", b"2").unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn remove_makes_key_absent() {
        let backend = InMemoryBackend::new();
        backend.put("a", b"1").unwrap();
        backend.remove("a").unwrap();
        assert!(!backend.contains("a").unwrap());
        assert!(backend.is_empty());

        // Removing again is fine
        backend.remove("a").unwrap();
    }

    #[test]
    fn prefix_scan() {
        let backend = InMemoryBackend::new();
        backend.put("cursor/zone/a", b"1").unwrap();
        backend.put("cursor/zone/b", b"2").unwrap();
        backend.put("cursor/database", b"3").unwrap();
        backend.put("flag/x", b"4").unwrap();

        let keys = backend.keys_with_prefix("cursor/zone/").unwrap();
        assert_eq!(keys, vec!["cursor/zone/a", "cursor/zone/b"]);

        let keys = backend.keys_with_prefix("cursor/").unwrap();
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn empty_value_is_distinct_from_absent() {
        let backend = InMemoryBackend::new();
        backend.put("a", b"").unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(Vec::new()));
    }
}
