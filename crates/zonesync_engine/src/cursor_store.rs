//! Persisted change cursors.

use crate::error::SyncResult;
use std::sync::Arc;
use tracing::debug;
use zonesync_record::{Cursor, SyncScope};
use zonesync_state::StateBackend;

const PREFIX: &str = "cursor/";

/// Persists one opaque cursor per sync scope.
///
/// Tokens are stored byte-for-byte and never inspected. A missing entry
/// means "resync from the beginning".
#[derive(Clone)]
pub struct CursorStore {
    backend: Arc<dyn StateBackend>,
}

impl CursorStore {
    /// Creates a cursor store over `backend`.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self { backend }
    }

    fn key(scope: &SyncScope) -> String {
        format!("{PREFIX}{}", scope.storage_key())
    }

    /// Returns the committed cursor for `scope`.
    pub fn get(&self, scope: &SyncScope) -> SyncResult<Option<Cursor>> {
        Ok(self.backend.get(&Self::key(scope))?.map(Cursor::from))
    }

    /// Commits `cursor` for `scope`.
    pub fn set(&self, scope: &SyncScope, cursor: &Cursor) -> SyncResult<()> {
        debug!(%scope, len = cursor.len(), "committing cursor");
        self.backend.put(&Self::key(scope), cursor.as_bytes())?;
        Ok(())
    }

    /// Removes the cursor for `scope`; the next discovery starts empty.
    pub fn clear(&self, scope: &SyncScope) -> SyncResult<()> {
        debug!(%scope, "clearing cursor");
        self.backend.remove(&Self::key(scope))?;
        Ok(())
    }

    /// Removes every stored cursor.
    pub fn clear_all(&self) -> SyncResult<()> {
        for key in self.backend.keys_with_prefix(PREFIX)? {
            self.backend.remove(&key)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zonesync_record::ZoneId;
    use zonesync_state::{FileBackend, InMemoryBackend};

    fn store() -> CursorStore {
        CursorStore::new(Arc::new(InMemoryBackend::new()))
    }

    #[test]
    fn missing_cursor_is_none() {
        assert!(store().get(&SyncScope::Database).unwrap().is_none());
    }

    #[test]
    fn scopes_are_independent() {
        let store = store();
        let zone = SyncScope::Zone(ZoneId::new("NotesZone"));

        store.set(&SyncScope::Database, &Cursor::from(vec![1])).unwrap();
        store.set(&zone, &Cursor::from(vec![2, 2])).unwrap();

        assert_eq!(store.get(&SyncScope::Database).unwrap(), Some(Cursor::from(vec![1])));
        assert_eq!(store.get(&zone).unwrap(), Some(Cursor::from(vec![2, 2])));

        store.clear(&zone).unwrap();
        assert!(store.get(&zone).unwrap().is_none());
        assert!(store.get(&SyncScope::Database).unwrap().is_some());
    }

    #[test]
    fn clear_all_removes_every_scope() {
        let store = store();
        store.set(&SyncScope::Database, &Cursor::from(vec![1])).unwrap();
        store
            .set(&SyncScope::Zone(ZoneId::new("A")), &Cursor::from(vec![2]))
            .unwrap();

        store.clear_all().unwrap();
        assert!(store.get(&SyncScope::Database).unwrap().is_none());
        assert!(store.get(&SyncScope::Zone(ZoneId::new("A"))).unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.journal");
        let token = Cursor::from(vec![0xde, 0xad, 0xbe, 0xef]);
        let zone = SyncScope::Zone(ZoneId::new("NotesZone"));

        {
            let store = CursorStore::new(Arc::new(FileBackend::open(&path).unwrap()));
            store.set(&zone, &token).unwrap();
        }

        let store = CursorStore::new(Arc::new(FileBackend::open(&path).unwrap()));
        assert_eq!(store.get(&zone).unwrap(), Some(token));
    }
}
