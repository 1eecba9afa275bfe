//! Local store collaborator.
//!
//! The engine never owns the local object store. It reads entities by
//! primary key, learns each collection's key scheme, and applies remote
//! changes inside the store's own write transactions.

use crate::entity::{Entity, PrimaryKey, PrimaryKeyKind};
use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Read access to the local store.
pub trait LocalReader {
    /// Returns the key scheme of `collection`, or `None` if no such
    /// collection exists.
    fn primary_key_kind(&self, collection: &str) -> Option<PrimaryKeyKind>;

    /// Resolves an entity by primary key.
    fn get(&self, collection: &str, key: &PrimaryKey) -> SyncResult<Option<Entity>>;

    /// Lists every primary key of `collection`.
    fn keys(&self, collection: &str) -> SyncResult<Vec<PrimaryKey>>;
}

/// Write access inside one transaction.
pub trait LocalWriter: LocalReader {
    /// Inserts or replaces an entity.
    fn put(&mut self, entity: Entity) -> SyncResult<()>;

    /// Deletes an entity, returning true if it existed.
    fn delete(&mut self, collection: &str, key: &PrimaryKey) -> SyncResult<bool>;
}

/// A local object store.
///
/// `write` is the transaction boundary: either every change made through
/// the writer becomes visible, or (when the closure fails) none does.
pub trait LocalStore: LocalReader + Send + Sync {
    /// Runs `f` in one write transaction.
    fn write(
        &self,
        f: &mut dyn FnMut(&mut dyn LocalWriter) -> SyncResult<()>,
    ) -> SyncResult<()>;
}

#[derive(Debug, Clone, Default)]
struct Collections {
    kinds: HashMap<String, PrimaryKeyKind>,
    entities: HashMap<String, BTreeMap<PrimaryKey, Entity>>,
}

impl Collections {
    fn require(&self, collection: &str) -> SyncResult<()> {
        if self.kinds.contains_key(collection) {
            Ok(())
        } else {
            Err(SyncError::UnknownCollection(collection.to_string()))
        }
    }

    fn get(&self, collection: &str, key: &PrimaryKey) -> SyncResult<Option<Entity>> {
        self.require(collection)?;
        Ok(self
            .entities
            .get(collection)
            .and_then(|c| c.get(key))
            .cloned())
    }

    fn keys(&self, collection: &str) -> SyncResult<Vec<PrimaryKey>> {
        self.require(collection)?;
        Ok(self
            .entities
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn put(&mut self, entity: Entity) -> SyncResult<()> {
        let Some(kind) = self.kinds.get(&entity.collection) else {
            return Err(SyncError::UnknownCollection(entity.collection));
        };
        if entity.key.kind() != *kind {
            return Err(SyncError::Local(format!(
                "{} expects {kind:?} keys, got {}",
                entity.collection, entity.key
            )));
        }
        self.entities
            .entry(entity.collection.clone())
            .or_default()
            .insert(entity.key.clone(), entity);
        Ok(())
    }

    fn delete(&mut self, collection: &str, key: &PrimaryKey) -> SyncResult<bool> {
        self.require(collection)?;
        Ok(self
            .entities
            .get_mut(collection)
            .and_then(|c| c.remove(key))
            .is_some())
    }
}

/// An in-memory local store for testing.
///
/// Transactions work on a copy of the data that replaces the committed
/// state only when the closure succeeds. Writers are serialized.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Collections>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a collection and its key scheme.
    pub fn register(&self, collection: impl Into<String>, kind: PrimaryKeyKind) {
        self.state.write().kinds.insert(collection.into(), kind);
    }

    /// Inserts or replaces an entity outside any sync transaction.
    pub fn insert(&self, entity: Entity) -> SyncResult<()> {
        self.state.write().put(entity)
    }

    /// Deletes an entity outside any sync transaction.
    pub fn remove(&self, collection: &str, key: &PrimaryKey) -> SyncResult<bool> {
        self.state.write().delete(collection, key)
    }

    /// Returns every entity of `collection`, ordered by key.
    pub fn all(&self, collection: &str) -> Vec<Entity> {
        self.state
            .read()
            .entities
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of entities in `collection`.
    pub fn len(&self, collection: &str) -> usize {
        self.state
            .read()
            .entities
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

impl LocalReader for MemoryStore {
    fn primary_key_kind(&self, collection: &str) -> Option<PrimaryKeyKind> {
        self.state.read().kinds.get(collection).copied()
    }

    fn get(&self, collection: &str, key: &PrimaryKey) -> SyncResult<Option<Entity>> {
        self.state.read().get(collection, key)
    }

    fn keys(&self, collection: &str) -> SyncResult<Vec<PrimaryKey>> {
        self.state.read().keys(collection)
    }
}

impl LocalStore for MemoryStore {
    fn write(
        &self,
        f: &mut dyn FnMut(&mut dyn LocalWriter) -> SyncResult<()>,
    ) -> SyncResult<()> {
        let mut committed = self.state.write();
        let mut staged = MemoryWriter {
            state: committed.clone(),
        };
        f(&mut staged)?;
        *committed = staged.state;
        Ok(())
    }
}

struct MemoryWriter {
    state: Collections,
}

impl LocalReader for MemoryWriter {
    fn primary_key_kind(&self, collection: &str) -> Option<PrimaryKeyKind> {
        self.state.kinds.get(collection).copied()
    }

    fn get(&self, collection: &str, key: &PrimaryKey) -> SyncResult<Option<Entity>> {
        self.state.get(collection, key)
    }

    fn keys(&self, collection: &str) -> SyncResult<Vec<PrimaryKey>> {
        self.state.keys(collection)
    }
}

impl LocalWriter for MemoryWriter {
    fn put(&mut self, entity: Entity) -> SyncResult<()> {
        self.state.put(entity)
    }

    fn delete(&mut self, collection: &str, key: &PrimaryKey) -> SyncResult<bool> {
        self.state.delete(collection, key)
    }
}
