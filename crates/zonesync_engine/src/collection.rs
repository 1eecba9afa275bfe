//! Syncable collections and their pending-mutation queues.

use crate::codec::{primary_key_for_record_id, RecordCodec};
use crate::entity::PrimaryKey;
use crate::error::SyncResult;
use crate::local::LocalStore;
use crate::schema::CollectionSchema;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use zonesync_record::{Decode, Encode, RecordId, RemoteRecord, ZoneId};
use zonesync_state::StateBackend;

/// One queued mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Queued {
    key: PrimaryKey,
    seq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueueState {
    saves: Vec<Queued>,
    deletes: Vec<Queued>,
    next_seq: u64,
}

/// A deduplicated snapshot of a pending queue.
///
/// `watermark` is the highest sequence number the snapshot covers;
/// mutations queued after the snapshot have higher numbers and survive
/// its acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushBatch {
    /// Keys to create or update.
    pub saves: Vec<PrimaryKey>,
    /// Keys to delete.
    pub deletes: Vec<PrimaryKey>,
    /// Highest sequence number covered.
    pub watermark: u64,
}

impl PushBatch {
    /// Returns true if there is nothing to push.
    pub fn is_empty(&self) -> bool {
        self.saves.is_empty() && self.deletes.is_empty()
    }

    /// Returns the number of keys in the batch.
    pub fn len(&self) -> usize {
        self.saves.len() + self.deletes.len()
    }
}

/// Persisted queue of local mutations awaiting push.
///
/// All mutations go through one lock and are written back to the state
/// backend before the lock is released.
pub struct PendingQueue {
    state_key: String,
    backend: Arc<dyn StateBackend>,
    state: Mutex<QueueState>,
}

impl PendingQueue {
    /// Loads the queue for `record_type`, empty if none was persisted.
    pub fn load(record_type: &str, backend: Arc<dyn StateBackend>) -> SyncResult<Self> {
        let state_key = format!("queue/{record_type}");
        let state = match backend.get(&state_key)? {
            Some(bytes) => QueueState::decode(&bytes)?,
            None => QueueState::default(),
        };
        Ok(Self {
            state_key,
            backend,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &QueueState) -> SyncResult<()> {
        self.backend.put(&self.state_key, &state.encode()?)?;
        Ok(())
    }

    fn push(&self, key: PrimaryKey, delete: bool) -> SyncResult<()> {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let entry = Queued {
            key,
            seq: state.next_seq,
        };
        if delete {
            state.deletes.push(entry);
        } else {
            state.saves.push(entry);
        }
        self.persist(&state)
    }

    /// Queues a create or update.
    pub fn enqueue_save(&self, key: PrimaryKey) -> SyncResult<()> {
        self.push(key, false)
    }

    /// Queues a delete.
    pub fn enqueue_delete(&self, key: PrimaryKey) -> SyncResult<()> {
        self.push(key, true)
    }

    /// Queues a save for every key without one pending, persisting once.
    ///
    /// Returns the number of keys added.
    pub fn extend_saves(&self, keys: impl IntoIterator<Item = PrimaryKey>) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let mut pending: HashSet<PrimaryKey> = state.saves.iter().map(|q| q.key.clone()).collect();
        let mut added = 0;
        for key in keys {
            if !pending.insert(key.clone()) {
                continue;
            }
            state.next_seq += 1;
            let seq = state.next_seq;
            state.saves.push(Queued { key, seq });
            added += 1;
        }
        if added > 0 {
            self.persist(&state)?;
        }
        Ok(added)
    }

    /// Returns the number of raw queued entries.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.saves.len() + state.deletes.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes a deduplicated snapshot. A key queued for deletion is never
    /// also saved.
    pub fn snapshot(&self) -> PushBatch {
        let state = self.state.lock();

        let mut deletes = Vec::new();
        let mut deleted = HashSet::new();
        for entry in &state.deletes {
            if deleted.insert(&entry.key) {
                deletes.push(entry.key.clone());
            }
        }

        let mut saves = Vec::new();
        let mut saved = HashSet::new();
        for entry in &state.saves {
            if !deleted.contains(&entry.key) && saved.insert(&entry.key) {
                saves.push(entry.key.clone());
            }
        }

        PushBatch {
            saves,
            deletes,
            watermark: state.next_seq,
        }
    }

    /// Removes entries covered by `batch` whose key is in `succeeded`.
    ///
    /// Returns the number of entries removed.
    pub fn acknowledge(&self, batch: &PushBatch, succeeded: &HashSet<PrimaryKey>) -> SyncResult<usize> {
        let mut state = self.state.lock();
        let before = state.saves.len() + state.deletes.len();
        let done = |e: &Queued| e.seq <= batch.watermark && succeeded.contains(&e.key);
        state.saves.retain(|e| !done(e));
        state.deletes.retain(|e| !done(e));
        let removed = before - (state.saves.len() + state.deletes.len());
        if removed > 0 {
            self.persist(&state)?;
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("state_key", &self.state_key)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Records and identities ready for one remote write.
#[derive(Debug, Default)]
pub struct PreparedPush {
    /// Records to save.
    pub to_save: Vec<RemoteRecord>,
    /// Records to delete.
    pub to_delete: Vec<RecordId>,
    /// Maps each record identity back to its local key.
    pub keys: HashMap<RecordId, PrimaryKey>,
    /// Saves whose entity no longer exists locally; nothing to send.
    pub vanished: Vec<PrimaryKey>,
}

/// One mapped local collection.
#[derive(Debug)]
pub struct SyncableCollection {
    schema: Arc<CollectionSchema>,
    zone: ZoneId,
    queue: PendingQueue,
}

impl SyncableCollection {
    /// Creates a collection, loading its persisted queue.
    pub fn new(
        schema: CollectionSchema,
        zone: ZoneId,
        backend: Arc<dyn StateBackend>,
    ) -> SyncResult<Self> {
        let queue = PendingQueue::load(&schema.record_type, backend)?;
        Ok(Self {
            schema: Arc::new(schema),
            zone,
            queue,
        })
    }

    /// Returns the record type.
    pub fn record_type(&self) -> &str {
        &self.schema.record_type
    }

    /// Returns the schema.
    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// Returns the zone the collection's records live in.
    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    /// Queues a create or update of `key`.
    pub fn enqueue_save(&self, key: impl Into<PrimaryKey>) -> SyncResult<()> {
        self.queue.enqueue_save(key.into())
    }

    /// Queues a delete of `key`.
    pub fn enqueue_delete(&self, key: impl Into<PrimaryKey>) -> SyncResult<()> {
        self.queue.enqueue_delete(key.into())
    }

    /// Queues every entity currently in the local collection for upload.
    ///
    /// Keys that already have a save pending are not queued twice.
    /// Returns the number of keys added.
    pub fn enqueue_all(&self, store: &dyn LocalStore) -> SyncResult<usize> {
        let keys = store.keys(self.record_type())?;
        self.queue.extend_saves(keys)
    }

    /// Returns the number of raw queued entries.
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    /// Takes a deduplicated snapshot of the queue.
    pub fn snapshot(&self) -> PushBatch {
        self.queue.snapshot()
    }

    /// Acknowledges the keys of `batch` that reached the remote store.
    pub fn acknowledge(&self, batch: &PushBatch, succeeded: &HashSet<PrimaryKey>) -> SyncResult<usize> {
        self.queue.acknowledge(batch, succeeded)
    }

    /// Encodes a snapshot into remote records.
    pub fn prepare(
        &self,
        batch: &PushBatch,
        codec: &RecordCodec,
        store: &dyn LocalStore,
    ) -> SyncResult<PreparedPush> {
        let mut prepared = PreparedPush::default();
        for key in &batch.saves {
            match store.get(self.record_type(), key)? {
                Some(entity) => {
                    let record = codec.to_remote(&self.schema, &self.zone, &entity)?;
                    prepared.keys.insert(record.id.clone(), key.clone());
                    prepared.to_save.push(record);
                }
                None => {
                    debug!(record_type = %self.record_type(), %key, "queued entity no longer exists");
                    prepared.vanished.push(key.clone());
                }
            }
        }
        for key in &batch.deletes {
            let id = RecordCodec::record_id(key, &self.zone);
            prepared.keys.insert(id.clone(), key.clone());
            prepared.to_delete.push(id);
        }
        Ok(prepared)
    }

    /// Applies a changed remote record in one local transaction.
    pub fn apply_changed(
        &self,
        record: &RemoteRecord,
        codec: &RecordCodec,
        store: &dyn LocalStore,
    ) -> SyncResult<()> {
        store.write(&mut |writer| {
            let entity = codec.from_remote(&self.schema, record, &*writer)?;
            writer.put(entity)
        })
    }

    /// Applies a remote deletion in one local transaction.
    ///
    /// Returns true if a local entity was removed.
    pub fn apply_deleted(&self, record_id: &RecordId, store: &dyn LocalStore) -> SyncResult<bool> {
        let key = primary_key_for_record_id(self.record_type(), self.schema.primary_key, record_id)?;
        let mut removed = false;
        store.write(&mut |writer| {
            removed = writer.delete(self.record_type(), &key)?;
            Ok(())
        })?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::MemoryAssetStore;
    use crate::entity::{Entity, PrimaryKeyKind};
    use crate::local::MemoryStore;
    use crate::schema::{FieldKind, ScalarKind};
    use zonesync_state::InMemoryBackend;

    fn notes(backend: Arc<dyn StateBackend>) -> SyncableCollection {
        let schema = CollectionSchema::builder("Note", PrimaryKeyKind::String)
            .field("title", FieldKind::Scalar(ScalarKind::String))
            .build()
            .unwrap();
        SyncableCollection::new(schema, ZoneId::new("NotesZone"), backend).unwrap()
    }

    fn keys(items: &[&str]) -> HashSet<PrimaryKey> {
        items.iter().map(|k| PrimaryKey::from(*k)).collect()
    }

    #[test]
    fn delete_wins_over_saves() {
        let notes = notes(Arc::new(InMemoryBackend::new()));
        for _ in 0..3 {
            notes.enqueue_save("n1").unwrap();
        }
        notes.enqueue_delete("n1").unwrap();
        notes.enqueue_save("n2").unwrap();

        let batch = notes.snapshot();
        assert_eq!(batch.deletes, vec![PrimaryKey::from("n1")]);
        assert_eq!(batch.saves, vec![PrimaryKey::from("n2")]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn acknowledge_keeps_later_entries() {
        let notes = notes(Arc::new(InMemoryBackend::new()));
        notes.enqueue_save("n1").unwrap();
        let batch = notes.snapshot();

        // edited again while the write was in flight
        notes.enqueue_save("n1").unwrap();

        let removed = notes.acknowledge(&batch, &keys(&["n1"])).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(notes.pending_len(), 1);
        assert_eq!(notes.snapshot().saves, vec![PrimaryKey::from("n1")]);
    }

    #[test]
    fn acknowledge_keeps_failed_keys() {
        let notes = notes(Arc::new(InMemoryBackend::new()));
        notes.enqueue_save("ok").unwrap();
        notes.enqueue_save("failed").unwrap();
        let batch = notes.snapshot();

        notes.acknowledge(&batch, &keys(&["ok"])).unwrap();
        assert_eq!(notes.snapshot().saves, vec![PrimaryKey::from("failed")]);
    }

    #[test]
    fn successful_delete_clears_superseded_saves() {
        let notes = notes(Arc::new(InMemoryBackend::new()));
        notes.enqueue_save("n1").unwrap();
        notes.enqueue_delete("n1").unwrap();
        let batch = notes.snapshot();

        notes.acknowledge(&batch, &keys(&["n1"])).unwrap();
        assert_eq!(notes.pending_len(), 0);
    }

    #[test]
    fn queue_survives_reload() {
        let backend: Arc<dyn StateBackend> = Arc::new(InMemoryBackend::new());
        {
            let notes = notes(Arc::clone(&backend));
            notes.enqueue_save("n1").unwrap();
            notes.enqueue_delete("n2").unwrap();
        }
        let notes = notes(backend);
        assert_eq!(notes.pending_len(), 2);

        // sequence numbers continue after reload
        let batch = notes.snapshot();
        notes.enqueue_save("n3").unwrap();
        assert!(notes.snapshot().watermark > batch.watermark);
    }

    #[derive(Default)]
    struct CountingBackend {
        inner: InMemoryBackend,
        puts: std::sync::atomic::AtomicUsize,
    }

    impl StateBackend for CountingBackend {
        fn get(&self, key: &str) -> zonesync_state::StateResult<Option<Vec<u8>>> {
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &[u8]) -> zonesync_state::StateResult<()> {
            self.puts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.put(key, value)
        }
        fn remove(&self, key: &str) -> zonesync_state::StateResult<()> {
            self.inner.remove(key)
        }
        fn keys_with_prefix(&self, prefix: &str) -> zonesync_state::StateResult<Vec<String>> {
            self.inner.keys_with_prefix(prefix)
        }
        fn flush(&self) -> zonesync_state::StateResult<()> {
            self.inner.flush()
        }
    }

    #[test]
    fn enqueue_all_persists_once() {
        let backend = Arc::new(CountingBackend::default());
        let notes = notes(backend.clone());
        notes.enqueue_save("n3").unwrap();
        let store = MemoryStore::new();
        store.register("Note", PrimaryKeyKind::String);
        for i in 0..50 {
            store.insert(Entity::new("Note", format!("n{i}")).with("title", "x")).unwrap();
        }
        let puts_before = backend.puts.load(std::sync::atomic::Ordering::SeqCst);

        let added = notes.enqueue_all(&store).unwrap();

        assert_eq!(added, 49);
        assert_eq!(notes.pending_len(), 50);
        assert_eq!(backend.puts.load(std::sync::atomic::Ordering::SeqCst), puts_before + 1);
        assert_eq!(notes.enqueue_all(&store).unwrap(), 0);
    }

    #[test]
    fn prepare_and_apply() {
        let notes = notes(Arc::new(InMemoryBackend::new()));
        let codec = RecordCodec::new(Arc::new(MemoryAssetStore::new()));
        let store = MemoryStore::new();
        store.register("Note", PrimaryKeyKind::String);
        store.insert(Entity::new("Note", "n1").with("title", "hi")).unwrap();

        notes.enqueue_save("n1").unwrap();
        notes.enqueue_save("ghost").unwrap();
        notes.enqueue_delete("n0").unwrap();

        let prepared = notes.prepare(&notes.snapshot(), &codec, &store).unwrap();
        assert_eq!(prepared.to_save.len(), 1);
        assert_eq!(prepared.to_delete, vec![RecordId::new("n0", ZoneId::new("NotesZone"))]);
        assert_eq!(prepared.vanished, vec![PrimaryKey::from("ghost")]);
        assert_eq!(prepared.keys.len(), 2);

        let other = MemoryStore::new();
        other.register("Note", PrimaryKeyKind::String);
        notes.apply_changed(&prepared.to_save[0], &codec, &other).unwrap();
        assert_eq!(other.len("Note"), 1);

        assert!(notes.apply_deleted(&prepared.to_save[0].id, &other).unwrap());
        assert!(!notes.apply_deleted(&prepared.to_save[0].id, &other).unwrap());
        assert_eq!(other.len("Note"), 0);
    }
}
