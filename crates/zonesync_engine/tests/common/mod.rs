//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use zonesync_engine::{
    CollectionSchema, Entity, FieldKind, MemoryRemote, MemoryStore, PrimaryKeyKind, ScalarKind,
    SyncCoordinator, SyncEvent, SyncSettings,
};
use zonesync_record::{FieldValue, RecordId, RemoteRecord, ZoneId};
use zonesync_state::InMemoryBackend;

pub fn zone() -> ZoneId {
    ZoneId::new("NotesZone")
}

pub fn note_schema() -> CollectionSchema {
    CollectionSchema::builder("Note", PrimaryKeyKind::String)
        .field("title", FieldKind::Scalar(ScalarKind::String))
        .optional("body", FieldKind::Scalar(ScalarKind::String))
        .build()
        .unwrap()
}

pub fn tag_schema() -> CollectionSchema {
    CollectionSchema::builder("Tag", PrimaryKeyKind::Int)
        .field("name", FieldKind::Scalar(ScalarKind::String))
        .build()
        .unwrap()
}

pub fn note(key: &str, title: &str) -> Entity {
    Entity::new("Note", key).with("title", title)
}

pub fn remote_note(zone: &ZoneId, name: &str, title: &str) -> RemoteRecord {
    let mut record = RemoteRecord::new("Note", RecordId::new(name, zone.clone()));
    record.set("title", FieldValue::from(title));
    record
}

pub struct Harness {
    pub remote: Arc<MemoryRemote>,
    pub local: Arc<MemoryStore>,
    pub backend: Arc<InMemoryBackend>,
    pub coordinator: SyncCoordinator,
}

impl Harness {
    /// Builds a coordinator over `remote` syncing `Note` and `Tag`.
    ///
    /// Settings are used as given; tests pass `RetryConfig::immediate()`.
    pub fn new(settings: SyncSettings, remote: MemoryRemote) -> Self {
        Self::with_backend(settings, Arc::new(remote), Arc::new(InMemoryBackend::new()))
    }

    pub fn with_backend(
        settings: SyncSettings,
        remote: Arc<MemoryRemote>,
        backend: Arc<InMemoryBackend>,
    ) -> Self {
        let local = Arc::new(MemoryStore::new());
        local.register("Note", PrimaryKeyKind::String);
        local.register("Tag", PrimaryKeyKind::Int);
        Self::assemble(settings, remote, local, backend)
    }

    pub fn assemble(
        settings: SyncSettings,
        remote: Arc<MemoryRemote>,
        local: Arc<MemoryStore>,
        backend: Arc<InMemoryBackend>,
    ) -> Self {
        let coordinator = SyncCoordinator::builder(
            settings,
            remote.clone(),
            local.clone(),
            backend.clone(),
        )
        .with_collection(note_schema())
        .with_collection(tag_schema())
        .build()
        .unwrap();
        Self {
            remote,
            local,
            backend,
            coordinator,
        }
    }
}

/// Drains every event received so far.
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
