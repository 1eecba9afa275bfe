//! # ZoneSync Engine
//!
//! Incremental synchronization between a local object store and a remote,
//! zone-partitioned record store with cursor-based change feeds.
//!
//! This crate provides:
//! - Cursor store (one opaque cursor per database or zone scope)
//! - Record codec (entities to remote records and back)
//! - Error classification and a retry driver with backoff
//! - Fan-out completion tracking for parallel pulls
//! - Zone and subscription management
//! - Syncable collections with persisted pending-mutation queues
//! - The sync coordinator tying these together
//! - In-memory collaborators for testing
//!
//! ## Architecture
//!
//! A cycle runs zone → subscription → pull → push:
//! 1. Create the custom zone once; a new zone receives every local entity
//! 2. Create the silent change subscription once
//! 3. Pull remote changes, applying each record in its own transaction
//! 4. Push queued local mutations in batched writes
//!
//! ## Key Invariants
//!
//! - A cursor is committed only after its discovery call completes
//! - An expired cursor is cleared, never reused
//! - Acknowledging a push never drops mutations queued after its snapshot
//! - A queued delete wins over queued saves of the same entity
//! - Writes are keyed by deterministic record identity, so replays are safe

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod asset;
mod classify;
mod codec;
mod collection;
mod config;
mod coordinator;
mod cursor_store;
mod entity;
mod error;
mod events;
mod fanout;
mod local;
mod memory_remote;
mod remote;
mod retry;
mod schema;
mod zone;

pub use asset::{AssetStore, MemoryAssetStore};
pub use classify::{classify, Outcome, RecoverableReason};
pub use codec::{primary_key_for_record_id, RecordCodec};
pub use collection::{PendingQueue, PreparedPush, PushBatch, SyncableCollection};
pub use config::{
    DatabaseScope, PullStrategy, RetryConfig, SyncDirection, SyncSettings, DEFAULT_PUSH_BATCH_LIMIT,
};
pub use coordinator::{
    FailedItem, PushReport, SyncCoordinator, SyncCoordinatorBuilder, SyncReport, SyncState, SyncStats,
};
pub use cursor_store::CursorStore;
pub use entity::{Entity, LocalValue, PrimaryKey, PrimaryKeyKind};
pub use error::{RemoteError, RemoteErrorKind, SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use fanout::{FanoutStatus, FanoutTracker, FinishedCallback, PartialCallback};
pub use local::{LocalReader, LocalStore, LocalWriter, MemoryStore};
pub use memory_remote::{MemoryRemote, RemoteOp, WriteCall};
pub use remote::{
    DatabaseChange, ItemResult, RemoteService, RemoteStream, Subscription, SubscriptionTarget,
    WriteResult, ZoneChange,
};
pub use retry::{Halt, RetryDriver};
pub use schema::{CollectionSchema, FieldDescriptor, FieldKind, ScalarKind, SchemaBuilder};
pub use zone::{ZoneManager, ZoneStatus};
