//! Remote service collaborator.
//!
//! Discovery calls stream their results: progress events arrive as the
//! service returns pages, and every successful call ends with exactly one
//! `Completed` event carrying the cursor to commit. A stream that ends
//! without `Completed` did not complete.

use crate::error::RemoteError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use zonesync_record::{Cursor, RecordId, RemoteRecord, ZoneId};

/// A stream of remote results.
pub type RemoteStream<'a, T> = BoxStream<'a, Result<T, RemoteError>>;

/// Event of a database-level discovery call.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseChange {
    /// A zone has changes.
    ZoneChanged(ZoneId),
    /// A zone was deleted.
    ZoneDeleted(ZoneId),
    /// Progress; the cursor after the page just delivered.
    CursorUpdated(Cursor),
    /// The call completed.
    Completed {
        /// Cursor to commit; `None` means "the last progress cursor".
        cursor: Option<Cursor>,
        /// Whether another call would return more changes.
        more_coming: bool,
    },
}

/// Event of a zone-level discovery call.
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneChange {
    /// A record was created or updated.
    RecordChanged(RemoteRecord),
    /// A record was deleted.
    RecordDeleted {
        /// Identity of the deleted record.
        record_id: RecordId,
        /// Its record type.
        record_type: String,
    },
    /// Progress; the cursor after the page just delivered.
    CursorUpdated(Cursor),
    /// The call completed.
    Completed {
        /// Cursor to commit; `None` means "the last progress cursor".
        cursor: Option<Cursor>,
        /// Whether another call would return more changes.
        more_coming: bool,
    },
}

/// Outcome of one item of a batched write.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    /// The item.
    pub record_id: RecordId,
    /// `Ok` if it was written.
    pub result: Result<(), RemoteError>,
}

/// Per-item outcomes of a batched write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    /// Outcomes of the saves.
    pub saved: Vec<ItemResult>,
    /// Outcomes of the deletes.
    pub deleted: Vec<ItemResult>,
}

/// What a subscription watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    /// Every change in the database.
    Database,
    /// Creates, updates and deletes of one record type.
    RecordType(String),
}

/// A push-notification subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Stable identifier.
    pub id: String,
    /// What is watched.
    pub target: SubscriptionTarget,
    /// Whether notifications are delivered without a visible alert.
    pub silent: bool,
}

/// The remote record store.
///
/// Writes are keyed by deterministic record identity, so replaying a
/// write is safe.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Streams which zones changed since `cursor`.
    fn discover_database_changes(&self, cursor: Option<Cursor>) -> RemoteStream<'_, DatabaseChange>;

    /// Streams changed and deleted records of `zone` since `cursor`.
    fn discover_zone_changes(&self, zone: &ZoneId, cursor: Option<Cursor>) -> RemoteStream<'_, ZoneChange>;

    /// Streams every record of `record_type` in `zone`.
    fn query_all(&self, zone: &ZoneId, record_type: &str) -> RemoteStream<'_, RemoteRecord>;

    /// Saves and deletes records in one call.
    ///
    /// A call-level error means nothing was written; item-level errors
    /// are reported in the result.
    async fn write_records(
        &self,
        zone: &ZoneId,
        to_save: Vec<RemoteRecord>,
        to_delete: Vec<RecordId>,
    ) -> Result<WriteResult, RemoteError>;

    /// Creates a zone; creating an existing zone succeeds.
    async fn create_zone(&self, zone: &ZoneId) -> Result<(), RemoteError>;

    /// Creates or replaces a subscription.
    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), RemoteError>;
}
