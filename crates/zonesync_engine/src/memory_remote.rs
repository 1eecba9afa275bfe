//! In-memory remote service for testing.

use crate::error::{RemoteError, RemoteErrorKind};
use crate::remote::{
    DatabaseChange, ItemResult, RemoteService, RemoteStream, Subscription, WriteResult, ZoneChange,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use zonesync_record::{Cursor, Decode, Encode, RecordId, RemoteRecord, ZoneId};

/// Remote calls, for failure scripting and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    /// `discover_database_changes`.
    DatabaseChanges,
    /// `discover_zone_changes`.
    ZoneChanges,
    /// `query_all`.
    QueryAll,
    /// `write_records`.
    WriteRecords,
    /// `create_zone`.
    CreateZone,
    /// `create_subscription`.
    CreateSubscription,
}

/// One recorded `write_records` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    /// Target zone.
    pub zone: ZoneId,
    /// Record types touched.
    pub record_types: BTreeSet<String>,
    /// Records sent for saving.
    pub saves: usize,
    /// Records sent for deletion.
    pub deletes: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct Token {
    epoch: u64,
    seq: u64,
}

#[derive(Debug)]
struct Failure {
    error: RemoteError,
    after_events: usize,
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    name: String,
    record_type: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct ZoneData {
    records: BTreeMap<String, RemoteRecord>,
    log: Vec<LogEntry>,
}

#[derive(Debug)]
struct ZoneLogEntry {
    seq: u64,
    zone: ZoneId,
    deleted: bool,
}

#[derive(Debug, Default)]
struct Inner {
    seq: u64,
    epoch: u64,
    tags: u64,
    zones: BTreeMap<ZoneId, ZoneData>,
    zone_log: Vec<ZoneLogEntry>,
    subscriptions: BTreeMap<String, Subscription>,
    failures: HashMap<RemoteOp, VecDeque<Failure>>,
    item_failures: HashMap<String, RemoteError>,
    calls: HashMap<RemoteOp, usize>,
    cursors_seen: HashMap<RemoteOp, Vec<Option<Cursor>>>,
    writes: Vec<WriteCall>,
}

impl Inner {
    fn begin(&mut self, op: RemoteOp) -> Option<Failure> {
        *self.calls.entry(op).or_default() += 1;
        self.failures.get_mut(&op).and_then(VecDeque::pop_front)
    }

    fn token(&self, seq: u64) -> Result<Cursor, RemoteError> {
        let bytes = Token {
            epoch: self.epoch,
            seq,
        }
        .encode()
        .map_err(|e| RemoteError::new(RemoteErrorKind::InternalError, e.to_string()))?;
        Ok(Cursor::from(bytes))
    }

    fn since(&self, cursor: Option<&Cursor>) -> Result<u64, RemoteError> {
        let Some(cursor) = cursor else {
            return Ok(0);
        };
        let token = Token::decode(cursor.as_bytes())
            .map_err(|_| RemoteError::new(RemoteErrorKind::BadRequest, "unreadable change token"))?;
        if token.epoch != self.epoch {
            return Err(RemoteError::new(
                RemoteErrorKind::ChangeTokenExpired,
                "change token expired",
            ));
        }
        Ok(token.seq)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn save(&mut self, zone: &ZoneId, incoming: &RemoteRecord, check_tag: bool) -> Result<(), RemoteError> {
        let Some(data) = self.zones.get(zone) else {
            return Err(zone_not_found(zone));
        };
        if check_tag {
            if let Some(stored) = data.records.get(&incoming.id.name) {
                if stored.change_tag != incoming.change_tag {
                    let mut error = RemoteError::new(
                        RemoteErrorKind::ServerRecordChanged,
                        format!("record {} was changed on the server", incoming.id.name),
                    );
                    error.server_change_tag = stored.change_tag.clone();
                    return Err(error);
                }
            }
        }
        self.tags += 1;
        let tag = format!("tag-{}", self.tags);
        let seq = self.next_seq();
        let data = self.zones.entry(zone.clone()).or_default();

        let stored = data
            .records
            .entry(incoming.id.name.clone())
            .or_insert_with(|| RemoteRecord::new(&incoming.record_type, incoming.id.clone()));
        stored.merge_fields(incoming);
        stored.change_tag = Some(tag);
        data.log.push(LogEntry {
            seq,
            name: incoming.id.name.clone(),
            record_type: incoming.record_type.clone(),
            deleted: false,
        });
        self.zone_log.push(ZoneLogEntry {
            seq,
            zone: zone.clone(),
            deleted: false,
        });
        Ok(())
    }

    fn delete(&mut self, zone: &ZoneId, name: &str) -> Result<(), RemoteError> {
        let seq = self.seq + 1;
        let data = self.zones.get_mut(zone).ok_or_else(|| zone_not_found(zone))?;
        let Some(removed) = data.records.remove(name) else {
            return Err(RemoteError::new(
                RemoteErrorKind::UnknownItem,
                format!("no record {name}"),
            ));
        };
        data.log.push(LogEntry {
            seq,
            name: name.to_string(),
            record_type: removed.record_type,
            deleted: true,
        });
        self.seq = seq;
        self.zone_log.push(ZoneLogEntry {
            seq,
            zone: zone.clone(),
            deleted: false,
        });
        Ok(())
    }
}

fn zone_not_found(zone: &ZoneId) -> RemoteError {
    RemoteError::new(RemoteErrorKind::ZoneNotFound, format!("zone {zone} does not exist"))
}

/// Cuts `events` short and appends the scripted failure, if any.
fn inject<T>(mut events: Vec<Result<T, RemoteError>>, failure: Option<Failure>) -> Vec<Result<T, RemoteError>> {
    if let Some(failure) = failure {
        events.truncate(failure.after_events);
        events.push(Err(failure.error));
    }
    events
}

/// An in-memory remote record store.
///
/// Keeps a sequence-numbered change log per zone and hands out opaque
/// CBOR cursors. Discovery results are delivered in pages of
/// `page_size` changes with a progress cursor after each page; at most
/// `change_limit` changes are returned per call (`more_coming` reports
/// the rest). Failures can be scripted per call, optionally after a
/// number of streamed events, and per record. With change-tag checks on,
/// saving over a stored record requires its current change tag.
#[derive(Debug)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    page_size: usize,
    change_limit: Option<usize>,
    write_limit: Option<usize>,
    check_change_tags: bool,
}

impl MemoryRemote {
    /// Creates a remote holding only the default zone.
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.zones.insert(ZoneId::default_zone(), ZoneData::default());
        Self {
            inner: Mutex::new(inner),
            page_size: 100,
            change_limit: None,
            write_limit: None,
            check_change_tags: false,
        }
    }

    /// Sets the number of changes per page.
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Bounds the changes returned per discovery call.
    #[must_use]
    pub fn with_change_limit(mut self, limit: usize) -> Self {
        self.change_limit = Some(limit.max(1));
        self
    }

    /// Rejects writes of more than `limit` items with `LimitExceeded`.
    #[must_use]
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = Some(limit);
        self
    }

    /// Rejects saves over a stored record whose change tag they do not
    /// carry, with `ServerRecordChanged`.
    #[must_use]
    pub fn with_change_tag_checks(mut self) -> Self {
        self.check_change_tags = true;
        self
    }

    /// Fails the next call of `op` before it returns anything.
    pub fn fail_next(&self, op: RemoteOp, error: RemoteError) {
        self.fail_after(op, 0, error);
    }

    /// Fails the next call of `op` after `events` streamed events.
    pub fn fail_after(&self, op: RemoteOp, events: usize, error: RemoteError) {
        self.inner
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(Failure {
                error,
                after_events: events,
            });
    }

    /// Fails the next write of the record named `name`.
    pub fn fail_item(&self, name: impl Into<String>, error: RemoteError) {
        self.inner.lock().item_failures.insert(name.into(), error);
    }

    /// Invalidates every cursor handed out so far.
    pub fn expire_cursors(&self) {
        self.inner.lock().epoch += 1;
    }

    /// Creates or updates a record as another device would.
    pub fn put_record(&self, record: RemoteRecord) -> Result<(), RemoteError> {
        let zone = record.id.zone.clone();
        self.inner.lock().save(&zone, &record, false)
    }

    /// Deletes a record as another device would.
    pub fn delete_record(&self, id: &RecordId) -> Result<(), RemoteError> {
        self.inner.lock().delete(&id.zone, &id.name)
    }

    /// Deletes a zone and everything in it, as the user would.
    pub fn delete_zone(&self, zone: &ZoneId) {
        let mut inner = self.inner.lock();
        if inner.zones.remove(zone).is_some() {
            let seq = inner.next_seq();
            inner.zone_log.push(ZoneLogEntry {
                seq,
                zone: zone.clone(),
                deleted: true,
            });
        }
    }

    /// Returns true if `zone` exists.
    pub fn has_zone(&self, zone: &ZoneId) -> bool {
        self.inner.lock().zones.contains_key(zone)
    }

    /// Returns a stored record.
    pub fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
        self.inner
            .lock()
            .zones
            .get(&id.zone)
            .and_then(|z| z.records.get(&id.name))
            .cloned()
    }

    /// Returns every record of `zone`, ordered by name.
    pub fn records(&self, zone: &ZoneId) -> Vec<RemoteRecord> {
        self.inner
            .lock()
            .zones
            .get(zone)
            .map(|z| z.records.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the stored subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().subscriptions.values().cloned().collect()
    }

    /// Returns how often `op` was called.
    pub fn calls(&self, op: RemoteOp) -> usize {
        self.inner.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Returns the cursors passed to each call of a discovery `op`.
    pub fn cursors_seen(&self, op: RemoteOp) -> Vec<Option<Cursor>> {
        self.inner
            .lock()
            .cursors_seen
            .get(&op)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the recorded write calls.
    pub fn write_calls(&self) -> Vec<WriteCall> {
        self.inner.lock().writes.clone()
    }

    /// Splits `changes` (seq, event) into pages with progress cursors and
    /// a final completion.
    fn paginate<T>(
        &self,
        inner: &Inner,
        mut changes: Vec<(u64, T)>,
        progress: fn(Cursor) -> T,
        completed: fn(Option<Cursor>, bool) -> T,
    ) -> Vec<Result<T, RemoteError>> {
        let mut more_coming = false;
        if let Some(limit) = self.change_limit {
            if changes.len() > limit {
                changes.truncate(limit);
                more_coming = true;
            }
        }
        let final_seq = if more_coming {
            changes.last().map_or(inner.seq, |(seq, _)| *seq)
        } else {
            inner.seq
        };

        let mut events = Vec::new();
        let total = changes.len();
        for (i, (seq, change)) in changes.into_iter().enumerate() {
            events.push(Ok(change));
            let page_end = (i + 1) % self.page_size == 0;
            if page_end && i + 1 < total {
                match inner.token(seq) {
                    Ok(cursor) => events.push(Ok(progress(cursor))),
                    Err(e) => events.push(Err(e)),
                }
            }
        }
        match inner.token(final_seq) {
            Ok(cursor) => events.push(Ok(completed(Some(cursor), more_coming))),
            Err(e) => events.push(Err(e)),
        }
        events
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteService for MemoryRemote {
    fn discover_database_changes(&self, cursor: Option<Cursor>) -> RemoteStream<'_, DatabaseChange> {
        let mut inner = self.inner.lock();
        let failure = inner.begin(RemoteOp::DatabaseChanges);
        inner
            .cursors_seen
            .entry(RemoteOp::DatabaseChanges)
            .or_default()
            .push(cursor.clone());

        let events = match inner.since(cursor.as_ref()) {
            Err(e) => vec![Err(e)],
            Ok(since) => {
                let mut latest: BTreeMap<ZoneId, (u64, bool)> = BTreeMap::new();
                for entry in inner.zone_log.iter().filter(|e| e.seq > since) {
                    latest.insert(entry.zone.clone(), (entry.seq, entry.deleted));
                }
                let mut changes: Vec<_> = latest
                    .into_iter()
                    .map(|(zone, (seq, deleted))| {
                        let change = if deleted {
                            DatabaseChange::ZoneDeleted(zone)
                        } else {
                            DatabaseChange::ZoneChanged(zone)
                        };
                        (seq, change)
                    })
                    .collect();
                changes.sort_by_key(|(seq, _)| *seq);
                self.paginate(&inner, changes, DatabaseChange::CursorUpdated, |cursor, more_coming| {
                    DatabaseChange::Completed {
                        cursor,
                        more_coming,
                    }
                })
            }
        };
        stream::iter(inject(events, failure)).boxed()
    }

    fn discover_zone_changes(&self, zone: &ZoneId, cursor: Option<Cursor>) -> RemoteStream<'_, ZoneChange> {
        let mut inner = self.inner.lock();
        let failure = inner.begin(RemoteOp::ZoneChanges);
        inner
            .cursors_seen
            .entry(RemoteOp::ZoneChanges)
            .or_default()
            .push(cursor.clone());

        let events = match (inner.since(cursor.as_ref()), inner.zones.get(zone)) {
            (Err(e), _) => vec![Err(e)],
            (Ok(_), None) => vec![Err(zone_not_found(zone))],
            (Ok(since), Some(data)) => {
                let mut latest: BTreeMap<&str, &LogEntry> = BTreeMap::new();
                for entry in data.log.iter().filter(|e| e.seq > since) {
                    latest.insert(&entry.name, entry);
                }
                let mut changes: Vec<_> = latest
                    .into_values()
                    .map(|entry| {
                        let change = match data.records.get(&entry.name) {
                            Some(record) if !entry.deleted => ZoneChange::RecordChanged(record.clone()),
                            _ => ZoneChange::RecordDeleted {
                                record_id: RecordId::new(entry.name.clone(), zone.clone()),
                                record_type: entry.record_type.clone(),
                            },
                        };
                        (entry.seq, change)
                    })
                    .collect();
                changes.sort_by_key(|(seq, _)| *seq);
                self.paginate(&inner, changes, ZoneChange::CursorUpdated, |cursor, more_coming| {
                    ZoneChange::Completed {
                        cursor,
                        more_coming,
                    }
                })
            }
        };
        stream::iter(inject(events, failure)).boxed()
    }

    fn query_all(&self, zone: &ZoneId, record_type: &str) -> RemoteStream<'_, RemoteRecord> {
        let mut inner = self.inner.lock();
        let failure = inner.begin(RemoteOp::QueryAll);
        let events = match inner.zones.get(zone) {
            None => vec![Err(zone_not_found(zone))],
            Some(data) => data
                .records
                .values()
                .filter(|r| r.record_type == record_type)
                .cloned()
                .map(Ok)
                .collect(),
        };
        stream::iter(inject(events, failure)).boxed()
    }

    async fn write_records(
        &self,
        zone: &ZoneId,
        to_save: Vec<RemoteRecord>,
        to_delete: Vec<RecordId>,
    ) -> Result<WriteResult, RemoteError> {
        let mut inner = self.inner.lock();
        if let Some(failure) = inner.begin(RemoteOp::WriteRecords) {
            return Err(failure.error);
        }
        if !inner.zones.contains_key(zone) {
            return Err(zone_not_found(zone));
        }
        if let Some(limit) = self.write_limit {
            if to_save.len() + to_delete.len() > limit {
                return Err(RemoteError::new(
                    RemoteErrorKind::LimitExceeded,
                    format!("at most {limit} items per request"),
                ));
            }
        }

        inner.writes.push(WriteCall {
            zone: zone.clone(),
            record_types: to_save.iter().map(|r| r.record_type.clone()).collect(),
            saves: to_save.len(),
            deletes: to_delete.len(),
        });

        let mut result = WriteResult::default();
        for record in &to_save {
            let outcome = match inner.item_failures.remove(&record.id.name) {
                Some(error) => Err(error),
                None => inner.save(zone, record, self.check_change_tags),
            };
            result.saved.push(ItemResult {
                record_id: record.id.clone(),
                result: outcome,
            });
        }
        for id in to_delete {
            let outcome = match inner.item_failures.remove(&id.name) {
                Some(error) => Err(error),
                None => inner.delete(zone, &id.name),
            };
            result.deleted.push(ItemResult {
                record_id: id,
                result: outcome,
            });
        }
        Ok(result)
    }

    async fn create_zone(&self, zone: &ZoneId) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        if let Some(failure) = inner.begin(RemoteOp::CreateZone) {
            return Err(failure.error);
        }
        inner.zones.entry(zone.clone()).or_default();
        Ok(())
    }

    async fn create_subscription(&self, subscription: &Subscription) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        if let Some(failure) = inner.begin(RemoteOp::CreateSubscription) {
            return Err(failure.error);
        }
        inner
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }
}
