//! Sync coordinator.
//!
//! One cycle runs, gated by [`SyncDirection`](crate::SyncDirection):
//!
//! 1. Zone: create the custom zone once; a fresh zone triggers an upload
//!    of every local entity
//! 2. Subscription: create the silent change subscription once
//! 3. Pull: default zone by full query per collection (sequential or
//!    parallel), custom zone by database then zone change discovery
//! 4. Push: drain each collection's pending queue in batched writes
//!
//! Cursors are committed only when a discovery call completes. Records
//! are applied as they stream in, each in its own local transaction.

use crate::asset::{AssetStore, MemoryAssetStore};
use crate::classify::RecoverableReason;
use crate::codec::RecordCodec;
use crate::collection::{PreparedPush, SyncableCollection};
use crate::config::{PullStrategy, SyncSettings};
use crate::cursor_store::CursorStore;
use crate::entity::PrimaryKey;
use crate::error::{RemoteError, RemoteErrorKind, SyncError, SyncResult};
use crate::events::{EventBus, SyncEvent};
use crate::fanout::FanoutTracker;
use crate::local::LocalStore;
use crate::remote::{DatabaseChange, RemoteService, WriteResult, ZoneChange};
use crate::retry::{Halt, RetryDriver};
use crate::schema::CollectionSchema;
use crate::zone::{ZoneManager, ZoneStatus};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zonesync_record::{Cursor, RecordId, RemoteRecord, SyncScope, ZoneId};
use zonesync_state::StateBackend;

/// The current phase of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle has run yet.
    Idle,
    /// Creating the zone or flushing after its creation.
    PreparingZone,
    /// Pulling remote changes.
    Pulling,
    /// Pushing local changes.
    Pushing,
    /// The last cycle completed.
    Synced,
    /// The last cycle failed.
    Error,
}

impl SyncState {
    /// Returns true while a cycle is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::PreparingZone | SyncState::Pulling | SyncState::Pushing
        )
    }
}

/// Statistics across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that completed.
    pub cycles_completed: u64,
    /// Cycles that failed.
    pub cycles_failed: u64,
    /// Remote changes and deletions applied locally.
    pub records_pulled: u64,
    /// Local saves and deletes written remotely.
    pub records_pushed: u64,
    /// When the last cycle completed.
    pub last_sync_time: Option<Instant>,
    /// Error of the last failed cycle, cleared by a successful one.
    pub last_error: Option<String>,
}

/// A queued item the remote store did not accept.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedItem {
    /// Collection of the item.
    pub record_type: String,
    /// Local key; it stays pending.
    pub key: PrimaryKey,
    /// Failure reported for the item.
    pub error: RemoteError,
}

/// Outcome of pushing one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReport {
    /// Collection pushed.
    pub record_type: String,
    /// Records saved.
    pub saved: usize,
    /// Records deleted.
    pub deleted: usize,
    /// Items left pending.
    pub failed: Vec<FailedItem>,
}

impl PushReport {
    fn new(record_type: &str) -> Self {
        Self {
            record_type: record_type.to_string(),
            ..Self::default()
        }
    }
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Whether the cycle created the zone.
    pub zone_created: bool,
    /// Remote creates and updates applied locally.
    pub pulled_changes: usize,
    /// Remote deletions applied locally.
    pub pulled_deletions: usize,
    /// Records saved remotely.
    pub pushed_saves: usize,
    /// Records deleted remotely.
    pub pushed_deletes: usize,
    /// Items the remote store did not accept; they stay pending.
    pub failed_items: Vec<FailedItem>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl SyncReport {
    fn absorb_push(&mut self, report: PushReport) {
        self.pushed_saves += report.saved;
        self.pushed_deletes += report.deleted;
        self.failed_items.extend(report.failed);
    }
}

#[derive(Debug, Clone, Copy)]
struct Steps {
    zone: bool,
    subscribe: bool,
    pull: bool,
    push: bool,
}

#[derive(Debug, Default)]
struct PullTally {
    changes: AtomicUsize,
    deletions: AtomicUsize,
}

impl PullTally {
    fn add(&self, changes: usize, deletions: usize) {
        self.changes.fetch_add(changes, Ordering::Relaxed);
        self.deletions.fetch_add(deletions, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct DatabasePage {
    changed: Vec<ZoneId>,
    deleted: Vec<ZoneId>,
    cursor: Option<Cursor>,
    more_coming: bool,
}

#[derive(Debug, Default)]
struct ZonePage {
    changes: usize,
    deletions: usize,
    cursor: Option<Cursor>,
    more_coming: bool,
}

enum Outgoing {
    Save(RemoteRecord),
    Delete(RecordId),
}

fn split(items: &[Outgoing]) -> (Vec<RemoteRecord>, Vec<RecordId>) {
    let mut saves = Vec::new();
    let mut deletes = Vec::new();
    for item in items {
        match item {
            Outgoing::Save(record) => saves.push(record.clone()),
            Outgoing::Delete(id) => deletes.push(id.clone()),
        }
    }
    (saves, deletes)
}

fn incomplete_stream(call: &str) -> SyncError {
    RemoteError::new(
        RemoteErrorKind::NetworkFailure,
        format!("{call} ended before completing"),
    )
    .into()
}

/// Builder for [`SyncCoordinator`].
pub struct SyncCoordinatorBuilder {
    settings: SyncSettings,
    remote: Arc<dyn RemoteService>,
    local: Arc<dyn LocalStore>,
    backend: Arc<dyn StateBackend>,
    assets: Option<Arc<dyn AssetStore>>,
    schemas: Vec<CollectionSchema>,
    event_capacity: usize,
}

impl SyncCoordinatorBuilder {
    /// Registers a collection.
    #[must_use]
    pub fn with_collection(mut self, schema: CollectionSchema) -> Self {
        self.schemas.push(schema);
        self
    }

    /// Sets the asset store; defaults to an in-memory one.
    #[must_use]
    pub fn with_assets(mut self, assets: Arc<dyn AssetStore>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Sets the per-subscriber event buffer.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Builds the coordinator, loading each collection's pending queue.
    ///
    /// # Errors
    ///
    /// Fails if a record type is registered twice or a persisted queue
    /// cannot be read.
    pub fn build(self) -> SyncResult<SyncCoordinator> {
        let assets = self
            .assets
            .unwrap_or_else(|| Arc::new(MemoryAssetStore::new()));
        let mut codec = RecordCodec::new(assets);
        let mut collections = Vec::with_capacity(self.schemas.len());
        let mut index = HashMap::new();

        for schema in self.schemas {
            let record_type = schema.record_type.clone();
            if index.contains_key(&record_type) {
                return Err(SyncError::Local(format!(
                    "collection {record_type} registered twice"
                )));
            }
            codec.register_zone(record_type.clone(), self.settings.zone.clone());
            index.insert(record_type, collections.len());
            collections.push(SyncableCollection::new(
                schema,
                self.settings.zone.clone(),
                Arc::clone(&self.backend),
            )?);
        }

        let zones = ZoneManager::new(&self.settings, Arc::clone(&self.remote), Arc::clone(&self.backend));
        let shared = Shared {
            retry: RetryDriver::new(self.settings.retry.clone()),
            cursors: CursorStore::new(self.backend),
            events: EventBus::new(self.event_capacity),
            settings: self.settings,
            remote: self.remote,
            local: self.local,
            zones,
            codec,
            collections,
            index,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            zone_refilled: AtomicBool::new(false),
        };

        Ok(SyncCoordinator {
            shared: Arc::new(shared),
            cycle: Mutex::new(()),
        })
    }
}

impl std::fmt::Debug for SyncCoordinatorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinatorBuilder")
            .field("settings", &self.settings)
            .field("collections", &self.schemas.len())
            .finish_non_exhaustive()
    }
}

/// Orchestrates sync cycles between a local store and a remote service.
///
/// Cycles are single-flight: concurrent calls to [`sync`](Self::sync)
/// on one coordinator run one after the other.
pub struct SyncCoordinator {
    shared: Arc<Shared>,
    cycle: Mutex<()>,
}

impl SyncCoordinator {
    /// Starts building a coordinator.
    pub fn builder(
        settings: SyncSettings,
        remote: Arc<dyn RemoteService>,
        local: Arc<dyn LocalStore>,
        backend: Arc<dyn StateBackend>,
    ) -> SyncCoordinatorBuilder {
        SyncCoordinatorBuilder {
            settings,
            remote,
            local,
            backend,
            assets: None,
            schemas: Vec::new(),
            event_capacity: 64,
        }
    }

    /// Returns the settings.
    pub fn settings(&self) -> &SyncSettings {
        &self.shared.settings
    }

    /// Returns the current phase.
    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    /// Returns statistics across cycles.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Returns the registered record types in registration order.
    pub fn record_types(&self) -> Vec<String> {
        self.shared
            .collections
            .iter()
            .map(|c| c.record_type().to_string())
            .collect()
    }

    /// Returns a registered collection.
    pub fn collection(&self, record_type: &str) -> Option<&SyncableCollection> {
        self.shared.collection(record_type)
    }

    fn require(&self, record_type: &str) -> SyncResult<&SyncableCollection> {
        self.collection(record_type)
            .ok_or_else(|| SyncError::UnknownCollection(record_type.to_string()))
    }

    /// Queues a local create or update for the next push.
    pub fn enqueue_save(&self, record_type: &str, key: impl Into<PrimaryKey>) -> SyncResult<()> {
        self.require(record_type)?.enqueue_save(key)
    }

    /// Queues a local delete for the next push.
    pub fn enqueue_delete(&self, record_type: &str, key: impl Into<PrimaryKey>) -> SyncResult<()> {
        self.require(record_type)?.enqueue_delete(key)
    }

    /// Returns the committed cursor of `scope`.
    pub fn cursor(&self, scope: &SyncScope) -> SyncResult<Option<Cursor>> {
        self.shared.cursors.get(scope)
    }

    /// Runs one full cycle.
    ///
    /// # Errors
    ///
    /// The first error that stopped the cycle. Transient failures are
    /// retried inside the cycle and never surface unless a retry bound
    /// is configured.
    pub async fn sync(&self) -> SyncResult<SyncReport> {
        let direction = self.shared.settings.direction;
        let steps = Steps {
            zone: direction.pushes() && self.shared.settings.uses_custom_zone(),
            subscribe: direction.pulls(),
            pull: direction.pulls(),
            push: direction.pushes(),
        };
        let _cycle = self.cycle.lock().await;
        self.shared.run_cycle(steps).await
    }

    /// Runs only the pull step, if the direction allows it.
    pub async fn pull(&self) -> SyncResult<SyncReport> {
        let steps = Steps {
            zone: false,
            subscribe: false,
            pull: self.shared.settings.direction.pulls(),
            push: false,
        };
        let _cycle = self.cycle.lock().await;
        self.shared.run_cycle(steps).await
    }

    /// Runs only the zone and push steps, if the direction allows them.
    pub async fn push(&self) -> SyncResult<SyncReport> {
        let pushes = self.shared.settings.direction.pushes();
        let steps = Steps {
            zone: pushes && self.shared.settings.uses_custom_zone(),
            subscribe: false,
            pull: false,
            push: pushes,
        };
        let _cycle = self.cycle.lock().await;
        self.shared.run_cycle(steps).await
    }

    /// Runs a cycle on the tokio runtime and hands its result to
    /// `completion` exactly once.
    pub fn spawn_sync<F>(self: &Arc<Self>, completion: F) -> JoinHandle<()>
    where
        F: FnOnce(SyncResult<SyncReport>) + Send + 'static,
    {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator.sync().await;
            completion(result);
        })
    }

    /// Creates the zone unless it is known to exist; a newly created zone
    /// receives every local entity.
    pub async fn ensure_zone_exists(&self) -> SyncResult<ZoneStatus> {
        let _cycle = self.cycle.lock().await;
        let mut report = SyncReport::default();
        self.shared.prepare_zone(&mut report).await
    }

    /// Forgets every cursor and the zone flag; the next cycle recreates
    /// the zone if needed and resyncs from scratch.
    pub async fn reset(&self) -> SyncResult<()> {
        let _cycle = self.cycle.lock().await;
        info!("resetting sync state");
        self.shared.cursors.clear_all()?;
        self.shared.zones.reset_zone()
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("settings", &self.shared.settings)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// State shared with spawned pull tasks. Collections are owned here and
/// addressed by record type through `index`.
struct Shared {
    settings: SyncSettings,
    remote: Arc<dyn RemoteService>,
    local: Arc<dyn LocalStore>,
    cursors: CursorStore,
    zones: ZoneManager,
    codec: RecordCodec,
    collections: Vec<SyncableCollection>,
    index: HashMap<String, usize>,
    retry: RetryDriver,
    events: EventBus,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    /// Set when a push recreated the zone and queued every collection.
    zone_refilled: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn collection(&self, record_type: &str) -> Option<&SyncableCollection> {
        self.index.get(record_type).map(|&i| &self.collections[i])
    }

    async fn run_cycle(self: &Arc<Self>, steps: Steps) -> SyncResult<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport::default();
        let result = self.run_steps(steps, &mut report).await;
        report.duration = start.elapsed();

        match result {
            Ok(()) => {
                self.set_state(SyncState::Synced);
                let mut stats = self.stats.write();
                stats.cycles_completed += 1;
                stats.records_pulled += (report.pulled_changes + report.pulled_deletions) as u64;
                stats.records_pushed += (report.pushed_saves + report.pushed_deletes) as u64;
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                info!(
                    pulled = report.pulled_changes + report.pulled_deletions,
                    pushed = report.pushed_saves + report.pushed_deletes,
                    failed = report.failed_items.len(),
                    duration = ?report.duration,
                    "sync cycle completed"
                );
                Ok(report)
            }
            Err(error) => {
                self.set_state(SyncState::Error);
                let mut stats = self.stats.write();
                stats.cycles_failed += 1;
                stats.last_error = Some(error.to_string());
                warn!(%error, "sync cycle failed");
                Err(error)
            }
        }
    }

    async fn run_steps(self: &Arc<Self>, steps: Steps, report: &mut SyncReport) -> SyncResult<()> {
        if steps.zone {
            self.set_state(SyncState::PreparingZone);
            self.prepare_zone(report).await?;
        }

        if steps.subscribe {
            let record_types: Vec<&str> = self.collections.iter().map(|c| c.record_type()).collect();
            if let Err(error) = self.zones.ensure_subscriptions(&record_types).await {
                warn!(%error, "could not create subscription, continuing without notifications");
            }
        }

        if steps.pull {
            self.set_state(SyncState::Pulling);
            let (changes, deletions) = self.pull().await?;
            report.pulled_changes += changes;
            report.pulled_deletions += deletions;
        }

        if steps.push {
            self.set_state(SyncState::Pushing);
            for pushed in self.push_all().await? {
                report.absorb_push(pushed);
            }
        }
        Ok(())
    }

    async fn prepare_zone(&self, report: &mut SyncReport) -> SyncResult<ZoneStatus> {
        let status = self.zones.ensure_zone_exists().await?;
        if status == ZoneStatus::Created {
            report.zone_created = true;
            self.queue_everything()?;
            for pushed in self.push_all().await? {
                report.absorb_push(pushed);
            }
        }
        Ok(status)
    }

    // Pull

    async fn pull(self: &Arc<Self>) -> SyncResult<(usize, usize)> {
        let tally = Arc::new(PullTally::default());
        let result = if self.settings.uses_custom_zone() {
            self.pull_custom_zone(&tally).await
        } else {
            match self.settings.pull_strategy {
                PullStrategy::Sequential => self.pull_sequential(&tally).await,
                PullStrategy::Parallel => self.pull_parallel(&tally).await,
            }
        };

        match &result {
            Ok(()) => self.events.emit(SyncEvent::PullSucceeded),
            Err(error) => self.events.emit(SyncEvent::PullFailed {
                error: error.to_string(),
            }),
        }
        result?;
        Ok((
            tally.changes.load(Ordering::Relaxed),
            tally.deletions.load(Ordering::Relaxed),
        ))
    }

    /// Fetches every record of one collection from the default zone.
    async fn pull_collection(&self, index: usize, tally: &PullTally) -> SyncResult<()> {
        let collection = &self.collections[index];
        let applied = self
            .retry
            .run("query all", move |_| async move {
                let mut stream = self
                    .remote
                    .query_all(&self.settings.zone, collection.record_type());
                let mut applied = 0usize;
                while let Some(record) = stream.next().await {
                    collection.apply_changed(&record?, &self.codec, self.local.as_ref())?;
                    applied += 1;
                }
                Ok::<_, SyncError>(applied)
            })
            .await?;

        debug!(record_type = %collection.record_type(), applied, "collection pulled");
        tally.add(applied, 0);
        Ok(())
    }

    async fn pull_sequential(&self, tally: &PullTally) -> SyncResult<()> {
        for index in 0..self.collections.len() {
            self.pull_collection(index, tally).await?;
        }
        Ok(())
    }

    async fn pull_parallel(self: &Arc<Self>, tally: &Arc<PullTally>) -> SyncResult<()> {
        let (sender, receiver) = oneshot::channel();
        let events = self.events.clone();
        let tracker = Arc::new(FanoutTracker::new(
            self.collections.len(),
            Box::new(move |label: &str| {
                events.emit(SyncEvent::PullPartiallySucceeded {
                    record_type: label.to_string(),
                })
            }),
            Box::new(move |error: Option<SyncError>| {
                let _ = sender.send(error);
            }),
        ));

        for index in 0..self.collections.len() {
            let shared = Arc::clone(self);
            let tracker = Arc::clone(&tracker);
            let tally = Arc::clone(tally);
            tokio::spawn(async move {
                let result = shared.pull_collection(index, &tally).await;
                tracker.complete(shared.collections[index].record_type(), result);
            });
        }
        drop(tracker);

        match receiver.await {
            Ok(None) => Ok(()),
            Ok(Some(error)) => Err(error),
            Err(_) => Err(SyncError::TaskAborted("parallel pull".to_string())),
        }
    }

    /// Two-level discovery: which zones changed, then what changed in ours.
    ///
    /// The database cursor is committed after the zone pull it led to, so
    /// a failed zone pull is rediscovered next cycle.
    async fn pull_custom_zone(&self, tally: &PullTally) -> SyncResult<()> {
        let scope = SyncScope::Database;
        loop {
            let page = match self.database_page().await {
                Ok(page) => page,
                Err(Halt::Recoverable {
                    reason: RecoverableReason::CursorExpired,
                    error,
                }) => {
                    self.expire_cursor(&scope, error)?;
                    continue;
                }
                Err(halt) => return Err(halt.into()),
            };

            let zone = &self.settings.zone;
            if page.deleted.contains(zone) {
                warn!(%zone, "zone deleted remotely");
                self.zones.reset_zone()?;
                self.cursors.clear(&SyncScope::Zone(zone.clone()))?;
            }
            for other in page.changed.iter().filter(|z| *z != zone) {
                debug!(zone = %other, "ignoring changes in unmanaged zone");
            }
            if page.changed.contains(zone) {
                self.pull_zone(tally).await?;
            }

            if let Some(cursor) = &page.cursor {
                self.cursors.set(&scope, cursor)?;
            }
            if !page.more_coming {
                return Ok(());
            }
        }
    }

    async fn database_page(&self) -> Result<DatabasePage, Halt> {
        self.retry
            .run("database changes", move |_| async move {
                let cursor = self.cursors.get(&SyncScope::Database)?;
                let mut stream = self.remote.discover_database_changes(cursor);
                let mut page = DatabasePage::default();
                let mut progress = None;
                while let Some(event) = stream.next().await {
                    match event? {
                        DatabaseChange::ZoneChanged(zone) => page.changed.push(zone),
                        DatabaseChange::ZoneDeleted(zone) => page.deleted.push(zone),
                        DatabaseChange::CursorUpdated(cursor) => progress = Some(cursor),
                        DatabaseChange::Completed {
                            cursor,
                            more_coming,
                        } => {
                            page.cursor = cursor.or(progress);
                            page.more_coming = more_coming;
                            return Ok(page);
                        }
                    }
                }
                Err::<DatabasePage, _>(incomplete_stream("database discovery"))
            })
            .await
    }

    async fn pull_zone(&self, tally: &PullTally) -> SyncResult<()> {
        let zone = &self.settings.zone;
        let scope = SyncScope::Zone(zone.clone());
        loop {
            match self.zone_page(&scope).await {
                Ok(page) => {
                    if let Some(cursor) = &page.cursor {
                        self.cursors.set(&scope, cursor)?;
                    }
                    tally.add(page.changes, page.deletions);
                    debug!(%zone, changes = page.changes, deletions = page.deletions, "zone page applied");
                    if !page.more_coming {
                        return Ok(());
                    }
                }
                Err(Halt::Recoverable {
                    reason: RecoverableReason::CursorExpired,
                    error,
                }) => self.expire_cursor(&scope, error)?,
                Err(Halt::Recoverable {
                    reason: RecoverableReason::ZoneNotFound,
                    error,
                }) => {
                    warn!(%zone, "zone missing remotely");
                    self.zones.reset_zone()?;
                    self.cursors.clear(&scope)?;
                    return Err(error.into());
                }
                Err(halt) => return Err(halt.into()),
            }
        }
    }

    async fn zone_page(&self, scope: &SyncScope) -> Result<ZonePage, Halt> {
        self.retry
            .run("zone changes", move |_| async move {
                let cursor = self.cursors.get(scope)?;
                let mut stream = self
                    .remote
                    .discover_zone_changes(&self.settings.zone, cursor);
                let mut page = ZonePage::default();
                let mut progress = None;
                while let Some(event) = stream.next().await {
                    match event? {
                        ZoneChange::RecordChanged(record) => {
                            if self.apply_changed(&record)? {
                                page.changes += 1;
                            }
                        }
                        ZoneChange::RecordDeleted {
                            record_id,
                            record_type,
                        } => {
                            if self.apply_deleted(&record_type, &record_id)? {
                                page.deletions += 1;
                            }
                        }
                        ZoneChange::CursorUpdated(cursor) => progress = Some(cursor),
                        ZoneChange::Completed {
                            cursor,
                            more_coming,
                        } => {
                            page.cursor = cursor.or(progress);
                            page.more_coming = more_coming;
                            return Ok(page);
                        }
                    }
                }
                Err::<ZonePage, _>(incomplete_stream("zone discovery"))
            })
            .await
    }

    /// Clears an expired cursor so the next discovery starts empty. An
    /// empty cursor that expires cannot be recovered from.
    fn expire_cursor(&self, scope: &SyncScope, error: RemoteError) -> SyncResult<()> {
        if self.cursors.get(scope)?.is_none() {
            return Err(error.into());
        }
        warn!(%scope, "cursor expired, resyncing from scratch");
        self.cursors.clear(scope)
    }

    fn apply_changed(&self, record: &RemoteRecord) -> SyncResult<bool> {
        match self.collection(&record.record_type) {
            Some(collection) => {
                collection.apply_changed(record, &self.codec, self.local.as_ref())?;
                Ok(true)
            }
            None => {
                debug!(record_type = %record.record_type, "skipping record of unregistered type");
                Ok(false)
            }
        }
    }

    fn apply_deleted(&self, record_type: &str, record_id: &RecordId) -> SyncResult<bool> {
        match self.collection(record_type) {
            Some(collection) => {
                collection.apply_deleted(record_id, self.local.as_ref())?;
                Ok(true)
            }
            None => {
                debug!(record_type, "skipping deletion of unregistered type");
                Ok(false)
            }
        }
    }

    /// Queues every local entity of every collection for upload.
    fn queue_everything(&self) -> SyncResult<()> {
        for collection in &self.collections {
            let queued = collection.enqueue_all(self.local.as_ref())?;
            debug!(record_type = %collection.record_type(), queued, "queued local entities for new zone");
        }
        Ok(())
    }

    /// Recreates a zone that disappeared remotely and refills it with
    /// every local entity.
    async fn recreate_zone(&self) -> SyncResult<()> {
        let zone = &self.settings.zone;
        warn!(%zone, "zone missing during push, recreating");
        self.zones.reset_zone()?;
        self.cursors.clear(&SyncScope::Zone(zone.clone()))?;
        if self.zones.ensure_zone_exists().await? == ZoneStatus::Created {
            self.queue_everything()?;
            self.zone_refilled.store(true, Ordering::Release);
        }
        Ok(())
    }

    // Push

    /// Pushes every collection with pending mutations. A failing
    /// collection does not stop the others; the first error is returned.
    ///
    /// When a push recreates the zone, collections already pushed in this
    /// pass were queued again and get one more pass.
    async fn push_all(&self) -> SyncResult<Vec<PushReport>> {
        let mut reports = Vec::new();
        let mut first_error = None;
        for _ in 0..2 {
            self.zone_refilled.store(false, Ordering::Release);
            for collection in &self.collections {
                if collection.pending_len() == 0 {
                    continue;
                }
                match self.push_collection(collection).await {
                    Ok(report) => reports.push(report),
                    Err(error) => {
                        warn!(record_type = %collection.record_type(), %error, "push failed");
                        if first_error.is_none() {
                            first_error = Some(error);
                        }
                    }
                }
            }
            if !self.zone_refilled.swap(false, Ordering::AcqRel) {
                break;
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(reports),
        }
    }

    async fn push_collection(&self, collection: &SyncableCollection) -> SyncResult<PushReport> {
        let record_type = collection.record_type();
        let mut report = PushReport::new(record_type);
        let batch = collection.snapshot();
        if batch.is_empty() {
            return Ok(report);
        }

        let PreparedPush {
            to_save,
            to_delete,
            keys,
            vanished,
        } = collection.prepare(&batch, &self.codec, self.local.as_ref())?;
        let items: Vec<Outgoing> = to_save
            .into_iter()
            .map(Outgoing::Save)
            .chain(to_delete.into_iter().map(Outgoing::Delete))
            .collect();

        let mut succeeded: HashSet<PrimaryKey> = vanished.into_iter().collect();
        let outcome = self
            .write_chunks(record_type, &items, &keys, &mut succeeded, &mut report)
            .await;

        let acknowledged = collection.acknowledge(&batch, &succeeded)?;
        debug!(record_type, acknowledged, remaining = collection.pending_len(), "push acknowledged");
        outcome?;

        self.events.emit(SyncEvent::PushCompleted {
            record_type: record_type.to_string(),
            saved: report.saved,
            deleted: report.deleted,
        });
        Ok(report)
    }

    /// Writes `items` in chunks of at most `push_batch_limit`.
    ///
    /// `LimitExceeded` halves the chunk. A missing zone is recreated once,
    /// after which the batch starts over from its first chunk. Saves
    /// rejected because the server record changed are resent once on top
    /// of the server's change tag, so the local values win.
    async fn write_chunks(
        &self,
        record_type: &str,
        items: &[Outgoing],
        keys: &HashMap<RecordId, PrimaryKey>,
        succeeded: &mut HashSet<PrimaryKey>,
        report: &mut PushReport,
    ) -> SyncResult<()> {
        let mut chunk_size = self.settings.push_batch_limit.max(1);
        let mut start = 0;
        let mut recreated_zone = false;
        let mut item_error = None;
        let initial = (succeeded.clone(), report.saved, report.deleted, report.failed.len());

        while start < items.len() {
            let end = (start + chunk_size).min(items.len());
            let (saves, deletes) = split(&items[start..end]);
            match self.write_once(saves, deletes).await {
                Ok(result) => {
                    let mut conflicts = Vec::new();
                    if let Some(error) = absorb(record_type, result, keys, succeeded, report, Some(&mut conflicts)) {
                        item_error.get_or_insert(error);
                    }
                    if !conflicts.is_empty() {
                        let result = self.resend_over(&items[start..end], conflicts).await?;
                        if let Some(error) = absorb(record_type, result, keys, succeeded, report, None) {
                            item_error.get_or_insert(error);
                        }
                    }
                    start = end;
                }
                Err(Halt::Recoverable {
                    reason: RecoverableReason::LimitExceeded,
                    ..
                }) if end - start > 1 => {
                    chunk_size = (end - start) / 2;
                    debug!(record_type, chunk_size, "write limit exceeded, shrinking batch");
                }
                Err(Halt::Recoverable {
                    reason: RecoverableReason::ZoneNotFound,
                    ..
                }) if !recreated_zone && self.settings.uses_custom_zone() => {
                    recreated_zone = true;
                    self.recreate_zone().await?;
                    // the new zone holds none of the chunks written so far
                    let (ok, saved, deleted, failed) = &initial;
                    succeeded.clone_from(ok);
                    report.saved = *saved;
                    report.deleted = *deleted;
                    report.failed.truncate(*failed);
                    item_error = None;
                    start = 0;
                }
                Err(halt) => return Err(halt.into()),
            }
        }

        match item_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Resends the conflicting saves of `chunk` carrying the server's
    /// change tags.
    async fn resend_over(
        &self,
        chunk: &[Outgoing],
        conflicts: Vec<(RecordId, String)>,
    ) -> SyncResult<WriteResult> {
        let tags: HashMap<RecordId, String> = conflicts.into_iter().collect();
        let saves: Vec<RemoteRecord> = chunk
            .iter()
            .filter_map(|item| match item {
                Outgoing::Save(record) => tags.get(&record.id).map(|tag| {
                    let mut record = record.clone();
                    record.change_tag = Some(tag.clone());
                    record
                }),
                Outgoing::Delete(_) => None,
            })
            .collect();
        debug!(count = saves.len(), "server records changed, resending local versions");
        Ok(self.write_once(saves, Vec::new()).await?)
    }

    async fn write_once(
        &self,
        saves: Vec<RemoteRecord>,
        deletes: Vec<RecordId>,
    ) -> Result<WriteResult, Halt> {
        let remote = &self.remote;
        let zone = &self.settings.zone;
        self.retry
            .run("write records", move |_| {
                let saves = saves.clone();
                let deletes = deletes.clone();
                async move {
                    remote
                        .write_records(zone, saves, deletes)
                        .await
                        .map_err(SyncError::from)
                }
            })
            .await
    }
}

/// Folds per-item write results into `report` and `succeeded`.
///
/// Deleting a record that is already gone counts as success. When
/// `conflicts` is given, saves rejected with a newer server change tag
/// are collected there for a resend instead of failing. Other failed
/// items stay pending; the first fatal one is returned.
fn absorb(
    record_type: &str,
    result: WriteResult,
    keys: &HashMap<RecordId, PrimaryKey>,
    succeeded: &mut HashSet<PrimaryKey>,
    report: &mut PushReport,
    mut conflicts: Option<&mut Vec<(RecordId, String)>>,
) -> Option<SyncError> {
    let mut fatal = None;
    let saved = result.saved.into_iter().map(|item| (item, false));
    let deleted = result.deleted.into_iter().map(|item| (item, true));

    for (item, is_delete) in saved.chain(deleted) {
        let Some(key) = keys.get(&item.record_id) else {
            warn!(record = %item.record_id, "write result for a record that was not sent");
            continue;
        };
        match item.result {
            Ok(()) => {}
            Err(error) if is_delete && error.kind == RemoteErrorKind::UnknownItem => {
                debug!(record_type, %key, "record already deleted remotely");
            }
            Err(error) => {
                if !is_delete && error.kind == RemoteErrorKind::ServerRecordChanged {
                    if let (Some(list), Some(tag)) = (conflicts.as_deref_mut(), &error.server_change_tag) {
                        list.push((item.record_id.clone(), tag.clone()));
                        continue;
                    }
                }
                warn!(record_type, %key, %error, "item not written, keeping it pending");
                if fatal.is_none() && !error.kind.is_transient() && !error.kind.is_recoverable() {
                    fatal = Some(SyncError::Remote(error.clone()));
                }
                report.failed.push(FailedItem {
                    record_type: record_type.to_string(),
                    key: key.clone(),
                    error,
                });
                continue;
            }
        }
        succeeded.insert(key.clone());
        if is_delete {
            report.deleted += 1;
        } else {
            report.saved += 1;
        }
    }
    fatal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncDirection};
    use crate::entity::{Entity, PrimaryKeyKind};
    use crate::local::MemoryStore;
    use crate::memory_remote::{MemoryRemote, RemoteOp};
    use crate::schema::{FieldKind, ScalarKind};
    use zonesync_state::InMemoryBackend;

    fn note_schema() -> CollectionSchema {
        CollectionSchema::builder("Note", PrimaryKeyKind::String)
            .field("title", FieldKind::Scalar(ScalarKind::String))
            .build()
            .unwrap()
    }

    struct Fixture {
        remote: Arc<MemoryRemote>,
        local: Arc<MemoryStore>,
        coordinator: SyncCoordinator,
    }

    fn fixture(settings: SyncSettings) -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let local = Arc::new(MemoryStore::new());
        local.register("Note", PrimaryKeyKind::String);
        let coordinator = SyncCoordinator::builder(
            settings.with_retry(RetryConfig::immediate()),
            remote.clone(),
            local.clone(),
            Arc::new(InMemoryBackend::new()),
        )
        .with_collection(note_schema())
        .build()
        .unwrap();
        Fixture {
            remote,
            local,
            coordinator,
        }
    }

    fn zone() -> ZoneId {
        ZoneId::new("NotesZone")
    }

    #[test]
    fn duplicate_collections_are_rejected() {
        let result = SyncCoordinator::builder(
            SyncSettings::new("c", zone()),
            Arc::new(MemoryRemote::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryBackend::new()),
        )
        .with_collection(note_schema())
        .with_collection(note_schema())
        .build();
        assert!(matches!(result, Err(SyncError::Local(_))));
    }

    #[tokio::test]
    async fn unknown_collection_cannot_be_queued() {
        let f = fixture(SyncSettings::new("c", zone()));
        assert!(matches!(
            f.coordinator.enqueue_save("Tag", "x"),
            Err(SyncError::UnknownCollection(_))
        ));
    }

    #[tokio::test]
    async fn first_cycle_creates_zone_and_uploads_local_data() {
        let f = fixture(SyncSettings::new("c", zone()));
        f.local
            .insert(Entity::new("Note", "n1").with("title", "hello"))
            .unwrap();

        let report = f.coordinator.sync().await.unwrap();

        assert!(report.zone_created);
        assert_eq!(report.pushed_saves, 1);
        assert_eq!(f.coordinator.state(), SyncState::Synced);
        assert_eq!(f.coordinator.stats().cycles_completed, 1);
        assert!(f.remote.record(&RecordId::new("n1", zone())).is_some());
    }

    #[tokio::test]
    async fn upstream_only_never_pulls() {
        let f = fixture(SyncSettings::new("c", zone()).with_direction(SyncDirection::UpstreamOnly));
        f.coordinator.sync().await.unwrap();

        assert_eq!(f.remote.calls(RemoteOp::DatabaseChanges), 0);
        assert_eq!(f.remote.calls(RemoteOp::CreateSubscription), 0);
        assert_eq!(f.remote.calls(RemoteOp::CreateZone), 1);
    }

    #[tokio::test]
    async fn downstream_only_never_writes() {
        let f = fixture(SyncSettings::new("c", zone()).with_direction(SyncDirection::DownstreamOnly));
        f.remote.create_zone(&zone()).await.unwrap();
        f.coordinator.enqueue_save("Note", "n1").unwrap();

        f.coordinator.sync().await.unwrap();

        assert_eq!(f.remote.calls(RemoteOp::WriteRecords), 0);
        assert_eq!(f.remote.calls(RemoteOp::CreateZone), 1);
        assert_eq!(f.coordinator.collection("Note").unwrap().pending_len(), 1);
    }

    #[tokio::test]
    async fn subscription_failure_does_not_fail_the_cycle() {
        let f = fixture(SyncSettings::new("c", zone()));
        f.remote.fail_next(
            RemoteOp::CreateSubscription,
            RemoteError::new(RemoteErrorKind::PermissionFailure, "no"),
        );

        assert!(f.coordinator.sync().await.is_ok());
        f.coordinator.sync().await.unwrap();
        assert_eq!(f.remote.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn failed_cycle_is_recorded() {
        let f = fixture(SyncSettings::new("c", zone()));
        f.remote.fail_next(
            RemoteOp::CreateZone,
            RemoteError::new(RemoteErrorKind::NotAuthenticated, "signed out"),
        );

        assert!(f.coordinator.sync().await.is_err());
        assert_eq!(f.coordinator.state(), SyncState::Error);
        let stats = f.coordinator.stats();
        assert_eq!(stats.cycles_failed, 1);
        assert!(stats.last_error.is_some());
    }

    #[tokio::test]
    async fn spawned_cycle_reports_once() {
        let f = fixture(SyncSettings::new("c", zone()));
        let coordinator = Arc::new(f.coordinator);
        let (tx, rx) = oneshot::channel();

        coordinator
            .spawn_sync(move |result| {
                let _ = tx.send(result.is_ok());
            })
            .await
            .unwrap();

        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn reset_forces_full_resync() {
        let f = fixture(SyncSettings::new("c", zone()));
        f.coordinator.sync().await.unwrap();
        assert!(f.coordinator.cursor(&SyncScope::Database).unwrap().is_some());

        f.coordinator.reset().await.unwrap();
        assert!(f.coordinator.cursor(&SyncScope::Database).unwrap().is_none());

        let report = f.coordinator.sync().await.unwrap();
        assert!(report.zone_created);
    }

    #[test]
    fn absorb_treats_missing_delete_as_done() {
        let id = RecordId::new("gone", zone());
        let keys = HashMap::from([(id.clone(), PrimaryKey::from("gone"))]);
        let result = WriteResult {
            saved: vec![],
            deleted: vec![crate::remote::ItemResult {
                record_id: id,
                result: Err(RemoteError::new(RemoteErrorKind::UnknownItem, "missing")),
            }],
        };
        let mut succeeded = HashSet::new();
        let mut report = PushReport::new("Note");

        assert!(absorb("Note", result, &keys, &mut succeeded, &mut report, None).is_none());
        assert_eq!(report.deleted, 1);
        assert!(succeeded.contains(&PrimaryKey::from("gone")));
    }

    #[test]
    fn absorb_keeps_failed_items_pending() {
        let a = RecordId::new("a", zone());
        let b = RecordId::new("b", zone());
        let keys = HashMap::from([
            (a.clone(), PrimaryKey::from("a")),
            (b.clone(), PrimaryKey::from("b")),
        ]);
        let result = WriteResult {
            saved: vec![
                crate::remote::ItemResult {
                    record_id: a,
                    result: Err(RemoteError::new(RemoteErrorKind::QuotaExceeded, "full")),
                },
                crate::remote::ItemResult {
                    record_id: b,
                    result: Err(RemoteError::new(RemoteErrorKind::PermissionFailure, "no")),
                },
            ],
            deleted: vec![],
        };
        let mut succeeded = HashSet::new();
        let mut report = PushReport::new("Note");

        let fatal = absorb("Note", result, &keys, &mut succeeded, &mut report, None);
        assert!(matches!(fatal, Some(SyncError::Remote(e)) if e.kind == RemoteErrorKind::PermissionFailure));
        assert_eq!(report.failed.len(), 2);
        assert!(succeeded.is_empty());
    }

    #[test]
    fn absorb_collects_changed_server_records() {
        let id = RecordId::new("n1", zone());
        let keys = HashMap::from([(id.clone(), PrimaryKey::from("n1"))]);
        let changed = || WriteResult {
            saved: vec![crate::remote::ItemResult {
                record_id: id.clone(),
                result: Err(RemoteError::new(RemoteErrorKind::ServerRecordChanged, "changed")
                    .with_server_change_tag("tag-9")),
            }],
            deleted: vec![],
        };
        let mut succeeded = HashSet::new();
        let mut report = PushReport::new("Note");
        let mut conflicts = Vec::new();

        let fatal = absorb("Note", changed(), &keys, &mut succeeded, &mut report, Some(&mut conflicts));
        assert!(fatal.is_none());
        assert_eq!(conflicts, vec![(id.clone(), "tag-9".to_string())]);
        assert!(report.failed.is_empty());

        // a second rejection stays pending
        let fatal = absorb("Note", changed(), &keys, &mut succeeded, &mut report, None);
        assert!(fatal.is_none());
        assert_eq!(report.failed.len(), 1);
        assert!(succeeded.is_empty());
    }
}
