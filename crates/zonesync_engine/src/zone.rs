//! Zone and subscription management.
//!
//! Both steps are remembered by a persisted flag so they run once per
//! installation, not once per cycle:
//!
//! ```text
//! NotCreated --remote success--> Created
//!     ^                             |
//!     +--------- reset_zone --------+
//! ```
//!
//! Transient failures are retried in place; any other failure leaves the
//! flag unset so the next cycle starts over.

use crate::config::{DatabaseScope, SyncSettings};
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteService, Subscription, SubscriptionTarget};
use crate::retry::RetryDriver;
use std::sync::Arc;
use tracing::{debug, info};
use zonesync_record::ZoneId;
use zonesync_state::StateBackend;

const ZONE_FLAG_PREFIX: &str = "flag/zone-created/";
const SUBSCRIPTION_FLAG_PREFIX: &str = "flag/subscription/";
const FLAG_SET: &[u8] = b"1";

/// Result of [`ZoneManager::ensure_zone_exists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneStatus {
    /// The flag was already set; no remote call was made.
    AlreadyCreated,
    /// The zone was created by this call.
    Created,
}

/// Creates the configured zone and subscriptions exactly once.
pub struct ZoneManager {
    zone: ZoneId,
    scope: DatabaseScope,
    subscription_id: String,
    remote: Arc<dyn RemoteService>,
    backend: Arc<dyn StateBackend>,
    retry: RetryDriver,
}

impl ZoneManager {
    /// Creates a manager for the zone and subscription named in `settings`.
    pub fn new(
        settings: &SyncSettings,
        remote: Arc<dyn RemoteService>,
        backend: Arc<dyn StateBackend>,
    ) -> Self {
        Self {
            zone: settings.zone.clone(),
            scope: settings.scope,
            subscription_id: settings.subscription_id.clone(),
            remote,
            backend,
            retry: RetryDriver::new(settings.retry.clone()),
        }
    }

    /// Returns the managed zone.
    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    fn zone_flag(&self) -> String {
        format!("{ZONE_FLAG_PREFIX}{}/{}", self.zone.owner, self.zone.name)
    }

    fn subscription_flag(id: &str) -> String {
        format!("{SUBSCRIPTION_FLAG_PREFIX}{id}")
    }

    /// Returns true if the zone is known to exist remotely.
    ///
    /// The default zone always exists.
    pub fn is_zone_created(&self) -> SyncResult<bool> {
        if self.zone.is_default() {
            return Ok(true);
        }
        Ok(self.backend.contains(&self.zone_flag())?)
    }

    /// Creates the zone unless the flag says it exists.
    ///
    /// # Errors
    ///
    /// Any non-transient failure of the create call; the flag stays unset.
    pub async fn ensure_zone_exists(&self) -> SyncResult<ZoneStatus> {
        if self.is_zone_created()? {
            return Ok(ZoneStatus::AlreadyCreated);
        }

        let remote = &self.remote;
        let zone = &self.zone;
        self.retry
            .run("create zone", move |_| async move {
                remote.create_zone(zone).await.map_err(SyncError::from)
            })
            .await
            .map_err(SyncError::from)?;

        self.backend.put(&self.zone_flag(), FLAG_SET)?;
        info!(%zone, "zone created");
        Ok(ZoneStatus::Created)
    }

    /// Forgets that the zone exists; the next cycle recreates it.
    pub fn reset_zone(&self) -> SyncResult<()> {
        debug!(zone = %self.zone, "resetting zone flag");
        self.backend.remove(&self.zone_flag())?;
        Ok(())
    }

    /// Returns true if the subscription `id` is known to exist.
    pub fn is_subscribed(&self, id: &str) -> SyncResult<bool> {
        Ok(self.backend.contains(&Self::subscription_flag(id))?)
    }

    /// Lists the subscriptions the configured scope needs.
    ///
    /// The private scope watches the whole database with one
    /// subscription; the public scope has no database-wide feed and gets
    /// one per record type.
    pub fn planned_subscriptions<S: AsRef<str>>(&self, record_types: &[S]) -> Vec<Subscription> {
        match self.scope {
            DatabaseScope::Private => vec![Subscription {
                id: self.subscription_id.clone(),
                target: SubscriptionTarget::Database,
                silent: true,
            }],
            DatabaseScope::Public => record_types
                .iter()
                .map(|record_type| Subscription {
                    id: format!("{}.{}", self.subscription_id, record_type.as_ref()),
                    target: SubscriptionTarget::RecordType(record_type.as_ref().to_string()),
                    silent: true,
                })
                .collect(),
        }
    }

    /// Creates every missing subscription and returns how many were
    /// created.
    ///
    /// Stops at the first failure; subscriptions created before it keep
    /// their flags.
    pub async fn ensure_subscriptions<S: AsRef<str>>(&self, record_types: &[S]) -> SyncResult<usize> {
        let mut created = 0;
        for subscription in self.planned_subscriptions(record_types) {
            if self.is_subscribed(&subscription.id)? {
                continue;
            }

            let remote = &self.remote;
            let target = &subscription;
            self.retry
                .run("create subscription", move |_| async move {
                    remote
                        .create_subscription(target)
                        .await
                        .map_err(SyncError::from)
                })
                .await
                .map_err(SyncError::from)?;

            self.backend
                .put(&Self::subscription_flag(&subscription.id), FLAG_SET)?;
            info!(id = %subscription.id, "subscription created");
            created += 1;
        }
        Ok(created)
    }
}

impl std::fmt::Debug for ZoneManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneManager")
            .field("zone", &self.zone)
            .field("scope", &self.scope)
            .field("subscription_id", &self.subscription_id)
            .finish_non_exhaustive()
    }
}
