//! Zone and record identities.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Zone name of the un-partitioned default zone.
pub const DEFAULT_ZONE_NAME: &str = "_defaultZone";

/// Owner name standing for "the current user".
pub const DEFAULT_OWNER: &str = "__defaultOwner__";

/// Identifies a zone: a partition of the remote store with its own
/// change feed and atomic-write boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ZoneId {
    /// Zone name, unique per owner.
    pub name: String,
    /// Owning user.
    pub owner: String,
}

impl ZoneId {
    /// Creates a zone owned by the current user.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_owner(name, DEFAULT_OWNER)
    }

    /// Creates a zone with an explicit owner.
    pub fn with_owner(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// The default (un-partitioned) zone.
    #[must_use]
    pub fn default_zone() -> Self {
        Self::new(DEFAULT_ZONE_NAME)
    }

    /// Returns true for the default zone, which has no change feed of
    /// its own and always exists.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_ZONE_NAME
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Identifies one record inside a zone.
///
/// The record name is derived deterministically from the local entity's
/// primary key, so writing the same entity twice addresses the same
/// remote record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    /// Record name, unique within the zone.
    pub name: String,
    /// Zone holding the record.
    pub zone: ZoneId,
}

impl RecordId {
    /// Creates a record identity.
    pub fn new(name: impl Into<String>, zone: ZoneId) -> Self {
        Self {
            name: name.into(),
            zone,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.zone, self.name)
    }
}

/// A change-feed partition whose cursor is tracked separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SyncScope {
    /// The database-wide feed listing which zones changed.
    Database,
    /// The per-zone feed listing changed and deleted records.
    Zone(ZoneId),
}

impl SyncScope {
    /// Returns the stable key this scope is persisted under.
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self {
            SyncScope::Database => "database".to_string(),
            SyncScope::Zone(zone) => format!("zone/{}/{}", zone.owner, zone.name),
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncScope::Database => f.write_str("database"),
            SyncScope::Zone(zone) => write!(f, "zone {zone}"),
        }
    }
}
