//! Binary asset collaborator.

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use zonesync_record::{AssetRef, RecordId};

/// Stores binary field contents outside their records.
pub trait AssetStore: Send + Sync {
    /// Stores `bytes` for `field` of `record_id` and returns a handle.
    ///
    /// The handle must be derived from the record identity and field name
    /// so that re-externalizing the same field replaces the old asset.
    fn externalize(&self, record_id: &RecordId, field: &str, bytes: &[u8]) -> SyncResult<AssetRef>;

    /// Loads the bytes behind a handle.
    fn fetch(&self, asset: &AssetRef) -> SyncResult<Vec<u8>>;
}

/// An in-memory asset store for testing.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    assets: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryAssetStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored assets.
    pub fn len(&self) -> usize {
        self.assets.read().len()
    }

    /// Returns true if no assets are stored.
    pub fn is_empty(&self) -> bool {
        self.assets.read().is_empty()
    }
}

impl AssetStore for MemoryAssetStore {
    fn externalize(&self, record_id: &RecordId, field: &str, bytes: &[u8]) -> SyncResult<AssetRef> {
        let key = format!(
            "{}/{}/{}/{}",
            record_id.zone.owner, record_id.zone.name, record_id.name, field
        );
        self.assets.write().insert(key.clone(), bytes.to_vec());
        Ok(AssetRef {
            key,
            size: bytes.len() as u64,
        })
    }

    fn fetch(&self, asset: &AssetRef) -> SyncResult<Vec<u8>> {
        self.assets
            .read()
            .get(&asset.key)
            .cloned()
            .ok_or_else(|| SyncError::Asset(format!("missing asset {}", asset.key)))
    }
}
