//! Mapping between local entities and remote records.
//!
//! ## Outgoing
//!
//! - Ignored fields are skipped
//! - Nulls and empty lists become explicit clears; they never carry a value
//! - Asset bytes go through the [`AssetStore`] and travel as handles
//! - Links become non-cascading references in the referenced collection's zone
//!
//! ## Incoming
//!
//! Incoming records are applied on top of the existing local entity.
//! A required field the record does not carry keeps its local value; an
//! optional one is emptied. Values whose type disagrees with the schema
//! are skipped with a warning, as are fields of unsupported kinds.

use crate::asset::AssetStore;
use crate::entity::{Entity, LocalValue, PrimaryKey, PrimaryKeyKind};
use crate::error::{SyncError, SyncResult};
use crate::local::LocalReader;
use crate::schema::{CollectionSchema, FieldDescriptor, FieldKind, ScalarKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use zonesync_record::{FieldValue, RecordId, RecordReference, RemoteRecord, ZoneId};

/// Parses a record name back into a primary key of the given scheme.
///
/// # Errors
///
/// `MalformedPrimaryKey` if an integer scheme meets a non-numeric name,
/// `UnsupportedPrimaryKey` for any scheme other than string or integer.
pub fn primary_key_for_record_id(
    collection: &str,
    kind: PrimaryKeyKind,
    record_id: &RecordId,
) -> SyncResult<PrimaryKey> {
    match kind {
        PrimaryKeyKind::String => Ok(PrimaryKey::String(record_id.name.clone())),
        PrimaryKeyKind::Int => record_id
            .name
            .parse::<i64>()
            .map(PrimaryKey::Int)
            .map_err(|_| SyncError::MalformedPrimaryKey {
                collection: collection.to_string(),
                value: record_id.name.clone(),
            }),
        PrimaryKeyKind::Unsupported => Err(SyncError::UnsupportedPrimaryKey {
            collection: collection.to_string(),
        }),
    }
}

/// Converts entities to records and back.
pub struct RecordCodec {
    assets: Arc<dyn AssetStore>,
    zones: HashMap<String, ZoneId>,
}

impl RecordCodec {
    /// Creates a codec that externalizes assets to `assets`.
    pub fn new(assets: Arc<dyn AssetStore>) -> Self {
        Self {
            assets,
            zones: HashMap::new(),
        }
    }

    /// Records the zone a collection's records live in, so references to
    /// its entities point at the right zone.
    pub fn register_zone(&mut self, collection: impl Into<String>, zone: ZoneId) {
        self.zones.insert(collection.into(), zone);
    }

    /// Returns the identity of the record mirroring `key`.
    pub fn record_id(key: &PrimaryKey, zone: &ZoneId) -> RecordId {
        RecordId::new(key.to_record_name(), zone.clone())
    }

    /// Builds the remote record for `entity` in `zone`.
    ///
    /// Fields the entity does not carry are omitted. A null value or an
    /// empty list is sent as an explicit clear, so the field is removed
    /// from the stored record instead of surviving the merge of a partial
    /// save.
    ///
    /// # Errors
    ///
    /// Fails when a local value does not match its declared type or an
    /// asset cannot be externalized.
    pub fn to_remote(
        &self,
        schema: &CollectionSchema,
        zone: &ZoneId,
        entity: &Entity,
    ) -> SyncResult<RemoteRecord> {
        let id = Self::record_id(&entity.key, zone);
        let mut record = RemoteRecord::new(&schema.record_type, id);

        for field in schema.synced_fields() {
            let value = match entity.get(&field.name) {
                None => continue,
                Some(LocalValue::Null) => {
                    record.clear(&field.name);
                    continue;
                }
                Some(value) => value,
            };

            match &field.kind {
                FieldKind::Scalar(kind) => {
                    let converted = scalar_to_remote(*kind, value)
                        .ok_or_else(|| mismatch(schema, field, value))?;
                    record.set(&field.name, converted);
                }
                FieldKind::List(kind) => {
                    let LocalValue::List(items) = value else {
                        return Err(mismatch(schema, field, value));
                    };
                    if items.is_empty() {
                        record.clear(&field.name);
                        continue;
                    }
                    let converted = items
                        .iter()
                        .map(|item| {
                            scalar_to_remote(*kind, item).ok_or_else(|| mismatch(schema, field, item))
                        })
                        .collect::<SyncResult<Vec<_>>>()?;
                    record.set(&field.name, FieldValue::List(converted));
                }
                FieldKind::Asset => {
                    let LocalValue::Bytes(bytes) = value else {
                        return Err(mismatch(schema, field, value));
                    };
                    let asset = self.assets.externalize(&record.id, &field.name, bytes)?;
                    record.set(&field.name, FieldValue::Asset(asset));
                }
                FieldKind::Reference { collection } => {
                    let LocalValue::Link(target) = value else {
                        return Err(mismatch(schema, field, value));
                    };
                    let target_zone = self.zones.get(collection).unwrap_or(zone);
                    let reference = RecordReference::new(Self::record_id(target, target_zone));
                    record.set(&field.name, FieldValue::Reference(reference));
                }
                FieldKind::Unsupported(type_name) => {
                    warn!(
                        record_type = %schema.record_type,
                        field = %field.name,
                        type_name = %type_name,
                        "field type not supported, not uploaded"
                    );
                }
            }
        }

        Ok(record)
    }

    /// Rebuilds the local entity for `record`, starting from the existing
    /// entity when `reader` has one.
    ///
    /// # Errors
    ///
    /// Fails on a record name or reference that cannot be mapped to a
    /// primary key, on references to unknown collections, and when an
    /// asset cannot be fetched.
    pub fn from_remote<R>(
        &self,
        schema: &CollectionSchema,
        record: &RemoteRecord,
        reader: &R,
    ) -> SyncResult<Entity>
    where
        R: LocalReader + ?Sized,
    {
        let key = primary_key_for_record_id(&schema.record_type, schema.primary_key, &record.id)?;
        let mut entity = reader
            .get(&schema.record_type, &key)?
            .unwrap_or_else(|| Entity::new(&schema.record_type, key));

        for field in schema.synced_fields() {
            let Some(value) = record.get(&field.name) else {
                match field.kind {
                    FieldKind::List(_) => entity.set(&field.name, LocalValue::List(Vec::new())),
                    FieldKind::Unsupported(_) => {}
                    _ if field.optional => entity.set(&field.name, LocalValue::Null),
                    _ => {}
                }
                continue;
            };

            let converted = match &field.kind {
                FieldKind::Scalar(kind) => scalar_from_remote(*kind, value),
                FieldKind::List(kind) => match value {
                    FieldValue::List(items) => items
                        .iter()
                        .map(|item| scalar_from_remote(*kind, item))
                        .collect::<Option<Vec<_>>>()
                        .map(LocalValue::List),
                    _ => None,
                },
                FieldKind::Asset => match value {
                    FieldValue::Asset(asset) => Some(LocalValue::Bytes(self.assets.fetch(asset)?)),
                    _ => None,
                },
                FieldKind::Reference { collection } => match value {
                    FieldValue::Reference(reference) => {
                        let kind = reader
                            .primary_key_kind(collection)
                            .ok_or_else(|| SyncError::UnknownCollection(collection.clone()))?;
                        let target = primary_key_for_record_id(collection, kind, &reference.record_id)?;
                        Some(LocalValue::Link(target))
                    }
                    _ => None,
                },
                FieldKind::Unsupported(type_name) => {
                    warn!(
                        record_type = %schema.record_type,
                        field = %field.name,
                        type_name = %type_name,
                        "field type not supported, dropped"
                    );
                    continue;
                }
            };

            match converted {
                Some(local) => entity.set(&field.name, local),
                None => warn!(
                    record_type = %schema.record_type,
                    field = %field.name,
                    remote_type = value.type_name(),
                    "remote value does not match declared type, left unchanged"
                ),
            }
        }

        Ok(entity)
    }
}

impl std::fmt::Debug for RecordCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCodec")
            .field("zones", &self.zones)
            .finish_non_exhaustive()
    }
}

fn mismatch(schema: &CollectionSchema, field: &FieldDescriptor, value: &LocalValue) -> SyncError {
    SyncError::schema(
        &schema.record_type,
        &field.name,
        format!("declared {:?}, found {value:?}", field.kind),
    )
}

fn scalar_to_remote(kind: ScalarKind, value: &LocalValue) -> Option<FieldValue> {
    match (kind, value) {
        (ScalarKind::Int, LocalValue::Int(n)) => Some(FieldValue::Int(*n)),
        (ScalarKind::Double, LocalValue::Double(n)) => Some(FieldValue::Double(*n)),
        (ScalarKind::Bool, LocalValue::Bool(b)) => Some(FieldValue::Bool(*b)),
        (ScalarKind::String, LocalValue::String(s)) => Some(FieldValue::String(s.clone())),
        (ScalarKind::Bytes, LocalValue::Bytes(b)) => Some(FieldValue::Bytes(b.clone())),
        (ScalarKind::Date, LocalValue::Date(ms)) => Some(FieldValue::Date(*ms)),
        _ => None,
    }
}

fn scalar_from_remote(kind: ScalarKind, value: &FieldValue) -> Option<LocalValue> {
    match (kind, value) {
        (ScalarKind::Int, FieldValue::Int(n)) => Some(LocalValue::Int(*n)),
        (ScalarKind::Double, FieldValue::Double(n)) => Some(LocalValue::Double(*n)),
        // The remote store may narrow whole doubles to integers.
        (ScalarKind::Double, FieldValue::Int(n)) => Some(LocalValue::Double(*n as f64)),
        (ScalarKind::Bool, FieldValue::Bool(b)) => Some(LocalValue::Bool(*b)),
        (ScalarKind::String, FieldValue::String(s)) => Some(LocalValue::String(s.clone())),
        (ScalarKind::Bytes, FieldValue::Bytes(b)) => Some(LocalValue::Bytes(b.clone())),
        (ScalarKind::Date, FieldValue::Date(ms)) => Some(LocalValue::Date(*ms)),
        _ => None,
    }
}
