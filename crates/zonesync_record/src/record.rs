//! Remote records.

use crate::ids::RecordId;
use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// What the remote store does to a referencing record when the
/// referenced record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceAction {
    /// Nothing; the reference dangles.
    None,
    /// The referencing record is deleted as well.
    DeleteSelf,
}

/// A to-one reference to another record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReference {
    /// Identity of the referenced record.
    pub record_id: RecordId,
    /// Cascade behavior.
    pub action: ReferenceAction,
}

impl RecordReference {
    /// Creates a non-cascading reference.
    #[must_use]
    pub fn new(record_id: RecordId) -> Self {
        Self {
            record_id,
            action: ReferenceAction::None,
        }
    }
}

/// Handle to a binary asset stored outside its record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRef {
    /// Key under which the asset store keeps the bytes.
    pub key: String,
    /// Size of the asset in bytes.
    pub size: u64,
}

/// A record as the remote store holds it.
///
/// The identity is deterministic (derived from the local primary key), so
/// replaying a write addresses the same record instead of creating a new
/// one. `change_tag` is the remote store's optimistic-concurrency token;
/// it is `None` for records that have not been saved yet.
///
/// Saving a record only touches the fields it carries. A field that is
/// simply absent keeps whatever the remote store already holds; a field
/// listed in `cleared` is removed remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Record type (one per mapped collection).
    pub record_type: String,
    /// Stable identity.
    pub id: RecordId,
    /// Concurrency token assigned by the remote store.
    pub change_tag: Option<String>,
    /// Field values; an absent key is an absent field.
    pub fields: BTreeMap<String, FieldValue>,
    /// Fields this write explicitly removes.
    #[serde(default)]
    pub cleared: BTreeSet<String>,
}

impl RemoteRecord {
    /// Creates an empty record.
    pub fn new(record_type: impl Into<String>, id: RecordId) -> Self {
        Self {
            record_type: record_type.into(),
            id,
            change_tag: None,
            fields: BTreeMap::new(),
            cleared: BTreeSet::new(),
        }
    }

    /// Returns the value of a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Sets a field, returning the previous value.
    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        let field = field.into();
        self.cleared.remove(&field);
        self.fields.insert(field, value)
    }

    /// Marks a field for explicit removal on the next save.
    pub fn clear(&mut self, field: impl Into<String>) {
        let field = field.into();
        self.fields.remove(&field);
        self.cleared.insert(field);
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    /// Returns true if the field is present.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Overwrites this record's fields with those present in `other` and
    /// drops the ones `other` clears.
    ///
    /// Fields absent from `other` are kept; this is how a partial save
    /// merges into the stored record.
    pub fn merge_fields(&mut self, other: &RemoteRecord) {
        for (name, value) in &other.fields {
            self.fields.insert(name.clone(), value.clone());
        }
        for name in &other.cleared {
            self.fields.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZoneId;

    fn record() -> RemoteRecord {
        RemoteRecord::new("Note", RecordId::new("1", ZoneId::new("NotesZone")))
    }

    #[test]
    fn field_access() {
        let mut r = record();
        assert!(r.set("title", "a".into()).is_none());
        assert_eq!(r.set("title", "b".into()), Some(FieldValue::from("a")));
        assert!(r.contains("title"));
        assert_eq!(r.remove("title"), Some(FieldValue::from("b")));
        assert!(!r.contains("title"));
    }

    #[test]
    fn merge_keeps_absent_fields() {
        let mut stored = record();
        stored.set("title", "old".into());
        stored.set("body", "kept".into());

        let mut incoming = record();
        incoming.set("title", "new".into());

        stored.merge_fields(&incoming);
        assert_eq!(stored.get("title"), Some(&FieldValue::from("new")));
        assert_eq!(stored.get("body"), Some(&FieldValue::from("kept")));
    }

    #[test]
    fn merge_applies_explicit_clears() {
        let mut stored = record();
        stored.set("title", "old".into());
        stored.set("body", "gone soon".into());

        let mut incoming = record();
        incoming.clear("body");
        assert!(!incoming.contains("body"));

        stored.merge_fields(&incoming);
        assert_eq!(stored.get("title"), Some(&FieldValue::from("old")));
        assert!(!stored.contains("body"));
    }

    #[test]
    fn set_undoes_clear() {
        let mut r = record();
        r.clear("body");
        r.set("body", "back".into());
        assert!(r.cleared.is_empty());
    }

    #[test]
    fn references_do_not_cascade_by_default() {
        let reference = RecordReference::new(RecordId::new("owner", ZoneId::new("Z")));
        assert_eq!(reference.action, ReferenceAction::None);
    }
}
