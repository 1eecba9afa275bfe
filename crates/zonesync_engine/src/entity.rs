//! Local entities as the engine sees them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Primary key of a local entity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PrimaryKey {
    /// String key; maps 1:1 to the record name.
    String(String),
    /// Integer key; the record name is its decimal rendering.
    Int(i64),
}

impl PrimaryKey {
    /// Returns the key scheme.
    pub fn kind(&self) -> PrimaryKeyKind {
        match self {
            PrimaryKey::String(_) => PrimaryKeyKind::String,
            PrimaryKey::Int(_) => PrimaryKeyKind::Int,
        }
    }

    /// Renders the key as a remote record name.
    pub fn to_record_name(&self) -> String {
        match self {
            PrimaryKey::String(s) => s.clone(),
            PrimaryKey::Int(n) => n.to_string(),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::String(s) => write!(f, "{s:?}"),
            PrimaryKey::Int(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for PrimaryKey {
    fn from(s: &str) -> Self {
        PrimaryKey::String(s.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(s: String) -> Self {
        PrimaryKey::String(s)
    }
}

impl From<i64> for PrimaryKey {
    fn from(n: i64) -> Self {
        PrimaryKey::Int(n)
    }
}

impl From<i32> for PrimaryKey {
    fn from(n: i32) -> Self {
        PrimaryKey::Int(i64::from(n))
    }
}

/// The primary-key scheme a local collection declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimaryKeyKind {
    /// String keys.
    String,
    /// Integer keys.
    Int,
    /// Anything else; such collections cannot be synced or referenced.
    Unsupported,
}

/// A field value of a local entity.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalValue {
    /// Empty value of an optional field.
    Null,
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Raw bytes (also the local form of an asset).
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    /// Ordered list of scalars.
    List(Vec<LocalValue>),
    /// To-one link to an entity of another collection.
    Link(PrimaryKey),
}

impl From<bool> for LocalValue {
    fn from(b: bool) -> Self {
        LocalValue::Bool(b)
    }
}

impl From<i64> for LocalValue {
    fn from(n: i64) -> Self {
        LocalValue::Int(n)
    }
}

impl From<f64> for LocalValue {
    fn from(n: f64) -> Self {
        LocalValue::Double(n)
    }
}

impl From<&str> for LocalValue {
    fn from(s: &str) -> Self {
        LocalValue::String(s.to_string())
    }
}

impl From<String> for LocalValue {
    fn from(s: String) -> Self {
        LocalValue::String(s)
    }
}

impl From<Vec<u8>> for LocalValue {
    fn from(b: Vec<u8>) -> Self {
        LocalValue::Bytes(b)
    }
}

/// An instance of a local collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Collection (record type) the entity belongs to.
    pub collection: String,
    /// Identity within the collection.
    pub key: PrimaryKey,
    fields: BTreeMap<String, LocalValue>,
}

impl Entity {
    /// Creates an entity with no fields set.
    pub fn new(collection: impl Into<String>, key: impl Into<PrimaryKey>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<LocalValue>) -> Self {
        self.set(field, value);
        self
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&LocalValue> {
        self.fields.get(field)
    }

    /// Sets a field value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<LocalValue>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Iterates over set fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &LocalValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_names() {
        assert_eq!(PrimaryKey::from("abc").to_record_name(), "abc");
        assert_eq!(PrimaryKey::from(-42).to_record_name(), "-42");
        assert_eq!(PrimaryKey::from(7).kind(), PrimaryKeyKind::Int);
    }

    #[test]
    fn entity_fields() {
        let mut dog = Entity::new("Dog", 1).with("name", "Rex").with("age", 3i64);
        dog.set("age", LocalValue::Int(4));

        assert_eq!(dog.get("name"), Some(&LocalValue::from("Rex")));
        assert_eq!(dog.get("age"), Some(&LocalValue::Int(4)));
        assert_eq!(dog.fields().count(), 2);
        assert!(dog.get("owner").is_none());
    }
}
