//! Typed remote field values.

use crate::record::{AssetRef, RecordReference};
use serde::{Deserialize, Serialize};

/// A value stored in a remote record field.
///
/// Lists hold scalars only. Absence of a field is expressed by omitting
/// the key from the record, never by a null value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Double(f64),
    /// Boolean.
    Bool(bool),
    /// UTF-8 string.
    String(String),
    /// Inline bytes.
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Date(i64),
    /// Ordered list of scalar values.
    List(Vec<FieldValue>),
    /// Binary asset stored outside the record.
    Asset(AssetRef),
    /// To-one reference to another record.
    Reference(RecordReference),
}

impl FieldValue {
    /// Returns a short name for the value's type, used in diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Int(_) => "int",
            FieldValue::Double(_) => "double",
            FieldValue::Bool(_) => "bool",
            FieldValue::String(_) => "string",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::Date(_) => "date",
            FieldValue::List(_) => "list",
            FieldValue::Asset(_) => "asset",
            FieldValue::Reference(_) => "reference",
        }
    }

    /// Returns true for values allowed inside a [`FieldValue::List`].
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        !matches!(
            self,
            FieldValue::List(_) | FieldValue::Asset(_) | FieldValue::Reference(_)
        )
    }

    /// Get this value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Get this value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as a list, if it is one.
    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Get this value as a reference, if it is one.
    pub fn as_reference(&self) -> Option<&RecordReference> {
        match self {
            FieldValue::Reference(r) => Some(r),
            _ => None,
        }
    }

    /// Get this value as an asset, if it is one.
    pub fn as_asset(&self) -> Option<&AssetRef> {
        match self {
            FieldValue::Asset(a) => Some(a),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Int(n)
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Int(i64::from(n))
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Double(n)
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::String(s)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        FieldValue::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RecordId, ZoneId};

    #[test]
    fn scalars_and_containers() {
        assert!(FieldValue::Int(1).is_scalar());
        assert!(FieldValue::Date(0).is_scalar());
        assert!(FieldValue::Bytes(vec![]).is_scalar());
        assert!(!FieldValue::List(vec![]).is_scalar());

        let reference = RecordReference::new(RecordId::new("a", ZoneId::new("Z")));
        assert!(!FieldValue::Reference(reference).is_scalar());
    }

    #[test]
    fn accessors() {
        assert_eq!(FieldValue::Int(42).as_int(), Some(42));
        assert_eq!(FieldValue::from("x").as_str(), Some("x"));
        assert_eq!(FieldValue::from("x").as_int(), None);
        assert_eq!(FieldValue::List(vec![1i64.into()]).as_list().map(<[_]>::len), Some(1));
    }

    #[test]
    fn from_impls() {
        assert_eq!(FieldValue::from(true), FieldValue::Bool(true));
        assert_eq!(FieldValue::from(42i32), FieldValue::Int(42));
        assert_eq!(FieldValue::from(1.5), FieldValue::Double(1.5));
        assert_eq!(FieldValue::from(vec![1u8, 2]), FieldValue::Bytes(vec![1, 2]));
    }

    #[test]
    fn type_names() {
        assert_eq!(FieldValue::Date(0).type_name(), "date");
        assert_eq!(FieldValue::Double(0.0).type_name(), "double");
    }
}
