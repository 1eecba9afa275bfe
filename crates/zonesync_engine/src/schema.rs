//! Statically declared collection schemas.
//!
//! Each synced collection declares its fields once, at registration time.
//! The codec walks this table instead of reflecting over the local store.

use crate::entity::PrimaryKeyKind;
use crate::error::{SyncError, SyncResult};
use std::collections::HashSet;

/// Scalar field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarKind {
    /// Signed integer.
    Int,
    /// Double-precision float.
    Double,
    /// Boolean.
    Bool,
    /// UTF-8 string.
    String,
    /// Inline bytes.
    Bytes,
    /// Milliseconds since the Unix epoch.
    Date,
}

/// Type of a declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// A single scalar.
    Scalar(ScalarKind),
    /// An ordered list of scalars.
    List(ScalarKind),
    /// Bytes stored outside the record.
    Asset,
    /// To-one link to an entity of `collection`.
    Reference {
        /// Referenced collection.
        collection: String,
    },
    /// A type this engine does not understand; skipped with a warning.
    Unsupported(String),
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name, shared by the local entity and the remote record.
    pub name: String,
    /// Field type.
    pub kind: FieldKind,
    /// Whether the field may be empty.
    pub optional: bool,
    /// Whether the field is excluded from sync.
    pub ignored: bool,
}

/// Field table of one synced collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    /// Record type; also the local collection name.
    pub record_type: String,
    /// Primary-key scheme.
    pub primary_key: PrimaryKeyKind,
    /// Declared fields in declaration order.
    pub fields: Vec<FieldDescriptor>,
    /// Names of fields excluded from sync, in declaration order.
    pub ignored: Vec<String>,
}

impl CollectionSchema {
    /// Starts a schema declaration.
    pub fn builder(record_type: impl Into<String>, primary_key: PrimaryKeyKind) -> SchemaBuilder {
        SchemaBuilder {
            record_type: record_type.into(),
            primary_key,
            fields: Vec::new(),
            ignored: Vec::new(),
        }
    }

    /// Returns a declared field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Iterates over fields that take part in sync.
    pub fn synced_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| !f.ignored)
    }
}

/// Builder for [`CollectionSchema`].
#[derive(Debug)]
pub struct SchemaBuilder {
    record_type: String,
    primary_key: PrimaryKeyKind,
    fields: Vec<FieldDescriptor>,
    ignored: Vec<String>,
}

impl SchemaBuilder {
    /// Declares a required field.
    #[must_use]
    pub fn field(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name.into(), kind, false)
    }

    /// Declares an optional field.
    #[must_use]
    pub fn optional(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name.into(), kind, true)
    }

    /// Excludes a declared field from sync.
    #[must_use]
    pub fn ignore(mut self, name: impl Into<String>) -> Self {
        self.ignored.push(name.into());
        self
    }

    fn push(mut self, name: String, kind: FieldKind, optional: bool) -> Self {
        self.fields.push(FieldDescriptor {
            name,
            kind,
            optional,
            ignored: false,
        });
        self
    }

    /// Validates and builds the schema.
    ///
    /// # Errors
    ///
    /// Fails on duplicate field names, on ignoring an undeclared field and
    /// on a primary-key scheme other than string or integer.
    pub fn build(mut self) -> SyncResult<CollectionSchema> {
        if self.primary_key == PrimaryKeyKind::Unsupported {
            return Err(SyncError::UnsupportedPrimaryKey {
                collection: self.record_type,
            });
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SyncError::schema(
                    &self.record_type,
                    &field.name,
                    "declared twice",
                ));
            }
        }

        for name in &self.ignored {
            let Some(field) = self.fields.iter_mut().find(|f| &f.name == name) else {
                return Err(SyncError::schema(
                    &self.record_type,
                    name,
                    "ignored but not declared",
                ));
            };
            field.ignored = true;
        }

        Ok(CollectionSchema {
            record_type: self.record_type,
            primary_key: self.primary_key,
            fields: self.fields,
            ignored: self.ignored,
        })
    }
}
