//! # ZoneSync Record
//!
//! The remote side of the data model: where records live, what they
//! contain, and how the change feed remembers its position.
//!
//! This crate provides:
//! - [`ZoneId`] / [`RecordId`] identities and the [`SyncScope`] of a change feed
//! - [`Cursor`], the opaque change-feed continuation token
//! - [`FieldValue`], the typed values a remote record can hold
//! - [`RemoteRecord`] with references and externalized assets
//! - CBOR encoding for everything the engine persists
//!
//! This is a pure data crate with no I/O operations.
//!
//! ## Usage
//!
//! ```
//! use zonesync_record::{Decode, Encode, FieldValue, RecordId, RemoteRecord, ZoneId};
//!
//! let zone = ZoneId::new("NotesZone");
//! let mut record = RemoteRecord::new("Note", RecordId::new("n-1", zone));
//! record.set("title", FieldValue::from("groceries"));
//!
//! let bytes = record.encode().unwrap();
//! let decoded = RemoteRecord::decode(&bytes).unwrap();
//! assert_eq!(record, decoded);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod encoding;
mod error;
mod ids;
mod record;
mod value;

pub use cursor::Cursor;
pub use encoding::{from_cbor, to_cbor, Decode, Encode};
pub use error::{CodecError, CodecResult};
pub use ids::{RecordId, SyncScope, ZoneId, DEFAULT_OWNER, DEFAULT_ZONE_NAME};
pub use record::{AssetRef, RecordReference, ReferenceAction, RemoteRecord};
pub use value::FieldValue;
