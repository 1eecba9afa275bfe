//! # ZoneSync State
//!
//! Persisted key/blob state backends for ZoneSync.
//!
//! The sync engine keeps a handful of small values that must survive a
//! process restart: change cursors, the "zone created" and "subscription
//! created" flags, and the pending mutation queues of every collection.
//! Backends are **opaque blob stores** keyed by string. They do not
//! interpret the values they hold.
//!
//! ## Design Principles
//!
//! - Backends are simple key/blob maps (get, put, remove, flush)
//! - Every method takes `&self`; the backend serializes access internally
//! - Must be `Send + Sync` so concurrent completion handlers can share one
//! - There is no ordering guarantee across keys
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral state
//! - [`FileBackend`] - Append-only journal that replays on open
//!
//! ## Example
//!
//! ```rust
//! use zonesync_state::{StateBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.put("cursor/database", b"opaque").unwrap();
//! assert_eq!(backend.get("cursor/database").unwrap(), Some(b"opaque".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StateBackend;
pub use error::{StateError, StateResult};
pub use file::{FileBackend, JournalConfig};
pub use memory::InMemoryBackend;
