//! Opaque change-feed cursors.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque continuation token issued by the remote change feed.
///
/// Cursors are never compared, ordered or parsed. They are stored,
/// replayed to the remote service, and cleared. Absence of a cursor
/// (`None` at the call site) means "resync from the beginning".
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(Bytes);

impl Cursor {
    /// Wraps raw token bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the token length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the token has no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cursor({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Cursor {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_keeps_bytes_verbatim() {
        let cursor = Cursor::from_bytes(vec![0, 1, 2, 255]);
        assert_eq!(cursor.as_bytes(), &[0, 1, 2, 255]);
        assert_eq!(cursor.len(), 4);
        assert!(!cursor.is_empty());
    }

    #[test]
    fn debug_hides_contents() {
        let cursor = Cursor::from(b"secret-ish".to_vec());
        assert_eq!(format!("{cursor:?}"), "Cursor(10 bytes)");
    }
}
