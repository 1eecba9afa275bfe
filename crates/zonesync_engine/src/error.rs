//! Error types for the sync engine.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use zonesync_record::CodecError;
use zonesync_state::StateError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure categories reported by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// No network route to the service.
    NetworkUnavailable,
    /// The connection failed mid-request.
    NetworkFailure,
    /// The service is temporarily down.
    ServiceUnavailable,
    /// The caller is being throttled.
    RequestRateLimited,
    /// Another writer holds the zone.
    ZoneBusy,
    /// A change cursor is too old to resume from.
    ChangeTokenExpired,
    /// The zone does not exist.
    ZoneNotFound,
    /// The user removed the zone from the remote store.
    UserDeletedZone,
    /// The account is out of storage.
    QuotaExceeded,
    /// The record does not exist.
    UnknownItem,
    /// The stored record has a newer change tag than the one written.
    ServerRecordChanged,
    /// The request carried too many items.
    LimitExceeded,
    /// Some items of a batch failed; see the per-item results.
    PartialFailure,
    /// No signed-in account.
    NotAuthenticated,
    /// The account may not perform the operation.
    PermissionFailure,
    /// The request was malformed.
    BadRequest,
    /// Client and service disagree on the protocol version.
    IncompatibleVersion,
    /// The service failed internally.
    InternalError,
    /// Anything not listed above.
    Other,
}

/// A failure reported by the remote service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Failure category.
    pub kind: RemoteErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Wait suggested by the service before retrying.
    pub retry_after: Option<Duration>,
    /// Change tag of the stored record, for `ServerRecordChanged`.
    pub server_change_tag: Option<String>,
}

impl RemoteError {
    /// Creates an error without a retry hint.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            server_change_tag: None,
        }
    }

    /// Attaches a server-suggested retry delay.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Attaches the change tag of the record the service holds.
    #[must_use]
    pub fn with_server_change_tag(mut self, tag: impl Into<String>) -> Self {
        self.server_change_tag = Some(tag.into());
        self
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(delay) = self.retry_after {
            write!(f, " (retry after {delay:?})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote service reported a failure.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Local data does not match the declared collection schema.
    #[error("schema mismatch in {collection}.{field}: {message}")]
    Schema {
        /// Collection (record type).
        collection: String,
        /// Field name.
        field: String,
        /// What did not match.
        message: String,
    },

    /// A record name could not be turned back into a primary key.
    #[error("malformed primary key {value:?} for {collection}")]
    MalformedPrimaryKey {
        /// Collection (record type).
        collection: String,
        /// Offending record name.
        value: String,
    },

    /// The collection's primary key is neither a string nor an integer.
    #[error("{collection} has an unsupported primary key type")]
    UnsupportedPrimaryKey {
        /// Collection (record type).
        collection: String,
    },

    /// No collection with this name is registered.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// Asset externalization or retrieval failed.
    #[error("asset error: {0}")]
    Asset(String),

    /// Persisted sync state could not be read or written.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// A persisted structure could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The local store rejected an operation.
    #[error("local store error: {0}")]
    Local(String),

    /// A background task ended without reporting.
    #[error("sync task aborted: {0}")]
    TaskAborted(String),

    /// The configured retry bound was reached.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// The last failure.
        last: RemoteError,
    },
}

impl SyncError {
    /// Creates a schema mismatch error.
    pub fn schema(
        collection: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Schema {
            collection: collection.into(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns the remote failure, if this error wraps one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            SyncError::Remote(e) => Some(e),
            SyncError::RetriesExhausted { last, .. } => Some(last),
            _ => None,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.kind.is_transient(),
            _ => false,
        }
    }

    /// Returns true if this error aborts the operation without retry or
    /// automatic recovery.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Remote(e) => !e.kind.is_transient() && !e.kind.is_recoverable(),
            _ => true,
        }
    }
}

impl RemoteErrorKind {
    /// Transient failures: retried after a wait.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            RemoteErrorKind::NetworkUnavailable
                | RemoteErrorKind::NetworkFailure
                | RemoteErrorKind::ServiceUnavailable
                | RemoteErrorKind::RequestRateLimited
                | RemoteErrorKind::ZoneBusy
        )
    }

    /// Semantic failures with a known recovery action.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            RemoteErrorKind::ChangeTokenExpired
                | RemoteErrorKind::ZoneNotFound
                | RemoteErrorKind::UserDeletedZone
                | RemoteErrorKind::QuotaExceeded
                | RemoteErrorKind::UnknownItem
                | RemoteErrorKind::ServerRecordChanged
                | RemoteErrorKind::LimitExceeded
                | RemoteErrorKind::PartialFailure
        )
    }
}
