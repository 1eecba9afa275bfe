//! Classification of remote failures.
//!
//! Every remote call result is reduced to one of four outcomes:
//!
//! | outcome | meaning | who handles it |
//! |---|---|---|
//! | `Success` | no error | - |
//! | `RetryAfter(d)` | transient; wait `d` and re-issue | [`RetryDriver`](crate::RetryDriver) |
//! | `Recoverable(reason)` | semantic; a known recovery action exists | the caller of the driver |
//! | `Fatal` | no recovery; surfaces unchanged | the cycle's caller |

use crate::config::RetryConfig;
use crate::error::{RemoteError, RemoteErrorKind};
use std::time::Duration;

/// Why a failure is recoverable, naming its recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoverableReason {
    /// Clear the scope's cursor and restart discovery empty.
    CursorExpired,
    /// Recreate the zone (it is missing or the user deleted it).
    ZoneNotFound,
    /// Keep the items pending until the account has room.
    QuotaExceeded,
    /// The item is already gone.
    UnknownItem,
    /// The remote copy changed underneath the write.
    ServerRecordChanged,
    /// Send fewer items per call.
    LimitExceeded,
    /// Inspect per-item results.
    PartialFailure,
}

/// Classified result of one remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The call succeeded.
    Success,
    /// Transient failure; re-issue after the wait.
    RetryAfter(Duration),
    /// Semantic failure with a recovery action.
    Recoverable(RecoverableReason),
    /// Not retryable.
    Fatal,
}

/// Classifies the result of a remote call.
///
/// `attempt` is the number of consecutive failures of this call so far
/// (1 for the first failure); it drives the exponential backoff used
/// when the service gives no hint. Throttling errors without a hint wait
/// at least [`RetryConfig::default_retry_after`].
pub fn classify(error: Option<&RemoteError>, attempt: u32, retry: &RetryConfig) -> Outcome {
    let Some(error) = error else {
        return Outcome::Success;
    };

    let backoff = retry.delay_for_attempt(attempt.max(1));
    match error.kind {
        RemoteErrorKind::NetworkUnavailable | RemoteErrorKind::NetworkFailure => {
            Outcome::RetryAfter(error.retry_after.unwrap_or(backoff))
        }
        RemoteErrorKind::ServiceUnavailable
        | RemoteErrorKind::RequestRateLimited
        | RemoteErrorKind::ZoneBusy => Outcome::RetryAfter(
            error
                .retry_after
                .unwrap_or_else(|| backoff.max(retry.default_retry_after)),
        ),
        RemoteErrorKind::ChangeTokenExpired => {
            Outcome::Recoverable(RecoverableReason::CursorExpired)
        }
        RemoteErrorKind::ZoneNotFound | RemoteErrorKind::UserDeletedZone => {
            Outcome::Recoverable(RecoverableReason::ZoneNotFound)
        }
        RemoteErrorKind::QuotaExceeded => Outcome::Recoverable(RecoverableReason::QuotaExceeded),
        RemoteErrorKind::UnknownItem => Outcome::Recoverable(RecoverableReason::UnknownItem),
        RemoteErrorKind::ServerRecordChanged => {
            Outcome::Recoverable(RecoverableReason::ServerRecordChanged)
        }
        RemoteErrorKind::LimitExceeded => Outcome::Recoverable(RecoverableReason::LimitExceeded),
        RemoteErrorKind::PartialFailure => {
            Outcome::Recoverable(RecoverableReason::PartialFailure)
        }
        RemoteErrorKind::NotAuthenticated
        | RemoteErrorKind::PermissionFailure
        | RemoteErrorKind::BadRequest
        | RemoteErrorKind::IncompatibleVersion
        | RemoteErrorKind::InternalError
        | RemoteErrorKind::Other => Outcome::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry() -> RetryConfig {
        RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(10))
            .with_default_retry_after(Duration::from_secs(3))
            .with_jitter(false)
    }

    fn err(kind: RemoteErrorKind) -> RemoteError {
        RemoteError::new(kind, "test")
    }

    #[test]
    fn no_error_is_success() {
        assert_eq!(classify(None, 0, &retry()), Outcome::Success);
    }

    #[test]
    fn server_hint_wins() {
        let e = err(RemoteErrorKind::RequestRateLimited).with_retry_after(Duration::from_secs(7));
        assert_eq!(classify(Some(&e), 1, &retry()), Outcome::RetryAfter(Duration::from_secs(7)));

        let e = err(RemoteErrorKind::NetworkFailure).with_retry_after(Duration::from_millis(5));
        assert_eq!(classify(Some(&e), 4, &retry()), Outcome::RetryAfter(Duration::from_millis(5)));
    }

    #[test]
    fn network_errors_back_off_exponentially() {
        let e = err(RemoteErrorKind::NetworkUnavailable);
        assert_eq!(classify(Some(&e), 1, &retry()), Outcome::RetryAfter(Duration::from_millis(100)));
        assert_eq!(classify(Some(&e), 3, &retry()), Outcome::RetryAfter(Duration::from_millis(400)));
    }

    #[test]
    fn throttling_without_hint_uses_floor() {
        let e = err(RemoteErrorKind::ZoneBusy);
        assert_eq!(classify(Some(&e), 1, &retry()), Outcome::RetryAfter(Duration::from_secs(3)));
        // backoff overtakes the floor eventually
        assert_eq!(classify(Some(&e), 8, &retry()), Outcome::RetryAfter(Duration::from_secs(10)));
    }

    #[test]
    fn recoverable_reasons() {
        let cases = [
            (RemoteErrorKind::ChangeTokenExpired, RecoverableReason::CursorExpired),
            (RemoteErrorKind::ZoneNotFound, RecoverableReason::ZoneNotFound),
            (RemoteErrorKind::UserDeletedZone, RecoverableReason::ZoneNotFound),
            (RemoteErrorKind::QuotaExceeded, RecoverableReason::QuotaExceeded),
            (RemoteErrorKind::UnknownItem, RecoverableReason::UnknownItem),
            (RemoteErrorKind::ServerRecordChanged, RecoverableReason::ServerRecordChanged),
            (RemoteErrorKind::LimitExceeded, RecoverableReason::LimitExceeded),
            (RemoteErrorKind::PartialFailure, RecoverableReason::PartialFailure),
        ];
        for (kind, reason) in cases {
            assert_eq!(classify(Some(&err(kind)), 1, &retry()), Outcome::Recoverable(reason));
        }
    }

    #[test]
    fn fatal_kinds() {
        for kind in [
            RemoteErrorKind::NotAuthenticated,
            RemoteErrorKind::PermissionFailure,
            RemoteErrorKind::BadRequest,
            RemoteErrorKind::IncompatibleVersion,
            RemoteErrorKind::InternalError,
            RemoteErrorKind::Other,
        ] {
            assert_eq!(classify(Some(&err(kind)), 1, &retry()), Outcome::Fatal);
        }
    }

    #[test]
    fn agrees_with_error_kind_helpers() {
        let e = err(RemoteErrorKind::ServiceUnavailable);
        assert!(matches!(classify(Some(&e), 1, &retry()), Outcome::RetryAfter(_)));
        assert!(e.kind.is_transient());
    }
}
