//! Retry driver.

use crate::classify::{classify, Outcome, RecoverableReason};
use crate::config::RetryConfig;
use crate::error::{RemoteError, SyncError};
use std::future::Future;
use tracing::{debug, warn};

/// Why the driver stopped without a result.
#[derive(Debug)]
pub enum Halt {
    /// The failure has a recovery action the caller must run.
    Recoverable {
        /// Recovery action.
        reason: RecoverableReason,
        /// The failure as reported.
        error: RemoteError,
    },
    /// The failure surfaces unchanged.
    Fatal(SyncError),
}

impl Halt {
    /// Returns the recoverable reason, if any.
    pub fn reason(&self) -> Option<RecoverableReason> {
        match self {
            Halt::Recoverable { reason, .. } => Some(*reason),
            Halt::Fatal(_) => None,
        }
    }
}

impl From<Halt> for SyncError {
    fn from(halt: Halt) -> Self {
        match halt {
            Halt::Recoverable { error, .. } => SyncError::Remote(error),
            Halt::Fatal(e) => e,
        }
    }
}

/// Re-issues an operation until it succeeds or fails non-transiently.
///
/// Only [`SyncError::Remote`] failures are classified; any other error
/// (schema mismatch, local store failure) is fatal. There is no retry
/// bound unless [`RetryConfig::max_attempts`] sets one.
#[derive(Debug, Clone)]
pub struct RetryDriver {
    config: RetryConfig,
}

impl RetryDriver {
    /// Creates a driver.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `op` until it returns something other than a transient
    /// failure.
    ///
    /// `op` receives the zero-based attempt number and must be safe to
    /// replay from the start.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, Halt>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut failures = 0u32;
        loop {
            let error = match op(failures).await {
                Ok(value) => {
                    if failures > 0 {
                        debug!(label, failures, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(SyncError::Remote(error)) => error,
                Err(other) => return Err(Halt::Fatal(other)),
            };
            failures += 1;

            match classify(Some(&error), failures, &self.config) {
                Outcome::RetryAfter(delay) => {
                    if self.config.is_exhausted(failures) {
                        warn!(label, failures, %error, "retry bound reached");
                        return Err(Halt::Fatal(SyncError::RetriesExhausted {
                            attempts: failures,
                            last: error,
                        }));
                    }
                    let delay = self.config.jittered(delay);
                    warn!(label, failures, ?delay, %error, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Outcome::Recoverable(reason) => {
                    debug!(label, ?reason, %error, "recoverable failure");
                    return Err(Halt::Recoverable { reason, error });
                }
                Outcome::Fatal | Outcome::Success => {
                    return Err(Halt::Fatal(SyncError::Remote(error)));
                }
            }
        }
    }
}
