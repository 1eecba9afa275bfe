//! Fan-out completion tracking.

use crate::error::SyncError;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Called for every completion that is not the last one.
pub type PartialCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Called exactly once when every participant has reported.
pub type FinishedCallback = Box<dyn FnOnce(Option<SyncError>) + Send>;

/// What a call to [`FanoutTracker::complete`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutStatus {
    /// Others are still running.
    Partial {
        /// Participants yet to report.
        remaining: usize,
    },
    /// This was the last participant; the aggregate callback fired.
    Finished,
    /// The aggregate already fired; this completion was ignored.
    Ignored,
}

struct State {
    remaining: usize,
    first_error: Option<SyncError>,
    failures: usize,
    on_finished: Option<FinishedCallback>,
}

/// Joins N concurrent operations into one completion.
///
/// Counter, first error and the one-shot aggregate callback live behind
/// one lock, so each decrement is a single critical section. Callbacks
/// run after the lock is released.
pub struct FanoutTracker {
    state: Mutex<State>,
    on_partial: PartialCallback,
}

impl FanoutTracker {
    /// Creates a tracker expecting `total` completions.
    ///
    /// With `total == 0` the aggregate callback fires immediately.
    pub fn new(total: usize, on_partial: PartialCallback, on_finished: FinishedCallback) -> Self {
        let tracker = Self {
            state: Mutex::new(State {
                remaining: total,
                first_error: None,
                failures: 0,
                on_finished: Some(on_finished),
            }),
            on_partial,
        };
        if total == 0 {
            let callback = tracker.state.lock().on_finished.take();
            if let Some(callback) = callback {
                callback(None);
            }
        }
        tracker
    }

    /// Records the completion of one participant.
    pub fn complete(&self, label: &str, result: Result<(), SyncError>) -> FanoutStatus {
        let (status, fire) = {
            let mut state = self.state.lock();
            if state.remaining == 0 {
                (FanoutStatus::Ignored, None)
            } else {
                state.remaining -= 1;
                if let Err(e) = result {
                    state.failures += 1;
                    if state.first_error.is_none() {
                        state.first_error = Some(e);
                    } else {
                        debug!(label, error = %e, "additional fan-out failure");
                    }
                }
                if state.remaining == 0 {
                    let callback = state.on_finished.take();
                    let error = state.first_error.take();
                    if state.failures > 1 {
                        debug!(failures = state.failures, "fan-out finished with several failures");
                    }
                    (FanoutStatus::Finished, callback.map(|cb| (cb, error)))
                } else {
                    (
                        FanoutStatus::Partial {
                            remaining: state.remaining,
                        },
                        None,
                    )
                }
            }
        };

        match status {
            FanoutStatus::Ignored => warn!(label, "completion after fan-out finished"),
            FanoutStatus::Partial { .. } => (self.on_partial)(label),
            FanoutStatus::Finished => {
                if let Some((callback, error)) = fire {
                    callback(error);
                }
            }
        }
        status
    }

    /// Returns the number of participants yet to report.
    pub fn remaining(&self) -> usize {
        self.state.lock().remaining
    }
}

impl std::fmt::Debug for FanoutTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutTracker")
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Observed {
        partials: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        error: Arc<Mutex<Option<String>>>,
    }

    fn tracker(total: usize) -> (FanoutTracker, Observed) {
        let seen = Observed {
            partials: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
            error: Arc::new(Mutex::new(None)),
        };
        let partials = Arc::clone(&seen.partials);
        let finished = Arc::clone(&seen.finished);
        let error = Arc::clone(&seen.error);
        let tracker = FanoutTracker::new(
            total,
            Box::new(move |_| {
                partials.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |e| {
                finished.fetch_add(1, Ordering::SeqCst);
                *error.lock() = e.map(|e| e.to_string());
            }),
        );
        (tracker, seen)
    }

    #[test]
    fn zero_participants_fire_immediately() {
        let (tracker, seen) = tracker(0);
        assert_eq!(seen.finished.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.complete("late", Ok(())), FanoutStatus::Ignored);
        assert_eq!(seen.finished.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn partial_then_finished() {
        let (tracker, seen) = tracker(3);
        assert_eq!(tracker.complete("A", Ok(())), FanoutStatus::Partial { remaining: 2 });
        assert_eq!(tracker.complete("B", Ok(())), FanoutStatus::Partial { remaining: 1 });
        assert_eq!(seen.finished.load(Ordering::SeqCst), 0);
        assert_eq!(tracker.complete("C", Ok(())), FanoutStatus::Finished);

        assert_eq!(seen.partials.load(Ordering::SeqCst), 2);
        assert_eq!(seen.finished.load(Ordering::SeqCst), 1);
        assert!(seen.error.lock().is_none());
    }

    #[test]
    fn first_error_wins() {
        let (tracker, seen) = tracker(3);
        tracker.complete("A", Err(SyncError::Asset("first".into())));
        tracker.complete("B", Ok(()));
        tracker.complete("C", Err(SyncError::Asset("second".into())));

        assert_eq!(seen.finished.load(Ordering::SeqCst), 1);
        assert_eq!(seen.error.lock().as_deref(), Some("asset error: first"));
    }

    #[test]
    fn concurrent_completions_fire_once() {
        const N: usize = 64;
        let (tracker, seen) = tracker(N);
        let tracker = Arc::new(tracker);

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    let result = if i % 5 == 0 {
                        Err(SyncError::Asset(format!("fail {i}")))
                    } else {
                        Ok(())
                    };
                    tracker.complete("c", result)
                })
            })
            .collect();

        let finished = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|s| *s == FanoutStatus::Finished)
            .count();

        assert_eq!(finished, 1);
        assert_eq!(seen.finished.load(Ordering::SeqCst), 1);
        assert_eq!(seen.partials.load(Ordering::SeqCst), N - 1);
        assert!(seen.error.lock().is_some());
        assert_eq!(tracker.remaining(), 0);
    }
}
