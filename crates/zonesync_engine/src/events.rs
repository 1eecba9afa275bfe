//! Observable sync signals.

use tokio::sync::broadcast;
use tracing::trace;

/// A signal emitted by the coordinator for external observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Every collection pulled successfully.
    PullSucceeded,
    /// The pull failed; carries the first error's description.
    PullFailed {
        /// Error description.
        error: String,
    },
    /// One collection finished while others are still running.
    PullPartiallySucceeded {
        /// The collection that finished.
        record_type: String,
    },
    /// A collection's push batch was written.
    PushCompleted {
        /// The collection pushed.
        record_type: String,
        /// Records saved.
        saved: usize,
        /// Records deleted.
        deleted: usize,
    },
}

/// Broadcasts [`SyncEvent`]s to any number of subscribers.
///
/// Emitting never blocks and never fails; with no subscribers the event
/// is dropped. Slow subscribers observe `Lagged` from the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Emits an event.
    pub fn emit(&self, event: SyncEvent) {
        trace!(?event, "sync event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(SyncEvent::PullPartiallySucceeded {
            record_type: "Dog".into(),
        });
        bus.emit(SyncEvent::PullSucceeded);

        assert_eq!(
            rx.recv().await.unwrap(),
            SyncEvent::PullPartiallySucceeded {
                record_type: "Dog".into()
            }
        );
        assert_eq!(rx.recv().await.unwrap(), SyncEvent::PullSucceeded);
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        EventBus::new(0).emit(SyncEvent::PullSucceeded);
    }
}
