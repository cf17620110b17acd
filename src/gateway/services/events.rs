//! Fan-out of gateway notifications to subscribers.

use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Non-blocking publish/subscribe channel.
///
/// Every subscriber owns an unbounded queue, so publishing never waits on a
/// slow consumer. A subscriber that dropped its receiver is pruned on the
/// next publish.
#[derive(Debug)]
pub struct EventBus<T> {
    subscribers: Mutex<Vec<UnboundedSender<T>>>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> EventBus<T> {
    /// Creates a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and returns its receiving end.
    #[must_use]
    pub fn subscribe(&self) -> UnboundedReceiver<T> {
        let (sender, receiver) = unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        receiver
    }

    /// Delivers `event` to every live subscriber.
    pub fn publish(&self, event: &T) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Returns how many subscribers are currently registered.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_each_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(&7_u32);

        assert_eq!(first.try_recv().ok(), Some(7));
        assert_eq!(second.try_recv().ok(), Some(7));
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.publish(&"ping");

        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }
}
