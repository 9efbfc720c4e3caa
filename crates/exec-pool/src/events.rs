//! Lifecycle event delivery
//!
//! A small observer registry: every subscriber owns an unbounded channel, so
//! emitting never blocks and never drops events for a live subscriber.
//! Subscriptions unregister themselves when dropped.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct Registry<E> {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<E>>,
}

/// Fan-out event bus with explicit subscription handles
pub struct EventBus<E> {
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                senders: HashMap::new(),
            })),
        }
    }

    /// Register a new listener
    pub fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.senders.insert(id, tx);

        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every current listener
    pub fn emit(&self, event: E) {
        let mut registry = self.registry.lock();
        // Receivers dropped without unsubscribe are pruned lazily
        registry
            .senders
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live listeners
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().senders.len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a registered listener
///
/// Events are received in emission order. Dropping the handle unsubscribes.
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
    registry: Weak<Mutex<Registry<E>>>,
}

impl<E> Subscription<E> {
    /// Wait for the next event
    ///
    /// Returns `None` once the bus has been dropped and all buffered events
    /// have been consumed.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    /// Take the next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    /// Drain every buffered event
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().senders.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_receives_in_order() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.emit(1);
        bus.emit(2);

        assert_eq!(a.drain(), vec![1, 2]);
        assert_eq!(b.drain(), vec![1, 2]);
    }

    #[test]
    fn test_late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.emit("before");
        let mut sub = bus.subscribe();
        bus.emit("after");

        assert_eq!(sub.drain(), vec!["after"]);
    }

    #[test]
    fn test_unsubscribe_removes_listener() {
        let bus: EventBus<u8> = EventBus::new();
        let a = bus.subscribe();
        let _b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        a.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_drop_removes_listener() {
        let bus: EventBus<u8> = EventBus::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(7);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit(42);
        drop(bus);

        assert_eq!(sub.try_recv(), Some(42));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_recv_ends_when_bus_dropped() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        bus.emit("last");
        drop(bus);

        assert_eq!(sub.recv().await, Some("last"));
        assert_eq!(sub.recv().await, None);
    }
}
