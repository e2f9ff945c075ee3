//! Asynchronous event broadcasting.
//!
//! Events are delivered to listeners on the bus's executor, never on the
//! broadcasting thread. With a [`SerialExecutor`](crate::executor::SerialExecutor)
//! every listener sees events in broadcast order.
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//! use talkvault_core::event::EventBus;
//! use talkvault_core::executor::SerialExecutor;
//!
//! #[derive(Debug)]
//! struct MessageAdded(u32);
//!
//! let bus = EventBus::new(Arc::new(SerialExecutor::new("events").unwrap()));
//! let receiver = bus.subscribe();
//! bus.broadcast(Arc::new(MessageAdded(7)));
//!
//! let event = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
//! assert_eq!(event.downcast_ref::<MessageAdded>().map(|e| e.0), Some(7));
//! ```

use crate::executor::Executor;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

/// Something that happened, delivered to every listener.
///
/// Implemented for every `Debug + Send + Sync + 'static` type.
pub trait Event: Any + Send + Sync + fmt::Debug {
    /// Access to the concrete event type.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync + fmt::Debug> Event for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn Event {
    /// Returns the event as `T` if that is its concrete type.
    #[must_use]
    pub fn downcast_ref<T: Event>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Returns true if the event's concrete type is `T`.
    #[must_use]
    pub fn is<T: Event>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// A shared event.
pub type EventRef = Arc<dyn Event>;

/// Receives broadcast events.
pub trait EventListener: Send + Sync {
    /// Called on the bus's executor for every broadcast event.
    fn event_occurred(&self, event: &EventRef);
}

type Listeners = Arc<RwLock<Vec<Arc<dyn EventListener>>>>;

/// Fans events out to registered listeners.
pub struct EventBus {
    listeners: Listeners,
    executor: Arc<dyn Executor>,
}

impl EventBus {
    /// Creates a bus delivering on `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            listeners: Arc::new(RwLock::new(Vec::new())),
            executor,
        }
    }

    /// Registers a listener.
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes a previously registered listener. Returns false if it was not
    /// registered.
    pub fn remove_listener(&self, listener: &Arc<dyn EventListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// Returns a receiver that gets every event broadcast from now on.
    ///
    /// The subscription is dropped at the first event after the receiver is.
    pub fn subscribe(&self) -> Receiver<EventRef> {
        let (sender, receiver) = mpsc::channel();
        self.add_listener(Arc::new(ChannelListener {
            sender: Mutex::new(Some(sender)),
        }));
        receiver
    }

    /// Queues `event` for delivery to the listeners registered when it is
    /// delivered.
    pub fn broadcast(&self, event: EventRef) {
        let listeners = Arc::clone(&self.listeners);
        self.executor.execute(Box::new(move || {
            let snapshot: Vec<Arc<dyn EventListener>> = listeners.read().clone();
            for listener in snapshot {
                listener.event_occurred(&event);
            }
        }));
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

struct ChannelListener {
    sender: Mutex<Option<Sender<EventRef>>>,
}

impl EventListener for ChannelListener {
    fn event_occurred(&self, event: &EventRef) {
        let mut sender = self.sender.lock();
        let disconnected = match sender.as_ref() {
            Some(s) => s.send(Arc::clone(event)).is_err(),
            None => false,
        };
        if disconnected {
            sender.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SerialExecutor;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    #[derive(Debug)]
    struct Other;

    fn bus() -> EventBus {
        EventBus::new(Arc::new(SerialExecutor::new("test-events").unwrap()))
    }

    #[test]
    fn delivers_in_broadcast_order() {
        let bus = bus();
        let rx = bus.subscribe();
        for i in 0..5 {
            bus.broadcast(Arc::new(Ping(i)));
        }
        for i in 0..5 {
            let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(event.downcast_ref::<Ping>(), Some(&Ping(i)));
        }
    }

    #[test]
    fn downcast_to_wrong_type_is_none() {
        let event: EventRef = Arc::new(Other);
        assert!(event.is::<Other>());
        assert!(event.downcast_ref::<Ping>().is_none());
    }

    #[test]
    fn removed_listener_gets_nothing() {
        struct Counter(Mutex<u32>);
        impl EventListener for Counter {
            fn event_occurred(&self, _event: &EventRef) {
                *self.0.lock() += 1;
            }
        }

        let bus = bus();
        let counter = Arc::new(Counter(Mutex::new(0)));
        let listener: Arc<dyn EventListener> = counter.clone();
        bus.add_listener(Arc::clone(&listener));
        assert!(bus.remove_listener(&listener));
        assert!(!bus.remove_listener(&listener));

        let rx = bus.subscribe();
        bus.broadcast(Arc::new(Ping(1)));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*counter.0.lock(), 0);
    }
}
