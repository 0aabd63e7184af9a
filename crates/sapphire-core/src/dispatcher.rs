//! In-process event signal bus
//!
//! Two signals: events applied from remote peers, and events broadcast by
//! this process. Subscribers register a callback per signal; delivery is
//! synchronous in the firing task, after the exchange lock has been
//! released. A subscriber that fails is logged and skipped so it can
//! never take down the firing task or starve the other subscribers.

use crate::event::EventRef;
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Remote events applied to the local registry
    ReceivedEvent,
    /// Local events broadcast to the exchange
    SentEvent,
}

type Handler = Box<dyn Fn(&EventRef) + Send + Sync>;

#[derive(Default)]
pub struct Dispatcher {
    received: RwLock<Vec<Handler>>,
    sent: RwLock<Vec<Handler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, signal: Signal, handler: impl Fn(&EventRef) + Send + Sync + 'static) {
        match signal {
            Signal::ReceivedEvent => self.received.write().push(Box::new(handler)),
            Signal::SentEvent => self.sent.write().push(Box::new(handler)),
        }
    }

    pub fn send(&self, signal: Signal, event: &EventRef) {
        let handlers = match signal {
            Signal::ReceivedEvent => self.received.read(),
            Signal::SentEvent => self.sent.read(),
        };

        for handler in handlers.iter() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("event subscriber failed on {}", event.event.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::KvEvent;
    use crate::origin::Origin;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_dispatch_by_signal() {
        let dispatcher = Dispatcher::new();
        let received = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(AtomicUsize::new(0));

        let r = received.clone();
        dispatcher.connect(Signal::ReceivedEvent, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        let s = sent.clone();
        dispatcher.connect(Signal::SentEvent, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let origin = Origin::generate();
        let event = EventRef::detached(KvEvent::new("o1", "k", json!(1), &origin));

        dispatcher.send(Signal::ReceivedEvent, &event);
        dispatcher.send(Signal::ReceivedEvent, &event);
        dispatcher.send(Signal::SentEvent, &event);

        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_subscriber_isolated() {
        let dispatcher = Dispatcher::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        dispatcher.connect(Signal::ReceivedEvent, |_| panic!("broken subscriber"));
        let counter = delivered.clone();
        dispatcher.connect(Signal::ReceivedEvent, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let origin = Origin::generate();
        let event = EventRef::detached(KvEvent::new("o1", "k", json!(1), &origin));

        // the failing subscriber is skipped, later ones still hear every
        // event, and the firing task survives
        dispatcher.send(Signal::ReceivedEvent, &event);
        dispatcher.send(Signal::ReceivedEvent, &event);

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }
}
